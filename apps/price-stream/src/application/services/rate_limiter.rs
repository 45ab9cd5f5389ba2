//! Sliding-Window Rate Limiter
//!
//! Bounds outbound provider calls to `capacity` permits in any rolling
//! `window`. Every granted permit is logged with its grant time; a permit
//! becomes reusable exactly one window after it was granted.
//!
//! # Fairness
//!
//! Waiters queue on a `tokio::sync::Mutex`, which hands the lock out in
//! FIFO order. Only the head of the queue waits on the log, so a large
//! request cannot be starved by a stream of small ones. `try_acquire` may
//! take free permits past the queue, except while the head is parked
//! waiting for room.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Rate limiter errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// More permits were requested at once than the window can ever hold.
    #[error("requested {requested} permits but capacity is {capacity}")]
    ExceedsCapacity {
        /// Permits requested.
        requested: usize,
        /// Configured capacity.
        capacity: usize,
    },
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Maximum permits per window.
    pub capacity: usize,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Shared sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    grants: Mutex<VecDeque<Instant>>,
    turnstile: tokio::sync::Mutex<()>,
    /// Permits the head of the queue is parked on; zero when it is not asleep.
    /// Written under the `grants` lock.
    parked: AtomicUsize,
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            capacity: config.capacity,
            window: config.window,
            grants: Mutex::new(VecDeque::with_capacity(config.capacity)),
            turnstile: tokio::sync::Mutex::new(()),
            parked: AtomicUsize::new(0),
        }
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Grant `n` permits, waiting until the window has room.
    ///
    /// Returns how long the caller waited.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::ExceedsCapacity`] if `n > capacity`.
    pub async fn acquire(&self, n: usize) -> Result<Duration, RateLimitError> {
        self.check(n)?;
        if n == 0 {
            return Ok(Duration::ZERO);
        }

        let started = Instant::now();
        let _turn = self.turnstile.lock().await;
        let _parked = ParkedGuard(&self.parked);

        loop {
            let ready_at = {
                let mut grants = self.grants.lock();
                match self.grant_or_wait(&mut grants, n, Instant::now()) {
                    None => {
                        self.parked.store(0, Ordering::Relaxed);
                        return Ok(started.elapsed());
                    }
                    Some(ready_at) => {
                        self.parked.store(n, Ordering::Relaxed);
                        ready_at
                    }
                }
            };
            tokio::time::sleep_until(ready_at).await;
        }
    }

    /// Grant `n` permits only if the window has room right now.
    ///
    /// Refuses while a caller of [`acquire`](Self::acquire) is parked
    /// waiting for room, so it cannot be pushed back indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::ExceedsCapacity`] if `n > capacity`.
    pub fn try_acquire(&self, n: usize) -> Result<bool, RateLimitError> {
        self.check(n)?;
        if n == 0 {
            return Ok(true);
        }

        let turn = self.turnstile.try_lock();
        let mut grants = self.grants.lock();
        if turn.is_err() && self.parked.load(Ordering::Relaxed) != 0 {
            return Ok(false);
        }
        Ok(self.grant_or_wait(&mut grants, n, Instant::now()).is_none())
    }

    /// Permits that could be granted right now.
    #[must_use]
    pub fn available(&self) -> usize {
        let mut grants = self.grants.lock();
        self.prune(&mut grants, Instant::now());
        self.capacity.saturating_sub(grants.len())
    }

    const fn check(&self, n: usize) -> Result<(), RateLimitError> {
        if n > self.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                requested: n,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Record `n` grants at `now`, or return when enough old grants expire.
    fn grant_or_wait(&self, grants: &mut VecDeque<Instant>, n: usize, now: Instant) -> Option<Instant> {
        self.prune(grants, now);

        let in_use = grants.len();
        if in_use + n <= self.capacity {
            grants.extend(std::iter::repeat_n(now, n));
            return None;
        }

        // The oldest `needed` grants must expire before `n` fit.
        let needed = in_use + n - self.capacity;
        grants.get(needed - 1).map(|granted| *granted + self.window)
    }

    fn prune(&self, grants: &mut VecDeque<Instant>, now: Instant) {
        while grants.front().is_some_and(|granted| *granted + self.window <= now) {
            grants.pop_front();
        }
    }
}

/// Clears the parked marker when the head of the queue leaves, including on cancel.
struct ParkedGuard<'a>(&'a AtomicUsize);

impl Drop for ParkedGuard<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    fn limiter(capacity: usize, window_ms: u64) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimiterConfig {
            capacity,
            window: Duration::from_millis(window_ms),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn grants_up_to_capacity_without_waiting() {
        let limiter = limiter(3, 1000);

        for _ in 0..3 {
            assert_eq!(limiter.acquire(1).await.unwrap(), Duration::ZERO);
        }
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_oldest_grant_to_expire() {
        let limiter = limiter(2, 1000);
        limiter.acquire(1).await.unwrap();
        tokio::time::advance(Duration::from_millis(400)).await;
        limiter.acquire(1).await.unwrap();

        let start = Instant::now();
        limiter.acquire(1).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn multi_permit_request_waits_for_enough_room() {
        let limiter = limiter(3, 1000);
        limiter.acquire(1).await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        limiter.acquire(1).await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        limiter.acquire(1).await.unwrap();

        let start = Instant::now();
        limiter.acquire(2).await.unwrap();
        // Two oldest grants (t=0, t=100) must expire: ready at t=1100.
        assert_eq!(start.elapsed(), Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_permits_is_immediate() {
        let limiter = limiter(1, 1000);
        limiter.acquire(1).await.unwrap();
        assert_eq!(limiter.acquire(0).await.unwrap(), Duration::ZERO);
        assert!(limiter.try_acquire(0).unwrap());
    }

    #[tokio::test]
    async fn request_above_capacity_is_rejected() {
        let limiter = limiter(2, 1000);
        assert_eq!(
            limiter.acquire(3).await,
            Err(RateLimitError::ExceedsCapacity {
                requested: 3,
                capacity: 2
            })
        );
        assert!(limiter.try_acquire(3).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_refuses_when_full() {
        let limiter = limiter(1, 1000);
        assert!(limiter.try_acquire(1).unwrap());
        assert!(!limiter.try_acquire(1).unwrap());

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(limiter.try_acquire(1).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_takes_free_permits_while_an_acquirer_is_checking() {
        let limiter = limiter(2, 1000);
        let _head = limiter.turnstile.lock().await;

        assert!(limiter.try_acquire(1).unwrap());
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_yields_to_a_parked_acquirer() {
        let limiter = limiter(3, 1000);
        limiter.acquire(2).await.unwrap();

        let head = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(2).await.unwrap() })
        };
        tokio::task::yield_now().await;

        // One permit is free, but the parked head needs two.
        assert_eq!(limiter.available(), 1);
        assert!(!limiter.try_acquire(1).unwrap());

        assert_eq!(head.await.unwrap(), Duration::from_millis(1000));
        assert_eq!(limiter.available(), 1);
        assert!(limiter.try_acquire(1).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquirer_no_longer_blocks_try_acquire() {
        let limiter = limiter(3, 1000);
        limiter.acquire(2).await.unwrap();

        let head = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(2).await })
        };
        tokio::task::yield_now().await;
        assert!(!limiter.try_acquire(1).unwrap());

        head.abort();
        assert!(head.await.unwrap_err().is_cancelled());
        assert!(limiter.try_acquire(1).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_arrival_order() {
        let limiter = limiter(1, 100);
        limiter.acquire(1).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter.acquire(1).await.unwrap();
                order.lock().push(i);
            }));
            // Let each task enqueue before spawning the next.
            tokio::task::yield_now().await;
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_capacity() {
        let capacity = 5;
        let window = Duration::from_millis(200);
        let limiter = limiter(capacity, 200);
        let grants = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..40 {
            let limiter = Arc::clone(&limiter);
            let grants = Arc::clone(&grants);
            handles.push(tokio::spawn(async move {
                limiter.acquire(1).await.unwrap();
                grants.lock().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let grants = grants.lock().clone();
        assert_eq!(grants.len(), 40);
        for start in &grants {
            let in_window = grants
                .iter()
                .filter(|t| **t >= *start && **t < *start + window)
                .count();
            assert!(in_window <= capacity, "{in_window} grants within one window");
        }
    }

    proptest! {
        #[test]
        fn rolling_window_bound_holds(
            capacity in 1usize..6,
            requests in proptest::collection::vec((0u64..50, 1usize..4), 1..30),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async {
                let window = Duration::from_millis(100);
                let limiter = RateLimiter::new(RateLimiterConfig { capacity, window });
                let mut log: Vec<(Instant, usize)> = Vec::new();

                for (gap_ms, n) in requests {
                    tokio::time::advance(Duration::from_millis(gap_ms)).await;
                    let n = n.min(capacity);
                    limiter.acquire(n).await.unwrap();
                    log.push((Instant::now(), n));
                }

                for (start, _) in &log {
                    let total: usize = log
                        .iter()
                        .filter(|(t, _)| *t >= *start && *t < *start + window)
                        .map(|(_, n)| n)
                        .sum();
                    prop_assert!(total <= capacity);
                }
                Ok(())
            })?;
        }
    }
}
