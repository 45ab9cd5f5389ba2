//! Update Scheduler
//!
//! Two independent periodic jobs drive the pipeline: the daily-close job
//! (long period, waits for rate-limit permits) and the real-time job
//! (short period, skips when throttled).
//!
//! # State Machine
//!
//! ```text
//!        tick                    cycle done / abandoned
//! Idle ─────────► Running ─────────────────────────────► Idle
//!                    │ tick
//!                    └──► skipped (overrun counted)
//! ```
//!
//! Each tick spawns its cycle, so the timer keeps firing while a slow
//! cycle runs and overlapping ticks are dropped rather than queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::fetcher::PermitMode;
use super::pipeline::{CycleError, CycleReport, PricePipeline};
use crate::domain::pricing::PriceKind;
use crate::infrastructure::metrics::{self, CycleOutcome};

// =============================================================================
// Jobs
// =============================================================================

/// The two scheduled jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Daily close refresh.
    DailyClose,
    /// Real-time tick refresh.
    Realtime,
}

impl JobKind {
    /// Price kind the job fetches.
    #[must_use]
    pub const fn price_kind(self) -> PriceKind {
        match self {
            Self::DailyClose => PriceKind::DailyClose,
            Self::Realtime => PriceKind::Realtime,
        }
    }

    /// How the job obtains permits.
    #[must_use]
    pub const fn permit_mode(self) -> PermitMode {
        match self {
            Self::DailyClose => PermitMode::Wait,
            Self::Realtime => PermitMode::Skip,
        }
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DailyClose => "daily_close",
            Self::Realtime => "realtime",
        }
    }
}

/// Whether a job has a cycle in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for the next tick.
    Idle,
    /// A cycle is in flight.
    Running,
}

/// Timer settings of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSettings {
    /// Tick period.
    pub period: Duration,
    /// Wall-clock budget of one cycle.
    pub budget: Duration,
    /// How long a cycle keeps fetching. Shorter than `budget`, so
    /// unresolved symbols are reported as timeouts before the cycle is
    /// abandoned.
    pub batch_timeout: Duration,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Daily close job.
    pub daily: JobSettings,
    /// Real-time job.
    pub realtime: JobSettings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            daily: JobSettings {
                period: Duration::from_secs(86_400),
                budget: Duration::from_secs(600),
                batch_timeout: Duration::from_secs(570),
            },
            realtime: JobSettings {
                period: Duration::from_secs(5),
                budget: Duration::from_secs(30),
                batch_timeout: Duration::from_secs(25),
            },
        }
    }
}

/// Why a cycle did not produce a report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// The previous cycle of the job is still running.
    #[error("{} cycle already running", .0.as_str())]
    AlreadyRunning(JobKind),

    /// The cycle could not start.
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// The cycle exceeded its budget and was abandoned.
    #[error("cycle exceeded its budget of {0:?}")]
    BudgetExceeded(Duration),
}

// =============================================================================
// Job Slot
// =============================================================================

/// Snapshot of a job for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    /// Current state.
    pub state: JobState,
    /// Cycles that finished.
    pub completed: u64,
    /// Cycles skipped because the universe was unavailable.
    pub skipped: u64,
    /// Cycles abandoned after exceeding their budget.
    pub abandoned: u64,
    /// Ticks dropped because a cycle was still running.
    pub overruns: u64,
    /// Report of the last finished cycle.
    pub last_report: Option<CycleReport>,
    /// When the last cycle finished.
    pub last_finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct JobSlot {
    running: AtomicBool,
    completed: AtomicU64,
    skipped: AtomicU64,
    abandoned: AtomicU64,
    overruns: AtomicU64,
    last_report: Mutex<Option<(CycleReport, DateTime<Utc>)>>,
}

impl JobSlot {
    /// Move `Idle → Running`, or `None` if already running.
    fn try_begin(self: &Arc<Self>) -> Option<RunningGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard {
                slot: Arc::clone(self),
            })
    }

    fn status(&self) -> JobStatus {
        let last = *self.last_report.lock();
        JobStatus {
            state: if self.running.load(Ordering::Acquire) {
                JobState::Running
            } else {
                JobState::Idle
            },
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            last_report: last.map(|(report, _)| report),
            last_finished_at: last.map(|(_, at)| at),
        }
    }
}

/// Returns the slot to `Idle` when dropped, including on abort.
struct RunningGuard {
    slot: Arc<JobSlot>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.slot.running.store(false, Ordering::Release);
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Periodic driver of the price pipeline.
pub struct UpdateScheduler {
    pipeline: Arc<PricePipeline>,
    config: SchedulerConfig,
    daily: Arc<JobSlot>,
    realtime: Arc<JobSlot>,
    ready: AtomicBool,
}

impl UpdateScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(pipeline: Arc<PricePipeline>, config: SchedulerConfig) -> Self {
        Self {
            pipeline,
            config,
            daily: Arc::new(JobSlot::default()),
            realtime: Arc::new(JobSlot::default()),
            ready: AtomicBool::new(false),
        }
    }

    /// Run both jobs until `cancel` fires.
    ///
    /// The first tick of each job fires immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            daily_period_secs = self.config.daily.period.as_secs(),
            realtime_period_ms = self.config.realtime.period.as_millis(),
            "Scheduler started"
        );

        let daily = tokio::spawn(Arc::clone(&self).job_loop(JobKind::DailyClose, cancel.clone()));
        let realtime = tokio::spawn(Arc::clone(&self).job_loop(JobKind::Realtime, cancel));

        for (job, handle) in [(JobKind::DailyClose, daily), (JobKind::Realtime, realtime)] {
            if let Err(error) = handle.await {
                tracing::error!(job = job.as_str(), error = %error, "Job loop terminated abnormally");
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Run one cycle of `job` now.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::AlreadyRunning`] if the job has a cycle in
    /// flight, otherwise the cycle's own error.
    pub async fn run_once(&self, job: JobKind) -> Result<CycleReport, JobError> {
        let guard = self
            .slot(job)
            .try_begin()
            .ok_or(JobError::AlreadyRunning(job))?;
        self.execute(job, guard).await
    }

    /// Current state of a job.
    #[must_use]
    pub fn state(&self, job: JobKind) -> JobState {
        self.slot(job).status().state
    }

    /// Status snapshot of a job.
    #[must_use]
    pub fn status(&self, job: JobKind) -> JobStatus {
        self.slot(job).status()
    }

    /// Whether a real-time cycle has finished at least once.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn job_loop(self: Arc<Self>, job: JobKind, cancel: CancellationToken) {
        let settings = self.settings(job);
        let slot = Arc::clone(self.slot(job));
        let mut interval = tokio::time::interval(settings.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let Some(guard) = slot.try_begin() else {
                        slot.overruns.fetch_add(1, Ordering::Relaxed);
                        metrics::record_cycle_overrun(job.as_str());
                        tracing::warn!(job = job.as_str(), "Previous cycle still running, skipping tick");
                        continue;
                    };
                    let this = Arc::clone(&self);
                    cycles.spawn(async move {
                        // Outcome is logged and counted inside execute.
                        let _ = this.execute(job, guard).await;
                    });
                }
                Some(_) = cycles.join_next(), if !cycles.is_empty() => {}
            }
        }

        cycles.shutdown().await;
        tracing::debug!(job = job.as_str(), "Job loop stopped");
    }

    async fn execute(&self, job: JobKind, guard: RunningGuard) -> Result<CycleReport, JobError> {
        let settings = self.settings(job);
        let slot = &guard.slot;
        let started = Instant::now();
        let deadline = started + settings.batch_timeout;

        let outcome = tokio::time::timeout(
            settings.budget,
            self.pipeline
                .run_cycle(job.price_kind(), job.permit_mode(), deadline),
        )
        .await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(report)) => {
                slot.completed.fetch_add(1, Ordering::Relaxed);
                *slot.last_report.lock() = Some((report, Utc::now()));
                if job == JobKind::Realtime {
                    self.ready.store(true, Ordering::Release);
                }
                metrics::record_cycle(job.as_str(), CycleOutcome::Completed, elapsed);
                tracing::info!(
                    job = job.as_str(),
                    requested = report.requested,
                    applied = report.applied,
                    stale = report.stale,
                    failed = report.failed,
                    broadcast = report.broadcast,
                    elapsed_ms = elapsed.as_millis(),
                    "Cycle completed"
                );
                Ok(report)
            }
            Ok(Err(error)) => {
                slot.skipped.fetch_add(1, Ordering::Relaxed);
                metrics::record_cycle(job.as_str(), CycleOutcome::Skipped, elapsed);
                tracing::warn!(job = job.as_str(), error = %error, "Skipping cycle");
                Err(JobError::Cycle(error))
            }
            Err(_) => {
                slot.abandoned.fetch_add(1, Ordering::Relaxed);
                metrics::record_cycle(job.as_str(), CycleOutcome::Abandoned, elapsed);
                tracing::warn!(
                    job = job.as_str(),
                    budget_ms = settings.budget.as_millis(),
                    "Cycle exceeded its budget, abandoning"
                );
                Err(JobError::BudgetExceeded(settings.budget))
            }
        };

        drop(guard);
        result
    }

    const fn settings(&self, job: JobKind) -> JobSettings {
        match job {
            JobKind::DailyClose => self.config.daily,
            JobKind::Realtime => self.config.realtime,
        }
    }

    const fn slot(&self, job: JobKind) -> &Arc<JobSlot> {
        match job {
            JobKind::DailyClose => &self.daily,
            JobKind::Realtime => &self.realtime,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
