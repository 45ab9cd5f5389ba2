//! Broadcast Hub
//!
//! Fans price changes out to live dashboard connections.
//!
//! # Architecture
//!
//! Each connection owns a bounded tokio broadcast channel used as its
//! outbound queue. The hub keeps the sending halves in a
//! [`SubscriptionRegistry`] keyed by connection ID and indexed by symbol.
//!
//! Publishing snapshots the matching sinks under a short read lock, then
//! enqueues the encoded frame outside the lock. A full queue overwrites its
//! oldest frame, so a slow dashboard lags instead of stalling the hub. A
//! queue with no receiver left means the connection is gone; it is removed
//! from the registry and never retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::application::ports::{ConnectionClosed, ConnectionSink, PricePublisher, PublishReport};
use crate::domain::pricing::{BroadcastMessage, Symbol};
use crate::domain::subscription::{
    ConnectionId, RegistryError, RegistryStats, Subscription, SubscriptionRegistry, SymbolFilter,
};
use crate::infrastructure::config::BroadcastSettings;
use crate::infrastructure::metrics;

// =============================================================================
// Wire Frame
// =============================================================================

#[derive(Serialize)]
struct PriceFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    #[serde(flatten)]
    message: &'a BroadcastMessage,
}

/// Encode a message as a JSON text frame.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode_frame(message: &BroadcastMessage) -> Result<Arc<str>, serde_json::Error> {
    let frame = PriceFrame {
        frame_type: "price",
        message,
    };
    serde_json::to_string(&frame).map(Arc::from)
}

// =============================================================================
// Queued Sink
// =============================================================================

/// Outbound queue of one connection.
///
/// Backed by a bounded broadcast channel: when full, the oldest frame is
/// overwritten and the receiver observes a lag.
#[derive(Debug, Clone)]
pub struct QueuedSink {
    tx: broadcast::Sender<Arc<str>>,
}

impl QueuedSink {
    /// Create a sink and the receiver its connection task drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, broadcast::Receiver<Arc<str>>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ConnectionSink for QueuedSink {
    fn send(&self, frame: Arc<str>) -> Result<(), ConnectionClosed> {
        self.tx.send(frame).map(|_| ()).map_err(|_| ConnectionClosed)
    }
}

// =============================================================================
// Broadcast Hub
// =============================================================================

/// Configuration for the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Frames buffered per connection before the oldest is dropped.
    pub queue_capacity: usize,
    /// Maximum number of live connections.
    pub max_connections: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_connections: 100,
        }
    }
}

impl From<BroadcastSettings> for BroadcastConfig {
    fn from(settings: BroadcastSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            max_connections: settings.max_connections,
        }
    }
}

/// Registry of live connections plus the publish path.
///
/// # Example
///
/// ```rust
/// use price_stream::domain::subscription::SymbolFilter;
/// use price_stream::infrastructure::broadcast::{BroadcastConfig, BroadcastHub};
///
/// let hub = BroadcastHub::new(BroadcastConfig::default());
///
/// // A connection task opens its queue and drains the receiver.
/// let (subscription, _rx) = hub.open_connection(SymbolFilter::All).unwrap();
/// assert_eq!(hub.stats().connections, 1);
///
/// hub.unregister(subscription.id);
/// assert_eq!(hub.stats().connections, 0);
/// ```
pub struct BroadcastHub {
    registry: SubscriptionRegistry<Arc<dyn ConnectionSink>>,
    queue_capacity: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    removed: AtomicU64,
}

impl BroadcastHub {
    /// Create a hub with the given configuration.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            registry: SubscriptionRegistry::new(config.max_connections),
            queue_capacity: config.queue_capacity,
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            removed: AtomicU64::new(0),
        }
    }

    /// Create a hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    /// Allocate a fresh connection ID.
    #[must_use]
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a connection with its sink.
    ///
    /// Re-registering an ID replaces its filter and sink.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityReached`] when the connection
    /// ceiling is reached.
    pub fn register(
        &self,
        id: ConnectionId,
        filter: SymbolFilter,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<Subscription, RegistryError> {
        let subscription = self.registry.register(id, filter, sink)?;
        metrics::set_connections(self.registry.stats().connection_count);
        tracing::debug!(connection_id = id, filter = ?subscription.filter, "Connection registered");
        Ok(subscription)
    }

    /// Register a new connection backed by a [`QueuedSink`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityReached`] when the connection
    /// ceiling is reached.
    pub fn open_connection(
        &self,
        filter: SymbolFilter,
    ) -> Result<(Subscription, broadcast::Receiver<Arc<str>>), RegistryError> {
        let (sink, rx) = QueuedSink::channel(self.queue_capacity);
        let subscription = self.register(self.next_connection_id(), filter, Arc::new(sink))?;
        Ok((subscription, rx))
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.registry.unregister(id);
        if removed {
            metrics::set_connections(self.registry.stats().connection_count);
            tracing::debug!(connection_id = id, "Connection unregistered");
        }
        removed
    }

    /// Replace a connection's filter.
    pub fn update_filter(&self, id: ConnectionId, filter: SymbolFilter) -> Option<Subscription> {
        self.registry.update_filter(id, filter)
    }

    /// Add symbols to a connection's explicit filter.
    pub fn subscribe_symbols(&self, id: ConnectionId, symbols: &[Symbol]) -> Option<Subscription> {
        self.registry.subscribe_symbols(id, symbols)
    }

    /// Remove symbols from a connection's explicit filter.
    pub fn unsubscribe_symbols(
        &self,
        id: ConnectionId,
        symbols: &[Symbol],
    ) -> Option<Subscription> {
        self.registry.unsubscribe_symbols(id, symbols)
    }

    /// Whether a connection is registered.
    #[must_use]
    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.registry.contains(id)
    }

    /// All registered connections.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.registry.subscriptions()
    }

    /// Hub statistics.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats::new(
            self.registry.stats(),
            self.published.load(Ordering::Relaxed),
            self.delivered.load(Ordering::Relaxed),
            self.removed.load(Ordering::Relaxed),
        )
    }
}

impl PricePublisher for BroadcastHub {
    fn publish(&self, message: &BroadcastMessage) -> PublishReport {
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::error!(symbol = %message.symbol, error = %error, "Failed to encode price frame");
                return PublishReport::default();
            }
        };

        let recipients = self.registry.matching(&message.symbol);
        let mut dead = Vec::new();
        let mut delivered = 0;

        for (id, sink) in recipients {
            match sink.send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(ConnectionClosed) => dead.push(id),
            }
        }

        let removed = if dead.is_empty() {
            0
        } else {
            let removed = self.registry.remove_many(&dead);
            tracing::info!(connections = ?dead, "Removed closed connections");
            metrics::set_connections(self.registry.stats().connection_count);
            metrics::record_dead_connections(removed as u64);
            removed
        };

        self.published.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.removed.fetch_add(removed as u64, Ordering::Relaxed);
        metrics::record_frames_sent(delivered as u64);

        PublishReport { delivered, removed }
    }
}

/// Shared broadcast hub reference.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

/// Statistics about the hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    /// Live connections.
    pub connections: usize,
    /// Connections subscribed to every symbol.
    pub all_symbols_connections: usize,
    /// Distinct symbols named by explicit filters.
    pub filtered_symbols: usize,
    /// Connection ceiling.
    pub max_connections: usize,
    /// Messages published.
    pub published: u64,
    /// Frames handed to connection queues.
    pub delivered: u64,
    /// Dead connections removed.
    pub removed: u64,
}

impl BroadcastStats {
    const fn new(registry: RegistryStats, published: u64, delivered: u64, removed: u64) -> Self {
        Self {
            connections: registry.connection_count,
            all_symbols_connections: registry.all_symbols_count,
            filtered_symbols: registry.symbol_count,
            max_connections: registry.max_connections,
            published,
            delivered,
            removed,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
