//! Connection Ports
//!
//! Delivery to live dashboard connections. Both traits are synchronous:
//! a send only enqueues, it never waits on the network.

use std::sync::Arc;

use crate::domain::pricing::BroadcastMessage;

/// The peer behind a connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Outbound half of one live connection.
pub trait ConnectionSink: Send + Sync {
    /// Enqueue an encoded frame.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionClosed`] once the connection is gone.
    fn send(&self, frame: Arc<str>) -> Result<(), ConnectionClosed>;
}

/// Outcome of publishing one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections the frame was handed to.
    pub delivered: usize,
    /// Dead connections removed during delivery.
    pub removed: usize,
}

/// Fan-out of price changes to interested connections.
pub trait PricePublisher: Send + Sync {
    /// Deliver `message` to every matching connection.
    fn publish(&self, message: &BroadcastMessage) -> PublishReport;
}
