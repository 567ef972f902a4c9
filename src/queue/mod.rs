//! Pull-style source of inbound notifications.

pub mod sqs;

pub use sqs::SqsEventSource;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue receive failed: {0}")]
    Receive(String),
    #[error("queue acknowledge failed: {0}")]
    Acknowledge(String),
}

/// One delivery of a queued notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    pub body: String,
    /// Opaque handle used to acknowledge this delivery.
    pub receipt: String,
    /// How many times the queue has handed this event out, including this time.
    pub receive_count: u32,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait up to `wait` for at most `max` events.
    async fn receive(&self, max: i32, wait: Duration) -> Result<Vec<QueuedEvent>, QueueError>;

    /// Remove a delivered event so it is not handed out again.
    async fn acknowledge(&self, event: &QueuedEvent) -> Result<(), QueueError>;
}
