//! Kill notifications.
//!
//! The queue reports every kill transition to an optional [`EventSink`]
//! exactly once. Delivery is fire-and-forget: a sink error is logged by the
//! caller and never changes the outcome of the failed job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use kew_core::JobId;

use crate::bus::EventBus;
use crate::in_memory_bus::InMemoryEventBus;

/// A job exhausted its retries and was killed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobKilled {
    pub job_id: JobId,
    pub job_type: String,
    /// Reservations made before the job was killed.
    pub attempts: u32,
    pub killed_at: DateTime<Utc>,
}

/// Failure to deliver a notification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("event sink failed: {0}")]
pub struct SinkError(pub String);

impl SinkError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Receiver of kill notifications.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: &JobKilled) -> Result<(), SinkError>;
}

impl EventSink for InMemoryEventBus<JobKilled> {
    fn notify(&self, event: &JobKilled) -> Result<(), SinkError> {
        self.publish(event.clone())
            .map_err(|e| SinkError::new(e.to_string()))
    }
}

/// Sink that records kills in the log and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn notify(&self, event: &JobKilled) -> Result<(), SinkError> {
        warn!(
            job_id = %event.job_id,
            job_type = %event.job_type,
            attempts = event.attempts,
            killed_at = %event.killed_at,
            "job killed"
        );
        Ok(())
    }
}
