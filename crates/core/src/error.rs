//! Job-level error model.

use thiserror::Error;

use crate::id::JobId;

/// Result type used by the job state machine and its policies.
pub type JobResult<T> = Result<T, JobError>;

/// Deterministic failure of a job operation.
///
/// Storage and transport failures are not represented here; they belong to
/// the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Input rejected before anything was persisted (empty job type,
    /// negative retry interval, unrepresentable schedule).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// `fail` was called on a job that is not reserved.
    #[error("job {0} is not reserved and has already been rescheduled")]
    AlreadyRescheduled(JobId),

    /// `fail` was called on a killed job.
    #[error("job {0} has been killed and cannot be retried")]
    RetryingKilledJob(JobId),

    /// `reserve` was called on a job that is not eligible for reservation.
    #[error("job {0} is not available for reservation")]
    NotReservable(JobId),
}

impl JobError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
