//! Queue and storage errors.

use thiserror::Error;

use kew_core::{JobError, JobId};

/// Job store error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The state machine refused the requested transition; the row is untouched.
    #[error(transparent)]
    Rejected(#[from] JobError),
    /// A persisted row could not be decoded.
    #[error("corrupt job row {id}: {reason}")]
    Corrupt { id: String, reason: String },
    /// Optimistic update kept losing to concurrent writers.
    #[error("gave up on job {0} after repeated concurrent updates")]
    Contention(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Error returned by every [`Queue`](super::Queue) operation.
///
/// All variants except `Storage` are deterministic, caller-visible outcomes;
/// the queue never retries them internally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Empty job type or negative retry interval. Nothing was persisted.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No job with this id exists (never created, or already acknowledged).
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// `fail_job` on a job that is not currently reserved.
    #[error("job {0} is not reserved and has already been rescheduled")]
    JobAlreadyRescheduled(JobId),

    /// `fail_job` on a job that has already been killed.
    #[error("job {0} has been killed and cannot be retried")]
    RetryingKilledJob(JobId),

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobError> for QueueError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::InvalidArgument(msg) | JobError::InvalidId(msg) => Self::InvalidArgument(msg),
            JobError::AlreadyRescheduled(id) => Self::JobAlreadyRescheduled(id),
            JobError::RetryingKilledJob(id) => Self::RetryingKilledJob(id),
            JobError::NotReservable(id) => {
                Self::Storage(format!("store selected job {id} which is not reservable"))
            }
        }
    }
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::JobNotFound(id),
            StoreError::Rejected(job_err) => job_err.into(),
            other => Self::Storage(other.to_string()),
        }
    }
}
