//! `kew-core`: job queue building blocks.
//!
//! This crate contains the **pure** parts of the queue: identifiers, time
//! sources, the retry policy and the job state machine. No storage concerns.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use clock::{Clock, FrozenClock, SystemClock};
pub use error::{JobError, JobResult};
pub use id::{IdGenerator, JobId, SequentialIdGenerator, UuidV7Generator};
pub use job::{is_storable, FailOutcome, Job, JobState, NewJob, Schedule};
pub use retry::RetryStrategy;
