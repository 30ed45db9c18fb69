//! Persistent work queue.
//!
//! ## Design
//!
//! - Jobs are stored by a [`JobStore`]: in memory for tests/dev, or SQLite
//! - Reservation is exclusive: concurrent consumers never get the same job
//! - Failed jobs are rescheduled with per-job backoff, then killed
//! - Kills are reported to an optional [`EventSink`](kew_events::EventSink)
//!
//! ## Components
//!
//! - `Queue`: create, reserve, acknowledge and fail jobs
//! - `JobStore`: persistence for jobs (in-memory or SQLite)
//! - `Worker`: runs jobs through registered handlers

pub mod error;
pub mod queue;
pub mod sqlite;
pub mod store;
pub mod worker;

pub use error::{QueueError, StoreError};
pub use queue::Queue;
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, QueueStats};
pub use worker::{
    HandlerError, HandlerFuture, JobHandler, JobOutcome, KilledHandler, Worker, WorkerStats,
};
