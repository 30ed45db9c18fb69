//! Infrastructure layer: job stores, the queue, workers, config.

pub mod config;
pub mod jobs;

mod integration_tests;

pub use config::{QueueConfig, WorkerConfig};
pub use jobs::{
    HandlerError, InMemoryJobStore, JobOutcome, JobStore, Queue, QueueError, QueueStats,
    SqliteJobStore, StoreError, Worker, WorkerStats,
};
