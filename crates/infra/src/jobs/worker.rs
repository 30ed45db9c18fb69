//! Job consumer: reserve, dispatch to a handler, acknowledge or fail.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use kew_core::{FailOutcome, Job};

use super::error::QueueError;
use super::queue::Queue;
use super::store::JobStore;
use crate::config::WorkerConfig;

/// Boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(Job) -> HandlerFuture + Send + Sync>;

/// Called with a job that was killed, and the error of its last attempt.
pub type KilledHandler = Box<dyn Fn(&Job, &HandlerError) + Send + Sync>;

/// A handler reported failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Display) -> Self {
        Self(msg.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

/// What the worker did with one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded; the job was acknowledged.
    Succeeded,
    /// Handler failed; the job will be retried at `available_at`.
    Rescheduled { available_at: DateTime<Utc> },
    /// Handler failed and retries are exhausted.
    Killed,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Failed attempts, including those that killed the job.
    pub jobs_failed: u64,
    pub jobs_killed: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: JobOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobOutcome::Succeeded => self.jobs_succeeded += 1,
            JobOutcome::Rescheduled { .. } => self.jobs_failed += 1,
            JobOutcome::Killed => {
                self.jobs_failed += 1;
                self.jobs_killed += 1;
            }
        }
    }
}

/// Queue consumer.
///
/// Handlers are keyed by job type. Lookup tries an exact match, then a
/// category pattern (`"mail.*"` matches `"mail.welcome"`), then `"*"`.
/// A job with no matching handler counts as a failed attempt.
pub struct Worker<S: JobStore> {
    queue: Arc<Queue<S>>,
    config: WorkerConfig,
    handlers: HashMap<String, JobHandler>,
    on_killed: Option<KilledHandler>,
    stats: Mutex<WorkerStats>,
}

impl<S: JobStore> Worker<S> {
    pub fn new(queue: Arc<Queue<S>>, config: WorkerConfig) -> Self {
        Self {
            queue,
            config,
            handlers: HashMap::new(),
            on_killed: None,
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    /// Register a handler for a job type pattern.
    pub fn register_handler<F, Fut>(&mut self, type_pattern: impl Into<String>, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handlers
            .insert(type_pattern.into(), Box::new(move |job| Box::pin(handler(job))));
    }

    /// Call `callback` whenever a failure kills a job.
    pub fn on_killed<F>(&mut self, callback: F)
    where
        F: Fn(&Job, &HandlerError) + Send + Sync + 'static,
    {
        self.on_killed = Some(Box::new(callback));
    }

    pub fn queue(&self) -> &Arc<Queue<S>> {
        &self.queue
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the handler for a job type.
    fn get_handler(&self, job_type: &str) -> Option<&JobHandler> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h);
        }

        // Category match: "mail.*" covers "mail.welcome".
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, h)) = category {
            return Some(h);
        }

        self.handlers.get("*")
    }

    /// Reserve and process one job. Returns `None` if nothing was eligible.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.queue.get_next_job().await? else {
            return Ok(None);
        };

        debug!(
            worker = %self.config.name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            "processing job"
        );

        let result = match self.get_handler(&job.job_type) {
            Some(handler) => handler(job.clone()).await,
            None => Err(HandlerError::new(format!(
                "no handler registered for job type '{}'",
                job.job_type
            ))),
        };

        let outcome = match result {
            Ok(()) => {
                self.queue.acknowledge_job(job.id).await?;
                JobOutcome::Succeeded
            }
            Err(err) => {
                warn!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    error = %err,
                    "job failed"
                );
                match self.queue.fail_job(job.id).await? {
                    FailOutcome::Rescheduled { available_at } => {
                        JobOutcome::Rescheduled { available_at }
                    }
                    FailOutcome::Killed => {
                        if let Some(callback) = &self.on_killed {
                            callback(&job, &err);
                        }
                        JobOutcome::Killed
                    }
                }
            }
        };

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(outcome);
        Ok(Some(outcome))
    }

    /// Process jobs until none is eligible. Returns how many were processed.
    pub async fn process_jobs(&self) -> Result<usize, QueueError> {
        let mut processed = 0;
        while self.process_next().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Keep processing until `shutdown` turns `true` or its sender is dropped.
    ///
    /// Sleeps `poll_interval` whenever the queue is empty. Storage errors are
    /// logged and retried after the same delay.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.config.name, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "failed to process job");
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker = %self.config.name, stats = ?self.stats(), "worker stopped");
    }
}
