//! The queue: enqueue, reserve, acknowledge, fail.
//!
//! `Queue` owns the clock, the id generator and the optional kill sink, and
//! delegates persistence to a [`JobStore`]. Every clock reading is truncated
//! to microseconds so that all stores see the same instants.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, instrument, warn};

use kew_core::{Clock, FailOutcome, IdGenerator, Job, JobId, JobState, NewJob};
use kew_events::{EventSink, JobKilled};

use super::error::QueueError;
use super::sqlite::SqliteJobStore;
use super::store::{JobStore, QueueStats};
use crate::config::QueueConfig;

/// Persistent work queue over a job store.
pub struct Queue<S> {
    store: S,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Queue<SqliteJobStore> {
    /// Open a SQLite-backed queue.
    pub async fn open(
        config: &QueueConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, QueueError> {
        let store = SqliteJobStore::connect(config).await?;
        Ok(Self::new(store, clock, ids))
    }
}

impl<S: JobStore> Queue<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            store,
            clock,
            ids,
            sink: None,
        }
    }

    /// Report kills to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current time on the queue clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(6)
    }

    /// Persist a new job and return its id.
    ///
    /// The job is unreserved with zero attempts. Without an explicit schedule
    /// it is available immediately. An empty job type, a negative or
    /// sub-millisecond retry interval, or an availability outside years
    /// 0000-9999 is rejected before anything is written.
    #[instrument(skip(self, new_job), fields(job_type = %new_job.job_type), err)]
    pub async fn create_job(&self, new_job: NewJob) -> Result<JobId, QueueError> {
        let now = self.now();
        let mut job = new_job.into_job(self.ids.next_id(), now)?;
        if let JobState::Available { at } = job.state {
            job.state = JobState::Available {
                at: at.trunc_subsecs(6),
            };
        }

        self.store.insert(&job).await?;

        info!(
            job_id = %job.id,
            available_at = ?job.state.available_at(),
            retries = job.retry_strategy.max_retries(),
            "job created"
        );
        Ok(job.id)
    }

    /// Reserve the next eligible job, if any.
    ///
    /// The returned job is reserved as of now, its attempt count already
    /// incremented. Concurrent callers never receive the same job.
    #[instrument(skip(self), err)]
    pub async fn get_next_job(&self) -> Result<Option<Job>, QueueError> {
        let now = self.now();
        let job = self.store.reserve_next(now).await?;

        match &job {
            Some(job) => debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                "job reserved"
            ),
            None => debug!("no job available"),
        }
        Ok(job)
    }

    /// Mark a job as done and delete it.
    ///
    /// Works in any state. The caller is trusted to acknowledge only jobs it
    /// holds.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn acknowledge_job(&self, id: JobId) -> Result<(), QueueError> {
        self.store.remove(id).await?;
        info!(job_id = %id, "job acknowledged");
        Ok(())
    }

    /// Record a failed attempt on a reserved job.
    ///
    /// The job is either rescheduled after its next backoff interval or,
    /// once retries are exhausted or the backoff would land past year 9999,
    /// killed. A kill is reported to the event
    /// sink; sink failures are logged and never change the outcome.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn fail_job(&self, id: JobId) -> Result<FailOutcome, QueueError> {
        let now = self.now();
        let (job, outcome) = self.store.update(id, |job| job.fail(now)).await?;

        match outcome {
            FailOutcome::Rescheduled { available_at } => {
                debug!(
                    job_id = %id,
                    attempts = job.attempts,
                    available_at = %available_at,
                    "job rescheduled"
                );
            }
            FailOutcome::Killed => {
                warn!(
                    job_id = %id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    "job killed"
                );
                self.notify_killed(&job, now);
            }
        }
        Ok(outcome)
    }

    /// Same as [`fail_job`](Self::fail_job).
    pub async fn retry_job(&self, id: JobId) -> Result<FailOutcome, QueueError> {
        self.fail_job(id).await
    }

    /// Read-only snapshot of a job.
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    /// Job counts per state, as of now.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.stats(self.now()).await?)
    }

    fn notify_killed(&self, job: &Job, killed_at: DateTime<Utc>) {
        let Some(sink) = &self.sink else {
            return;
        };

        let event = JobKilled {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempts: job.attempts,
            killed_at,
        };
        if let Err(err) = sink.notify(&event) {
            warn!(job_id = %job.id, error = %err, "failed to deliver kill notification");
        }
    }
}
