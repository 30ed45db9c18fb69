//! Job storage implementations.
//!
//! Stores persist [`Job`] records and provide the two primitives the queue
//! needs for exclusive reservation under concurrency:
//!
//! - [`JobStore::reserve_next`] selects the oldest eligible job and reserves
//!   it atomically, so concurrent callers never receive the same job.
//! - [`JobStore::update`] applies a state transition to one job atomically.
//!   If the transition is rejected, the stored job is left untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use kew_core::{Job, JobError, JobId};

use super::error::StoreError;

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    /// Reserve the next eligible job as of `now`.
    ///
    /// Eligible means available (not reserved, not killed) with an
    /// availability time at or before `now`. Among eligible jobs the one with
    /// the smallest `(available_at, created_at, id)` wins. Returns `None` if
    /// nothing is eligible.
    async fn reserve_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Delete a job in whatever state it is in.
    async fn remove(&self, id: JobId) -> Result<(), StoreError>;

    /// Atomically apply a transition to a stored job.
    ///
    /// Returns the job as persisted together with the transition's output.
    /// `apply` may be invoked more than once by stores that use optimistic
    /// concurrency; it must be a pure function of the job it is given.
    async fn update<T, F>(&self, id: JobId, apply: F) -> Result<(Job, T), StoreError>
    where
        F: FnMut(&mut Job) -> Result<T, JobError> + Send,
        T: Send;

    /// Count jobs per state as of `now`.
    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError>;
}

#[async_trait]
impl<S: JobStore> JobStore for Arc<S> {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        (**self).insert(job).await
    }

    async fn reserve_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        (**self).reserve_next(now).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(id).await
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        (**self).remove(id).await
    }

    async fn update<T, F>(&self, id: JobId, apply: F) -> Result<(Job, T), StoreError>
    where
        F: FnMut(&mut Job) -> Result<T, JobError> + Send,
        T: Send,
    {
        (**self).update(id, apply).await
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        (**self).stats(now).await
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Available and due.
    pub available: usize,
    /// Available but scheduled for later.
    pub scheduled: usize,
    pub reserved: usize,
    pub killed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.available + self.scheduled + self.reserved + self.killed
    }

    fn record(&mut self, job: &Job, now: DateTime<Utc>) {
        if job.state.is_killed() {
            self.killed += 1;
        } else if job.state.is_reserved() {
            self.reserved += 1;
        } else if job.is_eligible(now) {
            self.available += 1;
        } else {
            self.scheduled += 1;
        }
    }
}

/// In-memory job store for tests/dev.
///
/// A single mutex guards the whole table, which makes selection and
/// reservation one critical section.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .lock()
            .map_err(|_| StoreError::Storage("in-memory job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.lock()?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn reserve_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.lock()?;

        let next = jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .min_by_key(|j| j.selection_key())
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.reserve(now)?;
        Ok(Some(job.clone()))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        self.lock()?
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn update<T, F>(&self, id: JobId, mut apply: F) -> Result<(Job, T), StoreError>
    where
        F: FnMut(&mut Job) -> Result<T, JobError> + Send,
        T: Send,
    {
        let mut jobs = self.lock()?;
        let stored = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        // Work on a copy so a rejected transition leaves the stored job as-is.
        let mut next = stored.clone();
        let output = apply(&mut next)?;
        *stored = next.clone();
        Ok((next, output))
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        let jobs = self.lock()?;
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            stats.record(job, now);
        }
        Ok(stats)
    }
}
