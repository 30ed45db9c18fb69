//! The job entity and its state machine.
//!
//! ## States
//!
//! | state | `available_at` | `reserved_at` |
//! |-------|----------------|---------------|
//! | `Available { at }` | `at` | null |
//! | `Reserved { at, available_at }` | `available_at` | `at` |
//! | `Killed` | null | null |
//!
//! An available job whose `at` is still in the future is "scheduled"; it only
//! becomes eligible once the clock reaches `at`.
//!
//! ## Transitions
//!
//! ```text
//! Available(at <= now) --reserve--> Reserved        attempts += 1
//! Reserved            --fail-----> Available(now + interval)
//! Reserved            --fail-----> Killed           retries exhausted
//! ```
//!
//! Acknowledgement deletes the row and is handled by the store.
//!
//! Every instant a job holds lies in years 0000 through 9999, the range that
//! stores can encode as fixed-width RFC 3339 text.

use chrono::{DateTime, Datelike, TimeDelta, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobResult};
use crate::id::JobId;
use crate::retry::RetryStrategy;

/// Whether `at` falls in the years a store can encode.
pub fn is_storable(at: DateTime<Utc>) -> bool {
    (0..=9999).contains(&at.year())
}

fn ensure_storable(what: &str, at: DateTime<Utc>) -> JobResult<()> {
    if is_storable(at) {
        Ok(())
    } else {
        Err(JobError::invalid_argument(format!(
            "{what} {at} is outside years 0000-9999"
        )))
    }
}

/// Scheduling state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be reserved once the clock reaches `at`.
    Available { at: DateTime<Utc> },
    /// Held by a consumer since `at`.
    Reserved {
        at: DateTime<Utc>,
        available_at: DateTime<Utc>,
    },
    /// Retries exhausted. Terminal.
    Killed,
}

impl JobState {
    /// Rebuild a state from the two nullable persisted timestamps.
    ///
    /// Returns `None` for the impossible `(null, set)` combination.
    pub fn from_columns(
        available_at: Option<DateTime<Utc>>,
        reserved_at: Option<DateTime<Utc>>,
    ) -> Option<Self> {
        match (available_at, reserved_at) {
            (Some(at), None) => Some(Self::Available { at }),
            (Some(available_at), Some(at)) => Some(Self::Reserved { at, available_at }),
            (None, None) => Some(Self::Killed),
            (None, Some(_)) => None,
        }
    }

    /// Value of the `available_at` column.
    pub fn available_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Available { at } => Some(*at),
            Self::Reserved { available_at, .. } => Some(*available_at),
            Self::Killed => None,
        }
    }

    /// Value of the `reserved_at` column.
    pub fn reserved_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Reserved { at, .. } => Some(*at),
            _ => None,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Self::Available { at } if *at <= now)
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }

    pub fn is_killed(&self) -> bool {
        matches!(self, Self::Killed)
    }
}

/// What `fail` did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    /// The job will be available again at `available_at`.
    Rescheduled { available_at: DateTime<Utc> },
    /// Retries were exhausted and the job is now terminal.
    Killed,
}

/// A unit of work as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Name of the handler a consumer should use.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque payload handed to the handler.
    pub arguments: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub state: JobState,
    /// Number of reservations so far.
    pub attempts: u32,
    pub retry_strategy: RetryStrategy,
}

impl Job {
    /// Create a fresh, unreserved job.
    pub fn new(
        id: JobId,
        job_type: impl Into<String>,
        arguments: serde_json::Value,
        created_at: DateTime<Utc>,
        available_at: DateTime<Utc>,
        retry_strategy: RetryStrategy,
    ) -> JobResult<Self> {
        let job_type = job_type.into();
        if job_type.is_empty() {
            return Err(JobError::invalid_argument("job type must not be empty"));
        }
        ensure_storable("created_at", created_at)?;
        ensure_storable("available_at", available_at)?;

        Ok(Self {
            id,
            job_type,
            arguments,
            created_at,
            state: JobState::Available { at: available_at },
            attempts: 0,
            retry_strategy,
        })
    }

    /// Deserialize the arguments into a concrete type.
    pub fn arguments_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.arguments.clone())
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state.is_eligible(now)
    }

    /// Ordering used to pick among eligible jobs: oldest availability first,
    /// then creation time, then id.
    pub fn selection_key(&self) -> (Option<DateTime<Utc>>, DateTime<Utc>, JobId) {
        (self.state.available_at(), self.created_at, self.id)
    }

    /// Mark the job as held by a consumer.
    pub fn reserve(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        match self.state {
            JobState::Available { at } if at <= now => {
                self.state = JobState::Reserved {
                    at: now,
                    available_at: at,
                };
                self.attempts = self.attempts.saturating_add(1);
                Ok(())
            }
            _ => Err(JobError::NotReservable(self.id)),
        }
    }

    /// Record a failed attempt: reschedule after the next backoff interval,
    /// or kill the job once retries are exhausted.
    ///
    /// A backoff that lands outside the storable range also kills the job,
    /// since it could never become due.
    pub fn fail(&mut self, now: DateTime<Utc>) -> JobResult<FailOutcome> {
        match self.state {
            JobState::Killed => return Err(JobError::RetryingKilledJob(self.id)),
            JobState::Available { .. } => return Err(JobError::AlreadyRescheduled(self.id)),
            JobState::Reserved { .. } => {}
        }

        let next = self
            .retry_strategy
            .interval_for(self.attempts)
            .and_then(|interval| now.checked_add_signed(interval))
            .filter(|at| is_storable(*at));

        match next {
            Some(available_at) => {
                self.state = JobState::Available { at: available_at };
                Ok(FailOutcome::Rescheduled { available_at })
            }
            None => {
                self.state = JobState::Killed;
                Ok(FailOutcome::Killed)
            }
        }
    }
}

/// When a new job becomes available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    /// At the moment of enqueueing.
    #[default]
    Immediately,
    /// At an absolute instant.
    At(DateTime<Utc>),
    /// After a delay measured from the moment of enqueueing.
    After(TimeDelta),
}

impl Schedule {
    pub fn resolve(self, now: DateTime<Utc>) -> JobResult<DateTime<Utc>> {
        match self {
            Self::Immediately => Ok(now),
            Self::At(at) => Ok(at),
            Self::After(delay) => now.checked_add_signed(delay).ok_or_else(|| {
                JobError::invalid_argument(format!("delay of {delay} from {now} is out of range"))
            }),
        }
    }
}

/// A request to enqueue a job.
///
/// Validation happens in [`NewJob::into_job`], so nothing invalid ever
/// reaches storage.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub arguments: serde_json::Value,
    pub schedule: Schedule,
    pub retry_intervals: Vec<TimeDelta>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            arguments,
            schedule: Schedule::Immediately,
            retry_intervals: Vec::new(),
        }
    }

    /// Make the job available at `at`, in any timezone; it is stored in UTC.
    pub fn available_at<Tz: TimeZone>(mut self, at: DateTime<Tz>) -> Self {
        self.schedule = Schedule::At(at.with_timezone(&Utc));
        self
    }

    /// Make the job available `delay` after it is enqueued.
    pub fn delayed(mut self, delay: TimeDelta) -> Self {
        self.schedule = Schedule::After(delay);
        self
    }

    pub fn retry_intervals(mut self, intervals: impl IntoIterator<Item = TimeDelta>) -> Self {
        self.retry_intervals = intervals.into_iter().collect();
        self
    }

    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_intervals = strategy.intervals().to_vec();
        self
    }

    /// Validate the request and build the job to persist.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> JobResult<Job> {
        let retry_strategy = RetryStrategy::new(self.retry_intervals)?;
        let available_at = self.schedule.resolve(now)?;

        Job::new(
            id,
            self.job_type,
            self.arguments,
            now,
            available_at,
            retry_strategy,
        )
    }
}
