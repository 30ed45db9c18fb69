//! Retry backoff policy.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobResult};

const NANOS_PER_MILLI: i32 = 1_000_000;

/// Fixed list of backoff intervals decided when a job is enqueued.
///
/// Attempt `k` (1-based) that fails waits `intervals[k - 1]` before the job
/// becomes available again. Once `k` exceeds the list the job is exhausted.
/// An empty list means the first failure is final.
///
/// Persisted as a JSON array of milliseconds. Intervals must be whole
/// milliseconds so that every store reads back exactly what was enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<i64>", into = "Vec<i64>")]
pub struct RetryStrategy {
    intervals: Vec<TimeDelta>,
}

impl RetryStrategy {
    /// Build a strategy from explicit intervals.
    ///
    /// Fails with [`JobError::InvalidArgument`] if any interval is negative
    /// or has a sub-millisecond part.
    pub fn new(intervals: impl IntoIterator<Item = TimeDelta>) -> JobResult<Self> {
        let intervals: Vec<TimeDelta> = intervals.into_iter().collect();

        for (idx, interval) in intervals.iter().enumerate() {
            if *interval < TimeDelta::zero() {
                return Err(JobError::invalid_argument(format!(
                    "retry interval {idx} is negative ({interval})"
                )));
            }
            if interval.subsec_nanos() % NANOS_PER_MILLI != 0 {
                return Err(JobError::invalid_argument(format!(
                    "retry interval {idx} is not a whole number of milliseconds ({interval})"
                )));
            }
        }

        Ok(Self { intervals })
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::default()
    }

    /// `retries` retries, each after the same delay.
    pub fn fixed(retries: u32, delay: TimeDelta) -> JobResult<Self> {
        Self::new(std::iter::repeat(delay).take(retries as usize))
    }

    /// `retries` retries with delays `base, 2*base, 4*base, ...`.
    pub fn exponential(retries: u32, base: TimeDelta) -> JobResult<Self> {
        let mut intervals = Vec::with_capacity(retries as usize);
        let mut delay = base;

        for _ in 0..retries {
            intervals.push(delay);
            delay = delay
                .checked_add(&delay)
                .ok_or_else(|| JobError::invalid_argument("exponential backoff overflows"))?;
        }

        Self::new(intervals)
    }

    /// Backoff to apply after attempt number `attempts` failed, or `None`
    /// once retries are exhausted.
    pub fn interval_for(&self, attempts: u32) -> Option<TimeDelta> {
        let idx = usize::try_from(attempts).ok()?.checked_sub(1)?;
        self.intervals.get(idx).copied()
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.interval_for(attempts).is_none()
    }

    /// Maximum number of retries after the first attempt.
    pub fn max_retries(&self) -> usize {
        self.intervals.len()
    }

    pub fn intervals(&self) -> &[TimeDelta] {
        &self.intervals
    }
}

impl TryFrom<Vec<i64>> for RetryStrategy {
    type Error = JobError;

    fn try_from(millis: Vec<i64>) -> Result<Self, Self::Error> {
        let intervals = millis
            .into_iter()
            .map(|ms| {
                TimeDelta::try_milliseconds(ms).ok_or_else(|| {
                    JobError::invalid_argument(format!("retry interval out of range: {ms}ms"))
                })
            })
            .collect::<JobResult<Vec<_>>>()?;

        Self::new(intervals)
    }
}

impl From<RetryStrategy> for Vec<i64> {
    fn from(strategy: RetryStrategy) -> Self {
        strategy
            .intervals
            .iter()
            .map(TimeDelta::num_milliseconds)
            .collect()
    }
}
