//! Time sources.
//!
//! Queue logic never reads wall time directly; every component receives a
//! [`Clock`] at construction.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

/// Supplies the current instant, always in UTC.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<C> Clock for Arc<C>
where
    C: Clock + ?Sized,
{
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FrozenClock {
    frozen_at: Mutex<DateTime<Utc>>,
}

impl FrozenClock {
    pub fn new(frozen_at: DateTime<Utc>) -> Self {
        Self {
            frozen_at: Mutex::new(frozen_at),
        }
    }

    pub fn arc(frozen_at: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self::new(frozen_at))
    }

    pub fn set_to(&self, at: DateTime<Utc>) {
        *self.frozen_at.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// Move the clock forward (or backward, for a negative delta).
    pub fn advance(&self, by: TimeDelta) {
        let mut guard = self.frozen_at.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Utc> {
        *self.frozen_at.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
