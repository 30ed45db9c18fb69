//! Configuration loading and representation.
//!
//! Both configs read `KEW_*` environment variables. Unset variables fall back
//! to the defaults; malformed values are errors.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

const DATABASE_URL: &str = "KEW_DATABASE_URL";
const MAX_CONNECTIONS: &str = "KEW_MAX_CONNECTIONS";
const BUSY_TIMEOUT_MS: &str = "KEW_BUSY_TIMEOUT_MS";
const WORKER_NAME: &str = "KEW_WORKER_NAME";
const POLL_INTERVAL_MS: &str = "KEW_POLL_INTERVAL_MS";

/// Storage settings for a [`Queue`](crate::jobs::Queue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// sqlx SQLite URL, e.g. `sqlite://jobs.db` or `sqlite::memory:`.
    pub database_url: String,
    /// Pool size for file databases. In-memory databases always use one
    /// connection, since each connection would otherwise see its own database.
    pub max_connections: u32,
    /// How long a writer waits on a locked database before giving up.
    pub busy_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup(DATABASE_URL).unwrap_or(defaults.database_url),
            max_connections: parse(&lookup, MAX_CONNECTIONS)?.unwrap_or(defaults.max_connections),
            busy_timeout: parse(&lookup, BUSY_TIMEOUT_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.busy_timeout),
        })
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

/// Worker loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Name attached to the worker's log events.
    pub name: String,
    /// Sleep between polls when the queue has nothing eligible.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "kew-worker".to_string(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            name: lookup(WORKER_NAME).unwrap_or(defaults.name),
            poll_interval: parse(&lookup, POLL_INTERVAL_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {key}: {raw:?}"))
        })
        .transpose()
}
