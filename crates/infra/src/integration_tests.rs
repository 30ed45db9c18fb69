//! Integration tests for the full queue pipeline.
//!
//! Tests: create → reserve → fail/acknowledge → kill → notify
//!
//! Verifies:
//! - Both stores behave identically through the `Queue` API
//! - Reservation is exclusive under concurrent consumers
//! - Jobs survive reopening a SQLite database file
//! - Instants at the edge of the encodable range behave the same in both stores

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Arc;

    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use serde_json::json;
    use tokio::sync::Barrier;

    use kew_core::{FailOutcome, FrozenClock, JobId, JobState, NewJob, UuidV7Generator};
    use kew_events::{EventBus, InMemoryEventBus, JobKilled};

    use crate::config::QueueConfig;
    use crate::jobs::{InMemoryJobStore, JobStore, Queue, QueueError, SqliteJobStore};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    /// SQLite database file removed (with its WAL files) on drop.
    struct TempDb {
        path: PathBuf,
    }

    impl TempDb {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!("kew-test-{}.db", JobId::new()));
            Self { path }
        }

        fn config(&self) -> QueueConfig {
            QueueConfig::default()
                .with_database_url(format!("sqlite://{}", self.path.display()))
                .with_max_connections(8)
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{}", self.path.display(), suffix));
            }
        }
    }

    fn queue_over<S: JobStore>(store: S, clock: &Arc<FrozenClock>) -> Queue<S> {
        Queue::new(store, clock.clone(), Arc::new(UuidV7Generator))
    }

    async fn sqlite_memory() -> SqliteJobStore {
        SqliteJobStore::connect(&QueueConfig::default()).await.unwrap()
    }

    // ---- behaviour shared by both stores ----

    async fn type_and_arguments_round_trip<S: JobStore>(store: S) {
        let clock = FrozenClock::arc(t0());
        let queue = queue_over(store, &clock);
        let arguments = json!({"message": "Hey!", "tags": ["a", "b"], "n": 3});

        let id = queue
            .create_job(NewJob::new("greet", arguments.clone()))
            .await
            .unwrap();

        let job = queue.get_next_job().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.job_type, "greet");
        assert_eq!(job.arguments, arguments);
        assert_eq!(job.attempts, 1);
    }

    async fn delayed_jobs_wait<S: JobStore>(store: S) {
        let clock = FrozenClock::arc(t0());
        let queue = queue_over(store, &clock);

        let id = queue
            .create_job(NewJob::new("later", json!(null)).available_at(t0() + TimeDelta::minutes(5)))
            .await
            .unwrap();

        assert!(queue.get_next_job().await.unwrap().is_none());
        clock.advance(TimeDelta::minutes(5));
        assert_eq!(queue.get_next_job().await.unwrap().unwrap().id, id);
    }

    async fn backoff_then_kill_with_one_notification<S: JobStore>(store: S) {
        let clock = FrozenClock::arc(t0());
        let bus = Arc::new(InMemoryEventBus::<JobKilled>::new());
        let kills = bus.subscribe();
        let queue = queue_over(store, &clock).with_event_sink(bus.clone());

        let id = queue
            .create_job(
                NewJob::new("flaky", json!(null))
                    .retry_intervals([TimeDelta::seconds(60), TimeDelta::seconds(120)]),
            )
            .await
            .unwrap();

        queue.get_next_job().await.unwrap().unwrap();
        assert_eq!(
            queue.fail_job(id).await.unwrap(),
            FailOutcome::Rescheduled {
                available_at: t0() + TimeDelta::seconds(60)
            }
        );

        clock.advance(TimeDelta::seconds(60));
        queue.get_next_job().await.unwrap().unwrap();
        assert_eq!(
            queue.fail_job(id).await.unwrap(),
            FailOutcome::Rescheduled {
                available_at: t0() + TimeDelta::seconds(180)
            }
        );

        clock.advance(TimeDelta::seconds(120));
        let third = queue.get_next_job().await.unwrap().unwrap();
        assert_eq!(third.attempts, 3);
        assert_eq!(queue.fail_job(id).await.unwrap(), FailOutcome::Killed);

        let events = kills.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job_id, id);
        assert_eq!(events[0].job_type, "flaky");

        clock.advance(TimeDelta::days(30));
        assert!(queue.get_next_job().await.unwrap().is_none());
        assert_eq!(
            queue.fail_job(id).await.unwrap_err(),
            QueueError::RetryingKilledJob(id)
        );
        assert!(kills.try_recv().is_err());

        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.killed, stats.total()), (1, 1));
    }

    async fn no_intervals_means_first_failure_kills<S: JobStore>(store: S) {
        let clock = FrozenClock::arc(t0());
        let queue = queue_over(store, &clock);
        let id = queue.create_job(NewJob::new("once", json!(null))).await.unwrap();

        queue.get_next_job().await.unwrap().unwrap();
        assert_eq!(queue.fail_job(id).await.unwrap(), FailOutcome::Killed);
        assert_eq!(queue.get_job(id).await.unwrap().unwrap().state, JobState::Killed);
    }

    async fn misuse_is_reported<S: JobStore>(store: S) {
        let clock = FrozenClock::arc(t0());
        let queue = queue_over(store, &clock);

        let unknown = JobId::new();
        assert_eq!(
            queue.acknowledge_job(unknown).await.unwrap_err(),
            QueueError::JobNotFound(unknown)
        );

        let id = queue
            .create_job(NewJob::new("twice", json!(null)).retry_intervals([TimeDelta::seconds(1)]))
            .await
            .unwrap();
        queue.get_next_job().await.unwrap().unwrap();
        queue.fail_job(id).await.unwrap();
        assert_eq!(
            queue.fail_job(id).await.unwrap_err(),
            QueueError::JobAlreadyRescheduled(id)
        );

        assert!(matches!(
            queue.create_job(NewJob::new("", json!(null))).await,
            Err(QueueError::InvalidArgument(_))
        ));
        assert!(matches!(
            queue
                .create_job(NewJob::new("neg", json!(null)).retry_intervals([TimeDelta::seconds(-5)]))
                .await,
            Err(QueueError::InvalidArgument(_))
        ));
        assert_eq!(queue.stats().await.unwrap().total(), 1);
    }

    async fn acknowledged_jobs_disappear<S: JobStore>(store: S) {
        let clock = FrozenClock::arc(t0());
        let queue = queue_over(store, &clock);
        let id = queue.create_job(NewJob::new("done", json!(null))).await.unwrap();

        let job = queue.get_next_job().await.unwrap().unwrap();
        queue.acknowledge_job(job.id).await.unwrap();

        assert_eq!(queue.get_job(id).await.unwrap(), None);
        assert!(queue.get_next_job().await.unwrap().is_none());
    }

    // ---- storage boundary ----

    fn last_storable_instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap() + TimeDelta::microseconds(999_999)
    }

    async fn availability_beyond_year_9999_is_rejected<S: JobStore>(store: S) {
        let clock = FrozenClock::arc(t0());
        let queue = queue_over(store, &clock);

        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            queue.create_job(NewJob::new("far", json!(null)).available_at(far)).await,
            Err(QueueError::InvalidArgument(_))
        ));
        assert!(matches!(
            queue
                .create_job(NewJob::new("far", json!(null)).delayed(TimeDelta::days(3_000_000)))
                .await,
            Err(QueueError::InvalidArgument(_))
        ));

        let last = queue
            .create_job(NewJob::new("last", json!(null)).available_at(last_storable_instant()))
            .await
            .unwrap();
        let due = queue.create_job(NewJob::new("due", json!(null))).await.unwrap();

        assert_eq!(queue.get_next_job().await.unwrap().unwrap().id, due);
        assert!(queue.get_next_job().await.unwrap().is_none());

        clock.set_to(last_storable_instant());
        let job = queue.get_next_job().await.unwrap().unwrap();
        assert_eq!(job.id, last);
        assert_eq!(
            job.state,
            JobState::Reserved {
                at: last_storable_instant(),
                available_at: last_storable_instant(),
            }
        );
    }

    async fn backoff_beyond_year_9999_kills<S: JobStore>(store: S) {
        let clock = FrozenClock::arc(t0());
        let bus = Arc::new(InMemoryEventBus::<JobKilled>::new());
        let kills = bus.subscribe();
        let queue = queue_over(store, &clock).with_event_sink(bus.clone());

        let id = queue
            .create_job(
                NewJob::new("patient", json!(null))
                    .retry_intervals([TimeDelta::days(3_000_000), TimeDelta::seconds(1)]),
            )
            .await
            .unwrap();
        queue.get_next_job().await.unwrap().unwrap();

        assert_eq!(queue.fail_job(id).await.unwrap(), FailOutcome::Killed);
        assert_eq!(queue.get_job(id).await.unwrap().unwrap().state, JobState::Killed);
        assert_eq!(kills.drain().len(), 1);

        let next = queue.create_job(NewJob::new("next", json!(null))).await.unwrap();
        assert_eq!(queue.get_next_job().await.unwrap().unwrap().id, next);
    }

    async fn retry_intervals_are_stored_exactly<S: JobStore>(store: S) {
        let clock = FrozenClock::arc(t0());
        let queue = queue_over(store, &clock);
        let intervals = [
            TimeDelta::zero(),
            TimeDelta::milliseconds(1),
            TimeDelta::milliseconds(1_500),
            TimeDelta::days(3_000_000),
        ];

        let id = queue
            .create_job(NewJob::new("exact", json!(null)).retry_intervals(intervals))
            .await
            .unwrap();
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.retry_strategy.intervals(), &intervals);

        assert!(matches!(
            queue
                .create_job(
                    NewJob::new("fine", json!(null)).retry_intervals([TimeDelta::microseconds(1_500)])
                )
                .await,
            Err(QueueError::InvalidArgument(_))
        ));
        assert_eq!(queue.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn in_memory_pipeline() {
        type_and_arguments_round_trip(InMemoryJobStore::new()).await;
        delayed_jobs_wait(InMemoryJobStore::new()).await;
        backoff_then_kill_with_one_notification(InMemoryJobStore::new()).await;
        no_intervals_means_first_failure_kills(InMemoryJobStore::new()).await;
        misuse_is_reported(InMemoryJobStore::new()).await;
        acknowledged_jobs_disappear(InMemoryJobStore::new()).await;
        availability_beyond_year_9999_is_rejected(InMemoryJobStore::new()).await;
        backoff_beyond_year_9999_kills(InMemoryJobStore::new()).await;
        retry_intervals_are_stored_exactly(InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_pipeline() {
        type_and_arguments_round_trip(sqlite_memory().await).await;
        delayed_jobs_wait(sqlite_memory().await).await;
        backoff_then_kill_with_one_notification(sqlite_memory().await).await;
        no_intervals_means_first_failure_kills(sqlite_memory().await).await;
        misuse_is_reported(sqlite_memory().await).await;
        acknowledged_jobs_disappear(sqlite_memory().await).await;
        availability_beyond_year_9999_is_rejected(sqlite_memory().await).await;
        backoff_beyond_year_9999_kills(sqlite_memory().await).await;
        retry_intervals_are_stored_exactly(sqlite_memory().await).await;
    }

    // ---- concurrency ----

    const CONSUMERS: usize = 16;

    /// Race `CONSUMERS` tasks for a single eligible job.
    async fn race_for_one_job<S: JobStore + 'static>(queue: Arc<Queue<S>>) {
        let id = queue.create_job(NewJob::new("race", json!(null))).await.unwrap();
        let barrier = Arc::new(Barrier::new(CONSUMERS));

        let handles: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    queue.get_next_job().await.unwrap()
                })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                winners.push(job);
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].id, id);
        assert_eq!(winners[0].attempts, 1);
        assert_eq!(queue.get_job(id).await.unwrap().unwrap().attempts, 1);
    }

    /// Drain `jobs` jobs with `CONSUMERS` tasks; every job must be handed out
    /// exactly once.
    async fn drain_concurrently<S: JobStore + 'static>(queue: Arc<Queue<S>>, jobs: usize) {
        let mut created = HashSet::new();
        for n in 0..jobs {
            created.insert(queue.create_job(NewJob::new("drain", json!(n))).await.unwrap());
        }

        let handles: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut mine = Vec::new();
                    while let Some(job) = queue.get_next_job().await.unwrap() {
                        queue.acknowledge_job(job.id).await.unwrap();
                        mine.push(job.id);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = Vec::new();
        for handle in handles {
            seen.extend(handle.await.unwrap());
        }

        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(seen.len(), jobs, "a job was handed out twice");
        assert_eq!(unique, created);
        assert_eq!(queue.stats().await.unwrap().total(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_memory_reservation_is_exclusive() {
        let clock = FrozenClock::arc(t0());
        race_for_one_job(Arc::new(queue_over(InMemoryJobStore::new(), &clock))).await;
        drain_concurrently(Arc::new(queue_over(InMemoryJobStore::new(), &clock)), 200).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sqlite_reservation_is_exclusive() {
        let clock = FrozenClock::arc(t0());

        let db = TempDb::new();
        let store = SqliteJobStore::connect(&db.config()).await.unwrap();
        race_for_one_job(Arc::new(queue_over(store, &clock))).await;

        let db = TempDb::new();
        let store = SqliteJobStore::connect(&db.config()).await.unwrap();
        drain_concurrently(Arc::new(queue_over(store, &clock)), 60).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn separate_pools_on_one_file_never_share_a_job() {
        let clock = FrozenClock::arc(t0());
        let db = TempDb::new();
        let producer = queue_over(SqliteJobStore::connect(&db.config()).await.unwrap(), &clock);
        for n in 0..30 {
            producer.create_job(NewJob::new("shared", json!(n))).await.unwrap();
        }

        // Each pool stands in for a separate consumer process.
        let mut handles = Vec::new();
        for _ in 0..3 {
            let store = SqliteJobStore::connect(&db.config().with_max_connections(2))
                .await
                .unwrap();
            let queue = Arc::new(queue_over(store, &clock));
            for _ in 0..2 {
                let queue = queue.clone();
                handles.push(tokio::spawn(async move {
                    let mut mine = Vec::new();
                    while let Some(job) = queue.get_next_job().await.unwrap() {
                        mine.push(job.id);
                    }
                    mine
                }));
            }
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(seen.len(), 30);
        assert_eq!(unique.len(), 30);
        assert_eq!(producer.stats().await.unwrap().reserved, 30);
    }

    // ---- persistence ----

    #[tokio::test]
    async fn jobs_survive_reopening_the_database() {
        let clock = FrozenClock::arc(t0());
        let db = TempDb::new();

        let queue = queue_over(SqliteJobStore::connect(&db.config()).await.unwrap(), &clock);
        let id = queue
            .create_job(
                NewJob::new("persist", json!({"k": "v"}))
                    .retry_intervals([TimeDelta::seconds(30)]),
            )
            .await
            .unwrap();
        queue.get_next_job().await.unwrap().unwrap();
        queue.store().close().await;
        drop(queue);

        let reopened = queue_over(SqliteJobStore::connect(&db.config()).await.unwrap(), &clock);
        let job = reopened.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.state.is_reserved());
        assert_eq!(job.arguments, json!({"k": "v"}));

        assert_eq!(
            reopened.fail_job(id).await.unwrap(),
            FailOutcome::Rescheduled {
                available_at: t0() + TimeDelta::seconds(30)
            }
        );
    }
}
