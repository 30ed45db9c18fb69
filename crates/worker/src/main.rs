//! Demo consumer: enqueue a few jobs, then work them off until the queue is
//! idle or Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::TimeDelta;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;

use kew_core::{Job, NewJob, SystemClock, UuidV7Generator};
use kew_events::TracingSink;
use kew_infra::{HandlerError, Queue, QueueConfig, Worker, WorkerConfig};

#[derive(Debug, Deserialize)]
struct Greeting {
    message: String,
}

async fn greet(job: Job) -> Result<(), HandlerError> {
    let greeting: Greeting = job.arguments_as().map_err(HandlerError::new)?;
    tracing::info!(job_id = %job.id, message = %greeting.message, "greeting");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kew_observability::init();

    let queue_config = QueueConfig::from_env()?;
    let worker_config = WorkerConfig::from_env()?;

    let queue = Queue::open(
        &queue_config,
        Arc::new(SystemClock),
        Arc::new(UuidV7Generator),
    )
    .await
    .with_context(|| format!("failed to open queue at {}", queue_config.database_url))?
    .with_event_sink(Arc::new(TracingSink));
    let queue = Arc::new(queue);

    queue
        .create_job(NewJob::new("greet", json!({"message": "Hey!"})))
        .await?;
    queue
        .create_job(
            NewJob::new("greet", json!({"message": "Hey again!"})).delayed(TimeDelta::seconds(2)),
        )
        .await?;
    // No handler is registered for this type, so it is killed on first failure.
    queue
        .create_job(NewJob::new("shout", json!({"message": "HEY"})))
        .await?;

    let mut worker = Worker::new(queue.clone(), worker_config);
    worker.register_handler("greet", greet);
    worker.on_killed(|job, err| {
        tracing::error!(job_id = %job.id, job_type = %job.job_type, error = %err, "giving up on job");
    });
    let worker = Arc::new(worker);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(shutdown_rx).await }
    });

    // Stop on Ctrl-C, or once nothing is left to do.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
        let stats = queue.stats().await?;
        if stats.available + stats.scheduled + stats.reserved == 0 {
            break;
        }
    }

    shutdown_tx.send(true).ok();
    running.await.context("worker task panicked")?;

    tracing::info!(stats = ?worker.stats(), queue = ?queue.stats().await?, "done");
    Ok(())
}
