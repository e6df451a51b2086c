//! Judger worker process: pops tasks, runs them in isolate boxes, publishes
//! results.

use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use judged::broker::RedisBroker;
use judged::languages::init_languages;
use judged::sandbox::SandboxController;
use judged::storage::StorageClient;
use judged::worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    init_languages()?;

    let mut broker = RedisBroker::from_env().await?;
    let (worker_id, _lease) = broker.allocate_worker_id().await?;
    let storage = StorageClient::from_env().await?;
    let sandbox = SandboxController::from_env();

    let mut worker = Worker::new(sandbox, storage, worker_id);
    info!("Worker {} ready", worker_id);

    loop {
        let task = broker.pop_task().await?;
        match worker.process_task(task.clone()).await {
            Ok(result) => broker.publish_result(&result).await?,
            // No result is published on failure; the task goes back onto
            // the queue for another attempt.
            Err(e) if e.is_retriable() => {
                error!("Task failed: {}. Requeueing", e);
                broker.publish_task(&task).await?;
                sleep(Duration::from_secs(1)).await;
            }
            Err(e) => error!("Dropping unprocessable task: {}", e),
        }
    }
}
