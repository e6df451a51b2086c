//! Result handler process: consumes result messages, drives submissions
//! through their state machine, and invalidates contest ranklists.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use judged::aggregator::ResultAggregator;
use judged::broker::RedisBroker;
use judged::ranklist::RedisCacheStore;
use judged::store::redis::{RedisProblemStore, RedisSubmissionStore};
use judged::types::SubmissionType;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut broker = RedisBroker::from_env().await?;
    let conn = broker.connection();

    let submissions = Arc::new(RedisSubmissionStore::new(conn.clone()));
    let problems = Arc::new(RedisProblemStore::new(conn.clone()));
    let aggregator = ResultAggregator::new(submissions, problems, Arc::new(broker.clone()));
    let cache_store = Arc::new(RedisCacheStore::new(conn));

    info!("Result handler ready");

    loop {
        let message = broker.pop_result().await?;
        match aggregator.handle_result(message.clone()).await {
            Ok(Some(finalized)) => {
                if finalized.submission_type == SubmissionType::Contest {
                    if let Some(contest_id) = &finalized.contest_id {
                        if let Err(e) =
                            judged::ranklist::mark_obsolete(cache_store.as_ref(), contest_id).await
                        {
                            error!(
                                "Failed to mark ranklist obsolete for {}: {}",
                                contest_id, e
                            );
                        }
                    }
                }
            }
            Ok(None) => {}
            // Submission state was not advanced; the message goes back onto
            // the queue so redelivery can repair the partial handling.
            Err(e) if e.is_retriable() => {
                error!("Failed to handle result: {}. Requeueing", e);
                broker.publish_result(&message).await?;
                sleep(Duration::from_secs(1)).await;
            }
            Err(e) => error!("Dropping unprocessable result: {}", e),
        }
    }
}
