//! Redis broker: task/result queues and worker identity.
//!
//! Tasks and results travel through Redis lists with competing consumers
//! (RPUSH/BLPOP, no ordering guarantee). BLPOP hands a message to exactly one
//! consumer; consumers push a message back onto its queue when they fail to
//! process it, which is what makes delivery at-least-once. Worker processes
//! additionally claim a numbered identity through a lease key so their box
//! id ranges never collide.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{cmd, AsyncCommands};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::Result;
use crate::messages::{GradingTask, JudgerTask, ResultMessage};

/// Redis key constants
pub mod keys {
    /// Worker lease key prefix for distributed worker ID allocation
    pub const WORKER_LEASE_PREFIX: &str = "judger:worker:lease:";

    /// Judger task queue (compile + grading tasks)
    pub const TASK_QUEUE: &str = "judger:tasks";

    /// Judger result queue (compile + grading results)
    pub const RESULT_QUEUE: &str = "judger:results";
}

const MAX_WORKERS: u32 = 10;
const WORKER_LEASE_TTL_SECS: u64 = 120;

/// Seam between the aggregator's task dispatcher and the broker, so tests
/// can record the fan-out instead of talking to Redis.
#[async_trait]
pub trait TaskPublisher: Send + Sync {
    async fn publish_grading(&self, task: GradingTask) -> Result<()>;
}

/// Redis-backed broker shared by workers and result consumers.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await;
        info!("Connected to Redis at {}", redis_url);
        Ok(Self { client, conn })
    }

    /// Connect using the `REDIS_URL` environment variable.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        Self::connect(&url).await
    }

    /// Clone of the underlying multiplexed connection, for components that
    /// share the broker's Redis instance (stores, caches).
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// Block until the next task is available. Reconnects on connection
    /// failure and skips messages that fail to parse.
    pub async fn pop_task(&mut self) -> Result<JudgerTask> {
        loop {
            match self.blpop(keys::TASK_QUEUE).await {
                Some(data) => match serde_json::from_str::<JudgerTask>(&data) {
                    Ok(task) => return Ok(task),
                    Err(e) => warn!("Failed to parse task data: {}. Data: {}", e, data),
                },
                None => continue,
            }
        }
    }

    /// Block until the next result message is available.
    pub async fn pop_result(&mut self) -> Result<ResultMessage> {
        loop {
            match self.blpop(keys::RESULT_QUEUE).await {
                Some(data) => match serde_json::from_str::<ResultMessage>(&data) {
                    Ok(message) => return Ok(message),
                    Err(e) => warn!("Failed to parse result data: {}. Data: {}", e, data),
                },
                None => continue,
            }
        }
    }

    async fn blpop(&mut self, queue: &str) -> Option<String> {
        let result: std::result::Result<Option<(String, String)>, _> =
            self.conn.blpop(queue, 0.0).await;
        match result {
            Ok(res) => res.map(|(_, data)| data),
            Err(e) => {
                warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                self.conn = get_connection_with_retry(&self.client).await;
                None
            }
        }
    }

    pub async fn publish_task(&self, task: &JudgerTask) -> Result<()> {
        self.push(keys::TASK_QUEUE, &serde_json::to_string(task)?)
            .await
    }

    pub async fn publish_result(&self, message: &ResultMessage) -> Result<()> {
        self.push(keys::RESULT_QUEUE, &serde_json::to_string(message)?)
            .await
    }

    async fn push(&self, queue: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(queue, payload)
            .await
            .with_context(|| format!("Failed to push to {}", queue))?;
        Ok(())
    }

    /// Allocate a unique worker ID (0 to MAX_WORKERS-1) using SET NX with a
    /// lease, and keep the lease alive from a background task.
    pub async fn allocate_worker_id(&self) -> Result<(u32, JoinHandle<()>)> {
        let worker_id = allocate_worker_id(&self.client).await?;
        info!(
            "Allocated worker_id={} (lease {}s)",
            worker_id, WORKER_LEASE_TTL_SECS
        );
        let heartbeat = spawn_lease_heartbeat(self.client.clone(), worker_id);
        Ok((worker_id, heartbeat))
    }
}

#[async_trait]
impl TaskPublisher for RedisBroker {
    async fn publish_grading(&self, task: GradingTask) -> Result<()> {
        self.publish_task(&JudgerTask::Grading(task)).await
    }
}

async fn get_connection_with_retry(client: &redis::Client) -> MultiplexedConnection {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

fn worker_lease_key(worker_id: u32) -> String {
    format!("{}{}", keys::WORKER_LEASE_PREFIX, worker_id)
}

async fn allocate_worker_id(client: &redis::Client) -> Result<u32> {
    loop {
        let mut conn = get_connection_with_retry(client).await;

        for worker_id in 0..MAX_WORKERS {
            let claimed: Option<String> = cmd("SET")
                .arg(worker_lease_key(worker_id))
                .arg("claimed")
                .arg("NX")
                .arg("EX")
                .arg(WORKER_LEASE_TTL_SECS as usize)
                .query_async(&mut conn)
                .await
                .context("Failed to claim worker lease")?;

            if claimed.is_some() {
                return Ok(worker_id);
            }
        }

        warn!(
            "No free worker_id (0-{}). Retrying in 1 second...",
            MAX_WORKERS - 1
        );
        sleep(Duration::from_secs(1)).await;
    }
}

fn spawn_lease_heartbeat(client: redis::Client, worker_id: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(Duration::from_secs(WORKER_LEASE_TTL_SECS / 2)).await;

            let mut conn = get_connection_with_retry(&client).await;
            if let Err(e) = cmd("EXPIRE")
                .arg(worker_lease_key(worker_id))
                .arg(WORKER_LEASE_TTL_SECS as usize)
                .query_async::<()>(&mut conn)
                .await
            {
                warn!("Failed to refresh worker lease {}: {}", worker_id, e);
            }
        }
    })
}
