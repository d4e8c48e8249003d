//! RQ (Redis Queue) procs.
//!
//! RQ keeps each queue as a Redis list `rq:queue:<name>`. Workers register in
//! the `rq:workers` set; each worker hash lists the queues it listens on and
//! the id of the job it is running. A running job counts toward the backlog
//! of every queue its worker listens on.

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::Deserialize;
use tracing::debug;

use crate::backends::RedisConnection;
use crate::error::{BackendError, ConfigError};
use crate::procs::{ClientBackend, ClientProc, Proc, ProcSpec, QueueClient, QueueList};

pub const KIND: &str = "rq";
pub const DEFAULT_QUEUES: [&str; 1] = ["default"];

const QUEUE_PREFIX: &str = "rq:queue:";
const JOB_PREFIX: &str = "rq:job:";
const WORKERS_KEY: &str = "rq:workers";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RqQueue {
    name: String,
    key: String,
}

impl RqQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let key = format!("{QUEUE_PREFIX}{name}");
        Self { name, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl QueueClient for RqQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug)]
pub struct RqBackend {
    redis: RedisConnection,
}

impl RqBackend {
    pub fn new(redis: RedisConnection) -> Self {
        Self { redis }
    }

    /// Workers listening on `queue` whose current job still exists.
    async fn busy_workers(&self, queue: &str) -> Result<u64, BackendError> {
        let mut conn = self.redis.connection().await?;
        let workers: Vec<String> = conn.smembers(WORKERS_KEY).await?;
        if workers.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        for worker in &workers {
            pipe.cmd("HMGET").arg(worker).arg("queues").arg("current_job");
        }
        let fields: Vec<(Option<String>, Option<String>)> = pipe.query_async(&mut conn).await?;

        let held: Vec<&str> = fields
            .iter()
            .filter_map(|(queues, job)| held_job(queues.as_deref(), job.as_deref(), queue))
            .collect();
        if held.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        for job_id in &held {
            pipe.cmd("EXISTS").arg(format!("{JOB_PREFIX}{job_id}"));
        }
        let exists: Vec<bool> = pipe.query_async(&mut conn).await?;
        Ok(count_existing(&held, &exists))
    }
}

/// The job a worker is running for `queue`, given its `queues` and
/// `current_job` hash fields. `queues` is a comma-separated list of names.
fn held_job<'a>(queues: Option<&str>, current_job: Option<&'a str>, queue: &str) -> Option<&'a str> {
    let listens = queues
        .map(|names| names.split(',').any(|name| name.trim() == queue))
        .unwrap_or(false);
    current_job.filter(|job| listens && !job.is_empty())
}

/// Held jobs that still exist in Redis.
fn count_existing(held: &[&str], exists: &[bool]) -> u64 {
    let mut busy = 0;
    for (job_id, &found) in held.iter().zip(exists) {
        if found {
            busy += 1;
        } else {
            // Job vanished from Redis while the worker still points at it
            debug!(job = %job_id, "Current job no longer exists, skipping");
        }
    }
    busy
}

#[async_trait]
impl ClientBackend for RqBackend {
    type Client = RqQueue;

    fn client(&self, queue: &str) -> Result<Option<RqQueue>, ConfigError> {
        Ok(Some(RqQueue::new(queue)))
    }

    async fn count(&self, client: &RqQueue) -> Result<u64, BackendError> {
        let queued = self.redis.llen(client.key()).await?;
        let running = self.busy_workers(client.queue_name()).await?;
        Ok(queued + running)
    }
}

pub type RqProc = ClientProc<RqBackend>;

impl ClientProc<RqBackend> {
    /// An RQ proc on the Redis server at `url`.
    pub fn rq(name: impl Into<String>, queues: impl Into<QueueList>, url: &str) -> Result<Self, ConfigError> {
        Self::from_names(name, queues, RqBackend::new(RedisConnection::open(url)?))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RqOptions {
    url: Option<String>,
}

pub(crate) fn from_spec(spec: &ProcSpec, default_url: &str) -> Result<Arc<dyn Proc>, ConfigError> {
    let meta = spec.meta(&DEFAULT_QUEUES)?;
    let options: RqOptions = spec.options()?;
    let url = options.url.as_deref().unwrap_or(default_url);
    let proc = RqProc::rq(meta.name(), meta.queues().to_vec(), url)?;
    Ok(Arc::new(proc))
}
