//! Huey procs (Redis storage).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::backends::RedisConnection;
use crate::error::{BackendError, ConfigError};
use crate::procs::{ClientBackend, ClientProc, Proc, ProcSpec, QueueClient, QueueList};

pub const KIND: &str = "huey";

/// A Huey queue, stored as the list `huey.redis.<name>` where the name keeps
/// only its lowercase ASCII letters and digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HueyQueue {
    name: String,
    key: String,
}

impl HueyQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let cleaned: String = name
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .collect();
        let key = format!("huey.redis.{cleaned}");
        Self { name, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl QueueClient for HueyQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug)]
pub struct HueyBackend {
    redis: RedisConnection,
}

impl HueyBackend {
    pub fn new(redis: RedisConnection) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl ClientBackend for HueyBackend {
    type Client = HueyQueue;

    fn client(&self, queue: &str) -> Result<Option<HueyQueue>, ConfigError> {
        Ok(Some(HueyQueue::new(queue)))
    }

    async fn count(&self, client: &HueyQueue) -> Result<u64, BackendError> {
        self.redis.llen(client.key()).await
    }
}

pub type HueyRedisProc = ClientProc<HueyBackend>;

impl ClientProc<HueyBackend> {
    pub fn huey(name: impl Into<String>, queues: impl Into<QueueList>, url: &str) -> Result<Self, ConfigError> {
        Self::from_names(name, queues, HueyBackend::new(RedisConnection::open(url)?))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HueyOptions {
    url: Option<String>,
}

pub(crate) fn from_spec(spec: &ProcSpec, default_url: &str) -> Result<Arc<dyn Proc>, ConfigError> {
    let meta = spec.meta(&[])?;
    let options: HueyOptions = spec.options()?;
    let url = options.url.as_deref().unwrap_or(default_url);
    let proc = HueyRedisProc::huey(meta.name(), meta.queues().to_vec(), url)?;
    Ok(Arc::new(proc))
}
