//! HotQueue procs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::backends::RedisConnection;
use crate::error::{BackendError, ConfigError};
use crate::procs::{ClientBackend, ClientProc, Proc, ProcSpec, QueueClient, QueueList};

pub const KIND: &str = "hotqueue";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotQueue {
    name: String,
    key: String,
}

impl HotQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let key = format!("hotqueue:{name}");
        Self { name, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl QueueClient for HotQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug)]
pub struct HotQueueBackend {
    redis: RedisConnection,
}

impl HotQueueBackend {
    pub fn new(redis: RedisConnection) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl ClientBackend for HotQueueBackend {
    type Client = HotQueue;

    fn client(&self, queue: &str) -> Result<Option<HotQueue>, ConfigError> {
        Ok(Some(HotQueue::new(queue)))
    }

    async fn count(&self, client: &HotQueue) -> Result<u64, BackendError> {
        self.redis.llen(client.key()).await
    }
}

pub type HotQueueProc = ClientProc<HotQueueBackend>;

impl ClientProc<HotQueueBackend> {
    pub fn hotqueue(name: impl Into<String>, queues: impl Into<QueueList>, url: &str) -> Result<Self, ConfigError> {
        Self::from_names(name, queues, HotQueueBackend::new(RedisConnection::open(url)?))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HotQueueOptions {
    url: Option<String>,
}

pub(crate) fn from_spec(spec: &ProcSpec, default_url: &str) -> Result<Arc<dyn Proc>, ConfigError> {
    let meta = spec.meta(&[])?;
    let options: HotQueueOptions = spec.options()?;
    let url = options.url.as_deref().unwrap_or(default_url);
    let proc = HotQueueProc::hotqueue(meta.name(), meta.queues().to_vec(), url)?;
    Ok(Arc::new(proc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_made_client_is_kept() {
        let backend = HotQueueBackend::new(RedisConnection::open("redis://127.0.0.1/").unwrap());
        let queues = vec![
            crate::procs::QueueRef::Client(HotQueue::new("emails")),
            crate::procs::QueueRef::from("thumbnails"),
        ];
        let proc = HotQueueProc::new("worker", queues, backend).unwrap();
        let keys: Vec<&str> = proc.clients().iter().map(HotQueue::key).collect();
        assert_eq!(keys, vec!["hotqueue:emails", "hotqueue:thumbnails"]);
    }

    #[test]
    fn spec_with_scalar_queue() {
        let spec: ProcSpec =
            serde_json::from_str(r#"{"name": "worker", "kind": "hotqueue", "queues": "myqueue"}"#).unwrap();
        let proc = from_spec(&spec, "redis://127.0.0.1/").unwrap();
        assert_eq!(proc.queues(), ["myqueue"]);
    }
}
