//! In-process broker.
//!
//! Implements both [`QueueDepth`] and [`WorkerControl`] from plain maps, so a
//! service can embed its own queues or a test can script a broker topology.
//! Every inspection call is counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use crate::backends::{InspectMethod, QueueDepth, WorkerControl};
use crate::error::BackendError;
use crate::inspect::TaskStatus;
use crate::utils::utils_time::format_iso8601;

#[derive(Default)]
struct BrokerState {
    /// Declared queues and their depth
    depths: HashMap<String, u64>,
    /// worker -> queue descriptions, as `active_queues` reports them
    bindings: Vec<(String, Value)>,
    /// (status, worker) -> task payloads
    tasks: Vec<(TaskStatus, String, Value)>,
}

pub struct MemoryBroker {
    identity: String,
    state: Mutex<BrokerState>,
    inspect_calls: DashMap<InspectMethod, AtomicUsize>,
    latency: Option<Duration>,
    unavailable: AtomicBool,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("identity", &self.identity)
            .finish()
    }
}

impl MemoryBroker {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            state: Mutex::new(BrokerState::default()),
            inspect_calls: DashMap::new(),
            latency: None,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Delay every backend call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Declares `queue` (if needed) and sets its depth.
    pub fn declare_queue(&self, queue: &str, depth: u64) {
        self.state.lock().depths.insert(queue.to_string(), depth);
    }

    pub fn delete_queue(&self, queue: &str) {
        self.state.lock().depths.remove(queue);
    }

    /// Makes `worker` consume `queue` through the given exchange and routing key.
    pub fn bind_queue(&self, worker: &str, queue: &str, exchange: &str, routing_key: &str) {
        let description = json!({
            "name": queue,
            "exchange": { "name": exchange, "type": "direct" },
            "routing_key": routing_key,
        });
        self.state.lock().bindings.push((worker.to_string(), description));
    }

    /// Records a task held by `worker` in the given status.
    ///
    /// Scheduled tasks nest their delivery info under `request`, the way
    /// workers report them.
    pub fn add_task(&self, worker: &str, status: TaskStatus, exchange: &str, routing_key: &str) {
        let delivery_info = json!({
            "exchange": exchange,
            "routing_key": routing_key,
            "priority": 0,
            "redelivered": false,
        });
        let task = match status {
            TaskStatus::Scheduled => json!({
                "eta": format_iso8601(&(Utc::now() + chrono::Duration::minutes(5))),
                "priority": 6,
                "request": { "delivery_info": delivery_info },
            }),
            TaskStatus::Active | TaskStatus::Reserved => json!({
                "delivery_info": delivery_info,
            }),
        };
        self.state.lock().tasks.push((status, worker.to_string(), task));
    }

    /// Makes every subsequent call fail with [`BackendError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of times `method` reached this broker.
    pub fn inspect_calls(&self, method: InspectMethod) -> usize {
        self.inspect_calls
            .get(&method)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    async fn call(&self) -> Result<(), BackendError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(format!(
                "broker '{}' is down",
                self.identity
            )));
        }
        Ok(())
    }

    fn reply(entries: Vec<(String, Value)>) -> Value {
        if entries.is_empty() {
            return Value::Null;
        }
        let mut workers: Map<String, Value> = Map::new();
        for (worker, entry) in entries {
            if let Value::Array(list) = workers
                .entry(worker)
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                list.push(entry);
            }
        }
        Value::Object(workers)
    }
}

#[async_trait]
impl QueueDepth for MemoryBroker {
    async fn declared_depth(&self, queue: &str) -> Result<u64, BackendError> {
        self.call().await?;
        self.state
            .lock()
            .depths
            .get(queue)
            .copied()
            .ok_or_else(|| BackendError::NotFound { queue: queue.to_string() })
    }
}

#[async_trait]
impl WorkerControl for MemoryBroker {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn inspect(&self, method: InspectMethod) -> Result<Value, BackendError> {
        self.inspect_calls
            .entry(method)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::SeqCst);
        self.call().await?;

        let entries = {
            let state = self.state.lock();
            match method {
                InspectMethod::ActiveQueues => state.bindings.clone(),
                InspectMethod::Active | InspectMethod::Reserved | InspectMethod::Scheduled => {
                    state
                        .tasks
                        .iter()
                        .filter(|(s, _, _)| s.method() == method)
                        .map(|(_, worker, task)| (worker.clone(), task.clone()))
                        .collect()
                }
            }
        };
        Ok(Self::reply(entries))
    }
}
