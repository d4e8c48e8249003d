//! Worker inspection and the per-request inspection cache.
//!
//! Brokers report the tasks their workers hold tagged with an
//! `(exchange, routing_key)` pair rather than the queue name. The
//! [`CeleryInspector`] asks the workers which queues they consume, maps the
//! pairs back to queue names and produces one frequency table per status.
//! All of it is memoized for the lifetime of one [`InspectionCache`], which
//! the serializer creates fresh for every request.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::backends::{InspectMethod, WorkerControl};
use crate::error::BackendError;

mod memo;
pub use memo::Memo;

// ========================================
// TASK STATUS
// ========================================

/// Where a task sits on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Currently executing
    Active,
    /// Prefetched by the worker, waiting for an execution slot
    Reserved,
    /// Held until an ETA (retries, countdowns)
    Scheduled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 3] = [TaskStatus::Active, TaskStatus::Reserved, TaskStatus::Scheduled];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Reserved => "reserved",
            TaskStatus::Scheduled => "scheduled",
        }
    }

    pub fn method(&self) -> InspectMethod {
        match self {
            TaskStatus::Active => InspectMethod::Active,
            TaskStatus::Reserved => InspectMethod::Reserved,
            TaskStatus::Scheduled => InspectMethod::Scheduled,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "reserved" => Ok(TaskStatus::Reserved),
            "scheduled" => Ok(TaskStatus::Scheduled),
            other => Err(BackendError::InvalidStatus(other.to_string())),
        }
    }
}

// ========================================
// WIRE SHAPES
// ========================================

#[derive(Debug, Deserialize)]
struct ActiveQueue {
    name: String,
    exchange: ExchangeRef,
    #[serde(default)]
    routing_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExchangeRef {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeliveryInfo {
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    routing_key: Option<String>,
}

/// An active or reserved task.
#[derive(Debug, Deserialize)]
struct HeldTask {
    delivery_info: DeliveryInfo,
}

/// A scheduled task wraps the original request one level deeper.
#[derive(Debug, Deserialize)]
struct ScheduledTask {
    request: HeldTask,
}

/// Flattens a `{worker: [entry, ...]}` reply into its entries.
fn worker_entries(reply: Value, method: InspectMethod) -> Result<Vec<Value>, BackendError> {
    match reply {
        Value::Null => Ok(Vec::new()),
        Value::Object(workers) => {
            let mut entries = Vec::new();
            for (worker, value) in workers {
                match value {
                    Value::Array(list) => entries.extend(list),
                    Value::Null => {}
                    other => {
                        return Err(BackendError::Malformed(format!(
                            "{method} reply for worker '{worker}' is not a list: {other}"
                        )))
                    }
                }
            }
            Ok(entries)
        }
        other => Err(BackendError::Malformed(format!(
            "{method} reply is not an object: {other}"
        ))),
    }
}

fn malformed(method: InspectMethod, err: serde_json::Error) -> BackendError {
    BackendError::Malformed(format!("{method}: {err}"))
}

// ========================================
// INSPECTOR
// ========================================

/// Per-queue task counts for one status.
pub type TaskCounts = Arc<HashMap<String, u64>>;

type RouteQueues = Arc<HashMap<(String, String), String>>;

/// Lazily inspects one broker application.
///
/// Every remote call is made at most once per inspector: the route table on
/// first need and each status table on first request for that status.
pub struct CeleryInspector {
    control: Arc<dyn WorkerControl>,
    simple_queues: bool,
    route_queues: OnceCell<RouteQueues>,
    counts: Memo<TaskStatus, TaskCounts>,
}

impl fmt::Debug for CeleryInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CeleryInspector")
            .field("identity", &self.control.identity())
            .field("simple_queues", &self.simple_queues)
            .finish()
    }
}

impl CeleryInspector {
    /// With `simple_queues` the exchange (or routing key) is taken as the
    /// queue name and the `active_queues` lookup is skipped entirely.
    pub fn new(control: Arc<dyn WorkerControl>, simple_queues: bool) -> Self {
        Self {
            control,
            simple_queues,
            route_queues: OnceCell::new(),
            counts: Memo::new(),
        }
    }

    pub fn simple_queues(&self) -> bool {
        self.simple_queues
    }

    /// Tasks per queue name for `status`.
    pub async fn task_counts(&self, status: TaskStatus) -> Result<TaskCounts, BackendError> {
        self.counts
            .get_or_try_init(status, |status| self.fetch_task_counts(status))
            .await
    }

    /// Like [`task_counts`](Self::task_counts), for a status given by name.
    pub async fn task_counts_for(&self, status: &str) -> Result<TaskCounts, BackendError> {
        self.task_counts(status.parse()?).await
    }

    /// Sum of the tasks held in `statuses` on any of `queues`.
    pub async fn count(&self, statuses: &[TaskStatus], queues: &[String]) -> Result<u64, BackendError> {
        let mut total = 0;
        for &status in statuses {
            let counts = self.task_counts(status).await?;
            total += queues
                .iter()
                .map(|queue| counts.get(queue).copied().unwrap_or(0))
                .sum::<u64>();
        }
        Ok(total)
    }

    /// `(exchange, routing_key) -> queue name`, from the workers' active queues.
    async fn route_queues(&self) -> Result<RouteQueues, BackendError> {
        self.route_queues
            .get_or_try_init(|| async {
                let method = InspectMethod::ActiveQueues;
                let reply = self.control.inspect(method).await?;
                let mut routes = HashMap::new();
                for entry in worker_entries(reply, method)? {
                    let queue: ActiveQueue =
                        serde_json::from_value(entry).map_err(|e| malformed(method, e))?;
                    let exchange = queue.exchange.name.unwrap_or_default();
                    let routing_key = queue.routing_key.unwrap_or_default();
                    routes.insert((exchange, routing_key), queue.name);
                }
                debug!(
                    identity = self.control.identity(),
                    routes = routes.len(),
                    "Resolved worker queue routes"
                );
                Ok::<_, BackendError>(Arc::new(routes))
            })
            .await
            .cloned()
    }

    async fn fetch_task_counts(&self, status: TaskStatus) -> Result<TaskCounts, BackendError> {
        let method = status.method();
        let reply = self.control.inspect(method).await?;
        let tasks = worker_entries(reply, method)?;

        let routes = if self.simple_queues {
            None
        } else {
            Some(self.route_queues().await?)
        };

        let mut queues = Vec::with_capacity(tasks.len());
        for task in tasks {
            let info = match status {
                TaskStatus::Scheduled => {
                    let task: ScheduledTask =
                        serde_json::from_value(task).map_err(|e| malformed(method, e))?;
                    task.request.delivery_info
                }
                TaskStatus::Active | TaskStatus::Reserved => {
                    let task: HeldTask =
                        serde_json::from_value(task).map_err(|e| malformed(method, e))?;
                    task.delivery_info
                }
            };
            if let Some(queue) = self.identify_queue(info, routes.as_deref()) {
                queues.push(queue);
            }
        }

        let mut counts: HashMap<String, u64> = HashMap::new();
        if status == TaskStatus::Scheduled {
            // A scheduled task shows up again on every poll until its ETA; a
            // queue counts once however many scheduled tasks it has.
            for queue in queues.into_iter().collect::<HashSet<_>>() {
                counts.insert(queue, 1);
            }
        } else {
            for queue in queues {
                *counts.entry(queue).or_insert(0) += 1;
            }
        }

        debug!(
            identity = self.control.identity(),
            status = %status,
            queues = counts.len(),
            "Inspected worker tasks"
        );
        Ok(Arc::new(counts))
    }

    fn identify_queue(
        &self,
        info: DeliveryInfo,
        routes: Option<&HashMap<(String, String), String>>,
    ) -> Option<String> {
        let routing_key = info.routing_key.unwrap_or_default();
        let exchange = match info.exchange {
            Some(exchange) if !exchange.is_empty() => exchange,
            _ => routing_key.clone(),
        };

        let Some(routes) = routes else {
            return Some(exchange);
        };

        match routes.get(&(exchange.clone(), routing_key.clone())) {
            Some(queue) => Some(queue.clone()),
            None => {
                // The worker topology changed between the two inspect calls.
                warn!(
                    identity = self.control.identity(),
                    exchange = %exchange,
                    routing_key = %routing_key,
                    "Task routed through an unknown exchange/routing key, not counting it"
                );
                None
            }
        }
    }
}

// ========================================
// INSPECTION CACHE
// ========================================

/// Shared state for one serialization request.
///
/// Holds one [`CeleryInspector`] per broker identity and mode. The default and
/// simple-queues modes never share an inspector, since their route tables
/// differ.
#[derive(Default)]
pub struct InspectionCache {
    inspectors: DashMap<(String, bool), Arc<CeleryInspector>>,
}

impl InspectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inspector(&self, control: &Arc<dyn WorkerControl>, simple_queues: bool) -> Arc<CeleryInspector> {
        self.inspectors
            .entry((control.identity().to_string(), simple_queues))
            .or_insert_with(|| Arc::new(CeleryInspector::new(control.clone(), simple_queues)))
            .value()
            .clone()
    }

    /// Number of inspectors created during this request.
    pub fn len(&self) -> usize {
        self.inspectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inspectors.is_empty()
    }
}
