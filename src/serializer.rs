//! Evaluates every proc of a [`ProcSet`] into `{name, quantity}` snapshots.
//!
//! Each call builds one fresh [`InspectionCache`] shared by all procs of that
//! call. Output order is always registry order: the concurrent mode tags each
//! unit of work with its index and writes into a pre-sized slot vector.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::SerializeError;
use crate::inspect::InspectionCache;
use crate::procs::{Proc, ProcSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcSnapshot {
    pub name: String,
    pub quantity: u64,
}

#[derive(Debug, Clone)]
pub struct ProcSerializer {
    use_concurrency: bool,
    max_workers: usize,
    proc_timeout: Option<Duration>,
}

impl Default for ProcSerializer {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ProcSerializer {
    pub fn new(use_concurrency: bool) -> Self {
        let max_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            use_concurrency,
            max_workers,
            proc_timeout: None,
        }
    }

    /// Bound on procs evaluated at once in concurrent mode. Zero is raised to one.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Fails a proc (and so the request) that takes longer than `timeout`.
    pub fn with_proc_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.proc_timeout = timeout;
        self
    }

    pub fn use_concurrency(&self) -> bool {
        self.use_concurrency
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub async fn serialize(&self, procs: &ProcSet) -> Result<Vec<ProcSnapshot>, SerializeError> {
        let cache = Arc::new(InspectionCache::new());
        let started = Instant::now();

        let snapshots = if self.use_concurrency && procs.len() > 1 {
            self.serialize_concurrent(procs, cache).await?
        } else {
            self.serialize_sequential(procs, &cache).await?
        };

        debug!(
            procs = snapshots.len(),
            concurrent = self.use_concurrency,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Serialized procs"
        );
        Ok(snapshots)
    }

    async fn serialize_sequential(
        &self,
        procs: &ProcSet,
        cache: &InspectionCache,
    ) -> Result<Vec<ProcSnapshot>, SerializeError> {
        let mut snapshots = Vec::with_capacity(procs.len());
        for proc in procs.iter() {
            let quantity = evaluate(proc.as_ref(), cache, self.proc_timeout).await?;
            snapshots.push(ProcSnapshot {
                name: proc.name().to_string(),
                quantity,
            });
        }
        Ok(snapshots)
    }

    async fn serialize_concurrent(
        &self,
        procs: &ProcSet,
        cache: Arc<InspectionCache>,
    ) -> Result<Vec<ProcSnapshot>, SerializeError> {
        let permits = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for (index, proc) in procs.iter().enumerate() {
            let proc = Arc::clone(proc);
            let cache = Arc::clone(&cache);
            let permits = Arc::clone(&permits);
            let timeout = self.proc_timeout;
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| SerializeError::Join(e.to_string()))?;
                let quantity = evaluate(proc.as_ref(), &cache, timeout).await?;
                Ok::<_, SerializeError>((index, quantity))
            });
        }

        let mut slots: Vec<Option<u64>> = vec![None; procs.len()];
        while let Some(joined) = tasks.join_next().await {
            // Returning early drops the set, which aborts the remaining procs
            let (index, quantity) = joined.map_err(|e| SerializeError::Join(e.to_string()))??;
            slots[index] = Some(quantity);
        }

        procs
            .iter()
            .zip(slots)
            .map(|(proc, slot)| {
                let quantity = slot.ok_or_else(|| {
                    SerializeError::Join(format!("proc '{}' produced no result", proc.name()))
                })?;
                Ok(ProcSnapshot {
                    name: proc.name().to_string(),
                    quantity,
                })
            })
            .collect()
    }
}

async fn evaluate(
    proc: &dyn Proc,
    cache: &InspectionCache,
    timeout: Option<Duration>,
) -> Result<u64, SerializeError> {
    let quantity = match timeout {
        Some(limit) => tokio::time::timeout(limit, proc.quantity(cache))
            .await
            .map_err(|_| SerializeError::Timeout {
                name: proc.name().to_string(),
                timeout_ms: limit.as_millis() as u64,
            })?,
        None => proc.quantity(cache).await,
    };

    quantity.map_err(|source| SerializeError::Proc {
        name: proc.name().to_string(),
        source,
    })
}
