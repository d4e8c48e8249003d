//! Procs counting through one backend client per queue.

use std::fmt;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{BackendError, ConfigError};
use crate::inspect::InspectionCache;
use crate::procs::{Proc, ProcMeta, QueueList};

/// A handle on one queue of a backend.
pub trait QueueClient: Send + Sync + fmt::Debug {
    fn queue_name(&self) -> &str;
}

/// The library-specific half of a [`ClientProc`].
#[async_trait]
pub trait ClientBackend: Send + Sync + fmt::Debug + 'static {
    type Client: QueueClient;

    /// Client for `queue`, or `None` to leave the queue out of the count.
    fn client(&self, queue: &str) -> Result<Option<Self::Client>, ConfigError>;

    async fn count(&self, client: &Self::Client) -> Result<u64, BackendError>;
}

/// A queue given either by name or as a ready-made client.
#[derive(Debug)]
pub enum QueueRef<C> {
    Name(String),
    Client(C),
}

impl<C: QueueClient> QueueRef<C> {
    pub fn queue_name(&self) -> &str {
        match self {
            QueueRef::Name(name) => name,
            QueueRef::Client(client) => client.queue_name(),
        }
    }
}

impl<C> From<&str> for QueueRef<C> {
    fn from(name: &str) -> Self {
        QueueRef::Name(name.to_string())
    }
}

impl<C> From<String> for QueueRef<C> {
    fn from(name: String) -> Self {
        QueueRef::Name(name)
    }
}

/// Sums a per-client count over the proc's queues.
///
/// Clients are built once, at construction. A queue the backend reports as
/// missing counts as zero; any other backend error fails the proc.
pub struct ClientProc<B: ClientBackend> {
    meta: ProcMeta,
    backend: B,
    clients: Vec<B::Client>,
}

impl<B: ClientBackend> fmt::Debug for ClientProc<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientProc")
            .field("name", &self.meta.name())
            .field("backend", &self.backend)
            .field("clients", &self.clients)
            .finish()
    }
}

impl<B: ClientBackend> ClientProc<B> {
    pub fn new(
        name: impl Into<String>,
        queues: Vec<QueueRef<B::Client>>,
        backend: B,
    ) -> Result<Self, ConfigError> {
        let names: Vec<String> = queues.iter().map(|q| q.queue_name().to_string()).collect();
        let meta = ProcMeta::new(name, names)?;

        let mut clients = Vec::with_capacity(queues.len());
        for queue in queues {
            match queue {
                QueueRef::Client(client) => clients.push(client),
                QueueRef::Name(name) => match backend.client(&name)? {
                    Some(client) => clients.push(client),
                    None => debug!(proc = %meta.name(), queue = %name, "No client for queue, skipping"),
                },
            }
        }

        Ok(Self {
            meta,
            backend,
            clients,
        })
    }

    /// Builds a proc from queue names only.
    pub fn from_names(
        name: impl Into<String>,
        queues: impl Into<QueueList>,
        backend: B,
    ) -> Result<Self, ConfigError> {
        let queues = queues.into().into_vec().into_iter().map(QueueRef::Name).collect();
        Self::new(name, queues, backend)
    }

    pub fn clients(&self) -> &[B::Client] {
        &self.clients
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[async_trait]
impl<B: ClientBackend> Proc for ClientProc<B> {
    fn name(&self) -> &str {
        self.meta.name()
    }

    fn queues(&self) -> &[String] {
        self.meta.queues()
    }

    async fn quantity(&self, _cache: &InspectionCache) -> Result<u64, BackendError> {
        let mut total = 0;
        for client in &self.clients {
            match self.backend.count(client).await {
                Ok(n) => total += n,
                Err(e) if e.is_not_found() => {
                    debug!(proc = %self.meta.name(), queue = %client.queue_name(), "Queue not declared yet, counting 0");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}
