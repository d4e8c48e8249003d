pub mod backends;
pub mod config;
pub mod error;
pub mod inspect;
pub mod procs;
pub mod serializer;
pub mod server;
pub mod utils;

use std::sync::Arc;

use crate::config::HireFireConfig;
use crate::error::{ConfigError, SerializeError};
use crate::procs::{load_procs, ProcFactory, ProcSet};
use crate::serializer::{ProcSerializer, ProcSnapshot};

// ========================================
// ENGINE
// ========================================

/// The loaded procs plus everything needed to answer HireFire.
///
/// Cheap to clone: the registry is shared and read-only once built.
#[derive(Clone)]
pub struct HireFire {
    procs: Arc<ProcSet>,
    serializer: ProcSerializer,
    token: Arc<str>,
}

impl std::fmt::Debug for HireFire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HireFire")
            .field("procs", &self.procs)
            .field("serializer", &self.serializer)
            .finish()
    }
}

impl HireFire {
    pub fn new(procs: ProcSet, token: impl Into<String>) -> Self {
        Self {
            procs: Arc::new(procs),
            serializer: ProcSerializer::default(),
            token: Arc::from(token.into()),
        }
    }

    pub fn with_serializer(mut self, serializer: ProcSerializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Builds every configured proc through `factory`.
    pub fn from_config(config: &HireFireConfig, factory: &ProcFactory) -> Result<Self, ConfigError> {
        let procs = load_procs(config.procs.iter().cloned(), factory)?;

        let mut serializer = ProcSerializer::new(config.use_concurrency).with_proc_timeout(config.proc_timeout);
        if let Some(max_workers) = config.max_workers {
            serializer = serializer.with_max_workers(max_workers);
        }

        Ok(Self::new(procs, config.token.clone()).with_serializer(serializer))
    }

    pub fn procs(&self) -> &ProcSet {
        &self.procs
    }

    pub fn serializer(&self) -> &ProcSerializer {
        &self.serializer
    }

    pub fn token_matches(&self, token: &str) -> bool {
        *self.token == *token
    }

    /// Current quantity of every proc, in registry order.
    pub async fn info(&self) -> Result<Vec<ProcSnapshot>, SerializeError> {
        self.serializer.serialize(&self.procs).await
    }
}
