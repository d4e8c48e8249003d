//! Procs and the proc registry.
//!
//! A proc is a named unit of scalable work (a Heroku-style process type)
//! watching one or more queues. Its `quantity` is the backlog the autoscaler
//! sizes the process against.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use hashlink::LinkedHashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{BackendError, ConfigError};
use crate::inspect::InspectionCache;

pub mod celery;
pub mod client;
pub mod factory;
pub mod hotqueue;
pub mod huey;
pub mod rq;

pub use celery::{CeleryApp, CeleryProc};
pub use client::{ClientBackend, ClientProc, QueueClient, QueueRef};
pub use factory::{ProcEntry, ProcFactory, ProcSpec};

/// Body of the `/hirefire/test` response.
pub const HIREFIRE_FOUND: &str = "HireFire Middleware Found!";

// ========================================
// PROC
// ========================================

#[async_trait]
pub trait Proc: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn queues(&self) -> &[String];

    /// Aggregated number of tasks on the proc's queues.
    ///
    /// `cache` lives for one serialization request and is shared by every proc
    /// evaluated in it; procs that have nothing to share ignore it.
    async fn quantity(&self, cache: &InspectionCache) -> Result<u64, BackendError>;
}

/// One queue name or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum QueueList {
    One(String),
    Many(Vec<String>),
}

impl QueueList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            QueueList::One(queue) => vec![queue],
            QueueList::Many(queues) => queues,
        }
    }
}

impl From<&str> for QueueList {
    fn from(queue: &str) -> Self {
        QueueList::One(queue.to_string())
    }
}

impl From<String> for QueueList {
    fn from(queue: String) -> Self {
        QueueList::One(queue)
    }
}

impl From<Vec<String>> for QueueList {
    fn from(queues: Vec<String>) -> Self {
        QueueList::Many(queues)
    }
}

impl From<Vec<&str>> for QueueList {
    fn from(queues: Vec<&str>) -> Self {
        QueueList::Many(queues.into_iter().map(String::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for QueueList {
    fn from(queues: [&str; N]) -> Self {
        QueueList::Many(queues.iter().map(|q| q.to_string()).collect())
    }
}

/// The name and queues every proc carries, validated once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcMeta {
    name: String,
    queues: Vec<String>,
}

impl ProcMeta {
    pub fn new(name: impl Into<String>, queues: impl Into<QueueList>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::MissingName(name));
        }
        let queues = queues.into().into_vec();
        if queues.is_empty() {
            return Err(ConfigError::NoQueues(name));
        }
        if queues.iter().any(|q| q.trim().is_empty()) {
            return Err(ConfigError::BlankQueue { name });
        }
        Ok(Self { name, queues })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }
}

// ========================================
// REGISTRY
// ========================================

/// Something that can be loaded into a [`ProcSet`].
pub enum ProcSource {
    /// An already constructed proc
    Loaded(Arc<dyn Proc>),
    /// A full spec, built by the factory constructor registered for its kind
    Spec(ProcSpec),
    /// A bare kind name; the constructor supplies every default
    Reference(String),
}

impl From<Arc<dyn Proc>> for ProcSource {
    fn from(proc: Arc<dyn Proc>) -> Self {
        ProcSource::Loaded(proc)
    }
}

impl From<ProcSpec> for ProcSource {
    fn from(spec: ProcSpec) -> Self {
        ProcSource::Spec(spec)
    }
}

impl From<&str> for ProcSource {
    fn from(reference: &str) -> Self {
        ProcSource::Reference(reference.to_string())
    }
}

impl ProcSource {
    fn resolve(self, factory: &ProcFactory) -> Result<Arc<dyn Proc>, ConfigError> {
        match self {
            ProcSource::Loaded(proc) => Ok(proc),
            ProcSource::Spec(spec) => factory.build(&spec),
            ProcSource::Reference(reference) => factory.build(&ProcSpec::new(reference)),
        }
    }
}

/// Two procs watching the same queue. Both will count it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOverlap {
    pub proc: String,
    pub other: String,
    pub queue: String,
}

/// Insertion-ordered procs keyed by name.
///
/// Built once at startup and read-only while requests are served.
#[derive(Default)]
pub struct ProcSet {
    procs: LinkedHashMap<String, Arc<dyn Proc>>,
    overlaps: Vec<QueueOverlap>,
}

impl fmt::Debug for ProcSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.procs.keys()).finish()
    }
}

impl ProcSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves and registers every source.
    ///
    /// Either all sources are registered or none: a resolution failure or a
    /// name collision (with an existing proc or within `sources`) leaves the
    /// set untouched.
    pub fn load<I, S>(&mut self, sources: I, factory: &ProcFactory) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<ProcSource>,
    {
        let mut staged: Vec<Arc<dyn Proc>> = Vec::new();
        for source in sources {
            let proc = source.into().resolve(factory)?;
            let taken = self.procs.contains_key(proc.name())
                || staged.iter().any(|p| p.name() == proc.name());
            if taken {
                return Err(ConfigError::DuplicateName {
                    name: proc.name().to_string(),
                });
            }
            staged.push(proc);
        }

        for proc in staged {
            self.record_overlaps(proc.as_ref());
            debug!(proc = %proc.name(), queues = ?proc.queues(), "Loaded proc");
            self.procs.insert(proc.name().to_string(), proc);
        }
        Ok(())
    }

    /// Registers a single constructed proc.
    pub fn insert(&mut self, proc: Arc<dyn Proc>) -> Result<(), ConfigError> {
        self.load([ProcSource::Loaded(proc)], &ProcFactory::new())
    }

    fn record_overlaps(&mut self, proc: &dyn Proc) {
        for (other_name, other) in self.procs.iter() {
            let mut seen: Vec<&str> = Vec::new();
            for queue in proc.queues() {
                if seen.contains(&queue.as_str()) || !other.queues().contains(queue) {
                    continue;
                }
                seen.push(queue);
                warn!(
                    proc = %proc.name(),
                    other = %other_name,
                    queue = %queue,
                    "Proc shares a queue with an already loaded proc, both will count it"
                );
                self.overlaps.push(QueueOverlap {
                    proc: proc.name().to_string(),
                    other: other_name.clone(),
                    queue: queue.clone(),
                });
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Proc>> {
        self.procs.get(name)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.procs.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Proc>> {
        self.procs.values()
    }

    /// Queue overlaps found while loading, in discovery order.
    pub fn overlaps(&self) -> &[QueueOverlap] {
        &self.overlaps
    }

    pub fn clear(&mut self) {
        self.procs.clear();
        self.overlaps.clear();
    }
}

/// Builds a fresh [`ProcSet`] from `sources`.
pub fn load_procs<I, S>(sources: I, factory: &ProcFactory) -> Result<ProcSet, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: Into<ProcSource>,
{
    let mut procs = ProcSet::new();
    procs.load(sources, factory)?;
    Ok(procs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Fixed {
        meta: ProcMeta,
        n: u64,
    }

    #[async_trait]
    impl Proc for Fixed {
        fn name(&self) -> &str {
            self.meta.name()
        }
        fn queues(&self) -> &[String] {
            self.meta.queues()
        }
        async fn quantity(&self, _cache: &InspectionCache) -> Result<u64, BackendError> {
            Ok(self.n)
        }
    }

    fn fixed(name: &str, queues: &[&str]) -> Arc<dyn Proc> {
        Arc::new(Fixed {
            meta: ProcMeta::new(name, queues.to_vec()).unwrap(),
            n: 1,
        })
    }

    #[test]
    fn meta_requires_name_and_queues() {
        assert!(matches!(ProcMeta::new("", "q"), Err(ConfigError::MissingName(_))));
        assert!(matches!(
            ProcMeta::new("worker", Vec::<String>::new()),
            Err(ConfigError::NoQueues(name)) if name == "worker"
        ));
        assert!(matches!(
            ProcMeta::new("worker", ["high", ""]),
            Err(ConfigError::BlankQueue { name }) if name == "worker"
        ));
        assert!(matches!(ProcMeta::new("worker", " "), Err(ConfigError::BlankQueue { .. })));
    }

    #[test]
    fn scalar_queue_becomes_list() {
        let meta = ProcMeta::new("worker", "default").unwrap();
        assert_eq!(meta.queues(), ["default".to_string()]);
    }

    #[test]
    fn queue_list_deserializes_scalar_or_list() {
        let one: QueueList = serde_json::from_str("\"high\"").unwrap();
        let many: QueueList = serde_json::from_str("[\"high\", \"low\"]").unwrap();
        assert_eq!(one.into_vec(), vec!["high"]);
        assert_eq!(many.into_vec(), vec!["high", "low"]);
    }

    #[test]
    fn keeps_insertion_order() {
        let procs = load_procs(
            [fixed("web", &["a"]), fixed("worker", &["b"]), fixed("mailer", &["c"])],
            &ProcFactory::new(),
        )
        .unwrap();
        assert_eq!(procs.names().collect::<Vec<_>>(), vec!["web", "worker", "mailer"]);
    }

    #[test]
    fn duplicate_name_rejects_whole_load() {
        let mut procs = ProcSet::new();
        procs.insert(fixed("existing", &["z"])).unwrap();

        let err = procs
            .load(
                [fixed("worker", &["a"]), fixed("worker", &["b"])],
                &ProcFactory::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName { name } if name == "worker"));
        assert_eq!(procs.names().collect::<Vec<_>>(), vec!["existing"]);

        let err = procs.insert(fixed("existing", &["y"])).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName { .. }));
    }

    #[test]
    fn overlapping_queues_are_recorded_once_per_pair() {
        let procs = load_procs(
            [
                fixed("a", &["shared", "only-a"]),
                fixed("b", &["shared", "shared"]),
                fixed("c", &["shared"]),
            ],
            &ProcFactory::new(),
        )
        .unwrap();
        assert_eq!(procs.len(), 3);
        let pairs: Vec<(&str, &str)> = procs
            .overlaps()
            .iter()
            .map(|o| (o.proc.as_str(), o.other.as_str()))
            .collect();
        assert_eq!(pairs, vec![("b", "a"), ("c", "a"), ("c", "b")]);
    }

    #[test]
    fn unknown_reference_fails() {
        let err = load_procs(["myapp.WorkerProc"], &ProcFactory::new()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownReference { reference } if reference == "myapp.WorkerProc"
        ));
    }

    #[test]
    fn clear_empties_the_set() {
        let mut procs = load_procs([fixed("a", &["q"]), fixed("b", &["q"])], &ProcFactory::new()).unwrap();
        procs.clear();
        assert!(procs.is_empty());
        assert!(procs.overlaps().is_empty());
    }
}
