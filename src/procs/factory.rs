//! Proc constructors by kind.
//!
//! Proc specs name a `kind`; the factory maps each kind to a constructor that
//! validates the proc spec's options and builds it. Unknown kinds fail at
//! startup with the offending reference.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::procs::{celery, hotqueue, huey, rq, Proc, ProcMeta, ProcSource, QueueList};

/// Builds a proc from its spec.
pub type ProcConstructor = Arc<dyn Fn(&ProcSpec) -> Result<Arc<dyn Proc>, ConfigError> + Send + Sync>;

/// Configuration of one proc, as found in `HIREFIRE_PROCS`.
///
/// ```json
/// {"name": "worker", "kind": "rq", "queues": ["high", "default"], "url": "redis://localhost/1"}
/// ```
///
/// Keys other than `name`, `kind` and `queues` are kind-specific options.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub queues: Option<QueueList>,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl ProcSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            name: None,
            kind: kind.into(),
            queues: None,
            options: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_queues(mut self, queues: impl Into<QueueList>) -> Self {
        self.queues = Some(queues.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Name and queues, falling back to `default_queues` when the proc spec has none.
    pub fn meta(&self, default_queues: &[&str]) -> Result<ProcMeta, ConfigError> {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => return Err(ConfigError::MissingName(self.kind.clone())),
        };
        let queues = match &self.queues {
            Some(queues) => queues.clone(),
            None => QueueList::Many(default_queues.iter().map(|q| q.to_string()).collect()),
        };
        ProcMeta::new(name, queues)
    }

    /// The kind-specific options, deserialized.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(Value::Object(self.options.clone())).map_err(|e| {
            ConfigError::InvalidOptions {
                name: self.name.clone().unwrap_or_else(|| self.kind.clone()),
                reason: e.to_string(),
            }
        })
    }
}

/// One element of a configured proc list: a full spec, or a bare kind
/// reference whose constructor supplies every default.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProcEntry {
    Reference(String),
    Spec(ProcSpec),
}

impl From<ProcEntry> for ProcSource {
    fn from(entry: ProcEntry) -> Self {
        match entry {
            ProcEntry::Reference(reference) => ProcSource::Reference(reference),
            ProcEntry::Spec(spec) => ProcSource::Spec(spec),
        }
    }
}

/// Registry of proc constructors keyed by kind.
#[derive(Clone, Default)]
pub struct ProcFactory {
    constructors: BTreeMap<String, ProcConstructor>,
}

impl std::fmt::Debug for ProcFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

impl ProcFactory {
    /// A factory with no kinds registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory knowing the built-in kinds: `celery`, `rq`, `huey` and
    /// `hotqueue`. Specs without a `url` option connect to `redis_url`.
    pub fn with_builtin(redis_url: impl Into<String>) -> Self {
        let redis_url: Arc<str> = Arc::from(redis_url.into());
        let mut factory = Self::new();

        let url = redis_url.clone();
        factory.register(celery::KIND, move |spec| celery::from_spec(spec, &url));
        let url = redis_url.clone();
        factory.register(rq::KIND, move |spec| rq::from_spec(spec, &url));
        let url = redis_url.clone();
        factory.register(huey::KIND, move |spec| huey::from_spec(spec, &url));
        let url = redis_url;
        factory.register(hotqueue::KIND, move |spec| hotqueue::from_spec(spec, &url));

        factory
    }

    /// Registers (or replaces) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&ProcSpec) -> Result<Arc<dyn Proc>, ConfigError> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn build(&self, spec: &ProcSpec) -> Result<Arc<dyn Proc>, ConfigError> {
        let constructor = self
            .constructors
            .get(&spec.kind)
            .ok_or_else(|| ConfigError::UnknownReference {
                reference: spec.kind.clone(),
            })?;
        constructor(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Opts {
        url: Option<String>,
    }

    #[test]
    fn spec_from_json_collects_options() {
        let spec: ProcSpec = serde_json::from_str(
            r#"{"name": "worker", "kind": "rq", "queues": "high", "url": "redis://x/"}"#,
        )
        .unwrap();
        assert_eq!(spec.name.as_deref(), Some("worker"));
        assert_eq!(spec.queues, Some(QueueList::One("high".into())));

        let opts: Opts = spec.options().unwrap();
        assert_eq!(opts.url.as_deref(), Some("redis://x/"));
    }

    #[test]
    fn unknown_option_is_a_config_error() {
        let spec = ProcSpec::new("rq").with_name("worker").with_option("urll", "redis://x/");
        let err = spec.options::<Opts>().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOptions { name, .. } if name == "worker"));
    }

    #[test]
    fn meta_uses_default_queues() {
        let spec = ProcSpec::new("rq").with_name("worker");
        let meta = spec.meta(&["default"]).unwrap();
        assert_eq!(meta.queues(), ["default".to_string()]);

        let err = ProcSpec::new("rq").meta(&["default"]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingName(_)));

        let err = ProcSpec::new("huey").with_name("w").meta(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::NoQueues(_)));
    }

    #[test]
    fn entries_are_references_or_specs() {
        let entries: Vec<ProcEntry> =
            serde_json::from_str(r#"["myapp.Worker", {"name": "w", "kind": "rq"}]"#).unwrap();
        assert!(matches!(&entries[0], ProcEntry::Reference(r) if r == "myapp.Worker"));
        assert!(matches!(&entries[1], ProcEntry::Spec(s) if s.kind == "rq"));
    }

    #[test]
    fn builtin_kinds() {
        let factory = ProcFactory::with_builtin("redis://127.0.0.1/");
        assert_eq!(
            factory.kinds().collect::<Vec<_>>(),
            vec!["celery", "hotqueue", "huey", "rq"]
        );
    }

    #[test]
    fn unknown_kind_names_the_reference() {
        let err = ProcFactory::new().build(&ProcSpec::new("sidekiq")).unwrap_err();
        assert!(err.to_string().contains("sidekiq"));
    }
}
