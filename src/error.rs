//! Error taxonomy.
//!
//! - [`ConfigError`]: fatal, raised while building procs at startup.
//! - [`BackendError`]: raised while talking to a queue backend during `quantity()`.
//! - [`SerializeError`]: a request-level failure wrapping the proc that caused it.
//! - [`ServeError`]: the HTTP listener could not be bound or served.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the proc {0:?} requires a name")]
    MissingName(String),

    #[error("the proc '{0}' requires at least one queue to check")]
    NoQueues(String),

    #[error("the proc '{name}' lists a blank queue name")]
    BlankQueue { name: String },

    #[error("given proc '{name}' overlaps with another already loaded proc")]
    DuplicateName { name: String },

    #[error("the proc reference '{reference}' could not be resolved: no constructor registered under that kind")]
    UnknownReference { reference: String },

    #[error("invalid options for proc '{name}': {reason}")]
    InvalidOptions { name: String, reason: String },

    #[error("the proc '{name}' inspects workers but its app has no worker control configured")]
    MissingControl { name: String },

    #[error("invalid backend url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("config error: {key} must be valid (got '{value}')")]
    InvalidEnv { key: String, value: String },

    #[error("at least one proc must be configured (set HIREFIRE_PROCS or HIREFIRE_PROCS_FILE)")]
    NoProcs,

    #[error("could not read procs file {path}: {source}")]
    ProcsFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse proc specs: {0}")]
    ProcSpecs(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// The queue has not been declared on the broker yet.
    #[error("queue '{queue}' not found")]
    NotFound { queue: String },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed backend reply: {0}")]
    Malformed(String),

    #[error("invalid task status: {0}")]
    InvalidStatus(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("proc '{name}' failed: {source}")]
    Proc {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("proc '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("proc evaluation task failed: {0}")]
    Join(String),
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}
