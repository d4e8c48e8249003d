use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::procs::ProcEntry;

pub const DEFAULT_LOG: &str = "info";

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub hirefire: HireFireConfig,
}

impl Config {
    /// Reads the process environment. Call `dotenv` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads configuration through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            server: ServerConfig::load(&lookup)?,
            hirefire: HireFireConfig::load(&lookup)?,
        })
    }
}

// --- MODULES ---

// SERVER
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

impl ServerConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            host:      get_env(lookup, "HIREFIRE_HOST", "0.0.0.0")?,
            port:      get_env(lookup, "HIREFIRE_PORT", "8000")?,
            log_level: get_env(lookup, "HIREFIRE_LOG", DEFAULT_LOG)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// HIREFIRE
#[derive(Debug, Clone)]
pub struct HireFireConfig {
    pub token: String,
    pub use_concurrency: bool,
    /// `None` sizes the pool to the available parallelism
    pub max_workers: Option<usize>,
    pub proc_timeout: Option<Duration>,
    pub redis_url: String,
    pub procs: Vec<ProcEntry>,
}

impl HireFireConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            token:           get_env(lookup, "HIREFIRE_TOKEN", "development")?,
            use_concurrency: get_bool(lookup, "HIREFIRE_USE_CONCURRENCY", false)?,
            max_workers:     get_opt(lookup, "HIREFIRE_MAX_WORKERS")?,
            proc_timeout:    get_opt(lookup, "HIREFIRE_PROC_TIMEOUT_MS")?.map(Duration::from_millis),
            redis_url:       get_env(lookup, "HIREFIRE_REDIS_URL", "redis://127.0.0.1:6379/0")?,
            procs:           load_procs(lookup)?,
        })
    }
}

/// Proc entries from `HIREFIRE_PROCS` (inline JSON), else from the file named
/// by `HIREFIRE_PROCS_FILE`.
fn load_procs(lookup: &impl Fn(&str) -> Option<String>) -> Result<Vec<ProcEntry>, ConfigError> {
    let raw = match (lookup("HIREFIRE_PROCS"), lookup("HIREFIRE_PROCS_FILE")) {
        (Some(inline), _) => inline,
        (None, Some(path)) => {
            std::fs::read_to_string(&path).map_err(|source| ConfigError::ProcsFile { path, source })?
        }
        (None, None) => return Err(ConfigError::NoProcs),
    };

    let procs: Vec<ProcEntry> = serde_json::from_str(&raw)?;
    if procs.is_empty() {
        return Err(ConfigError::NoProcs);
    }
    Ok(procs)
}

// --- PRIVATE HELPERS ---

fn get_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<T, ConfigError> {
    let value = lookup(key).unwrap_or_else(|| default.to_string());
    value.parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value,
    })
}

fn get_opt<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value.trim().parse().map(Some).map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        }),
        _ => Ok(None),
    }
}

fn get_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        }),
    }
}
