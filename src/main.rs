use std::process::ExitCode;

use hirefire::config::{Config, DEFAULT_LOG};
use hirefire::procs::ProcFactory;
use hirefire::{server, HireFire};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ========================================
// MAIN ENTRY POINT
// ========================================

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let config = Config::from_env();
    let log_level = match &config {
        Ok(config) => config.server.log_level.clone(),
        Err(_) => DEFAULT_LOG.to_string(),
    };
    init_tracing(&log_level);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let factory = ProcFactory::with_builtin(config.hirefire.redis_url.clone());
    let engine = match HireFire::from_config(&config.hirefire, &factory) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Could not load procs");
            return ExitCode::FAILURE;
        }
    };

    info!(
        procs = ?engine.procs().names().collect::<Vec<_>>(),
        concurrent = engine.serializer().use_concurrency(),
        max_workers = engine.serializer().max_workers(),
        "HireFire starting"
    );

    match server::serve(engine, &config.server.addr()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over `HIREFIRE_LOG`.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
