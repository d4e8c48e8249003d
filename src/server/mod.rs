//! HTTP surface polled by HireFire.
//!
//! - `/hirefire/test` answers with a fixed body, without touching any proc.
//! - `/hirefire/{token}/info` serializes every proc when the token matches,
//!   and is a plain 404 otherwise.
//!
//! Both accept GET and POST, with or without a trailing slash.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::error::ServeError;
use crate::procs::HIREFIRE_FOUND;
use crate::HireFire;

pub fn router(engine: HireFire) -> Router {
    Router::new()
        .route("/hirefire/test", get(test).post(test))
        .route("/hirefire/test/", get(test).post(test))
        .route("/hirefire/{token}/info", get(proc_info).post(proc_info))
        .route("/hirefire/{token}/info/", get(proc_info).post(proc_info))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Binds `addr` and serves until Ctrl-C.
pub async fn serve(engine: HireFire, addr: &str) -> Result<(), ServeError> {
    let listener = TcpListener::bind(addr).await.map_err(|source| ServeError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    info!(addr = %addr, procs = engine.procs().len(), "HireFire endpoint listening");

    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HireFire endpoint stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => {
            // Without a signal handler the server runs until killed
            error!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}

async fn test() -> &'static str {
    HIREFIRE_FOUND
}

async fn proc_info(State(engine): State<HireFire>, Path(token): Path<String>) -> Response {
    if !engine.token_matches(&token) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let span = info_span!("hirefire_info", request_id = %Uuid::new_v4());
    match engine.info().instrument(span.clone()).await {
        Ok(snapshots) => Json(snapshots).into_response(),
        Err(e) => {
            span.in_scope(|| error!(error = %e, "Proc serialization failed"));
            (StatusCode::INTERNAL_SERVER_ERROR, "proc serialization failed").into_response()
        }
    }
}
