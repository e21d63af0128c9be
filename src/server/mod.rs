//! HTTP surface: the extraction endpoint, the schema endpoint and the
//! embedded viewer.
//!
//! | Method | Path                   | Response |
//! |--------|------------------------|----------|
//! | GET    | `/`                    | single-page viewer (HTML) |
//! | GET    | `/api/health`          | `{"status":"ok","model":"<name>"}` |
//! | GET    | `/api/invoice-schema`  | JSON Schema of [`crate::CompleteInvoice`] |
//! | POST   | `/api/extract-invoice` | `text/event-stream`, one frame per step |
//!
//! The provider is resolved once, before the listener binds, so a missing
//! API key stops the server at startup rather than on the first upload.

mod handlers;

use crate::config::ServerConfig;
use crate::error::ExtractError;
use crate::workflow::Workflow;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use handlers::{error_frame, update_frame};

/// Shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<Workflow>,
}

impl AppState {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow: Arc::new(workflow),
        }
    }
}

/// Build the application router.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/api/health", get(handlers::health))
        .route("/api/invoice-schema", get(handlers::schema))
        .route("/api/extract-invoice", post(handlers::extract_invoice))
        .with_state(state)
        // axum's own 2 MB multipart default is replaced by the configured cap
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind `config.bind` and serve until Ctrl-C.
pub async fn serve(workflow: Workflow, config: &ServerConfig) -> Result<(), ExtractError> {
    let model = workflow.model_name().to_string();
    let router = build_router(AppState::new(workflow), config);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|e| ExtractError::Internal(format!("Cannot bind {}: {}", config.bind, e)))?;
    info!("Listening on http://{} (model: {})", config.bind, model);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ExtractError::Internal(format!("Server error: {}", e)))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down"),
        // no signal handler: run until killed
        Err(_) => std::future::pending::<()>().await,
    }
}
