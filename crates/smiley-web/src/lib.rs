//! JSON API over the synced documents and the sync job.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use smiley_core::CanonicalDocument;
use smiley_storage::DocumentStore;
use smiley_sync::{JobRunner, RunOutcome, Trigger};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "smiley-web";

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<JobRunner>,
}

impl AppState {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self { runner }
    }

    fn store(&self) -> &dyn DocumentStore {
        self.runner.pipeline().store().as_ref()
    }
}

#[derive(Debug, Deserialize)]
struct DocumentsQuery {
    since: Option<DateTime<Utc>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/documents", get(documents_handler))
        .route("/api/status", get(status_handler))
        .route("/api/sync", post(sync_handler))
        .with_state(Arc::new(state))
}

/// Serves until ctrl-c.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for ctrl-c");
            }
        })
        .await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn documents_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DocumentsQuery>,
) -> Response {
    let documents: Result<Vec<CanonicalDocument>, _> = match query.since {
        Some(since) => state.store().read_since(since).await,
        None => state
            .store()
            .read_all()
            .await
            .map(|snapshot| snapshot.into_documents()),
    };
    match documents {
        Ok(documents) => Json(documents).into_response(),
        Err(err) => server_error(anyhow::Error::new(err)),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.runner.status()).into_response()
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    // Detached so a client disconnect cannot cancel the run halfway.
    let runner = Arc::clone(&state.runner);
    let outcome = match tokio::spawn(async move { runner.trigger(Trigger::Manual).await }).await {
        Ok(outcome) => outcome,
        Err(err) => return server_error(anyhow::Error::new(err)),
    };
    match outcome {
        RunOutcome::Completed(summary) => Json(summary).into_response(),
        RunOutcome::Skipped => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "skipped",
                "reason": "a sync run is already in progress",
            })),
        )
            .into_response(),
        RunOutcome::Failed(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "status": "failed",
                "stage": err.stage(),
                "committed": err.committed(),
                "error": err.to_string(),
            })),
        )
            .into_response(),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
