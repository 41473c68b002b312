//! HTTP status endpoint for worker thread snapshots.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;

use crate::worker::context::ThreadContextRegistry;

#[derive(Clone)]
struct StatusState {
    registry: Arc<ThreadContextRegistry>,
}

/// Build the router serving health and per-thread status.
pub fn status_routes(registry: Arc<ThreadContextRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/workers", get(list_workers))
        .route("/api/workers/{thread}", get(get_worker))
        .layer(CorsLayer::permissive())
        .with_state(StatusState { registry })
}

async fn health(State(state): State<StatusState>) -> impl IntoResponse {
    let summary = state.registry.summary().await;
    Json(serde_json::json!({
        "status": "ok",
        "service": "pipeline-worker",
        "version": env!("CARGO_PKG_VERSION"),
        "threads": summary,
    }))
}

async fn list_workers(State(state): State<StatusState>) -> impl IntoResponse {
    Json(state.registry.all().await)
}

async fn get_worker(
    State(state): State<StatusState>,
    Path(thread): Path<String>,
) -> impl IntoResponse {
    let Ok(thread) = thread.parse::<u32>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid thread number"})),
        );
    };

    match state.registry.get(thread).await {
        Some(status) => (StatusCode::OK, Json(serde_json::json!(status))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Unknown worker thread"})),
        ),
    }
}
