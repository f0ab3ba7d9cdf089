use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use super::manager::ProcessorManager;
use super::models::WebhookEvent;

/// Build a router that accepts POSTs on any registered webhook path.
///
/// Paths are resolved against the manager per request, so processors
/// registered after the router was built get an endpoint too. A request
/// only enqueues; processing happens on the path worker, so the sender
/// gets its response without waiting for handlers. Unregistered paths
/// get a 404.
pub fn webhook_router(manager: Arc<ProcessorManager>) -> Router {
    Router::new()
        .route("/{*path}", post(ingest))
        .with_state(manager)
}

async fn ingest(
    State(manager): State<Arc<ProcessorManager>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = format!("/{path}");
    if !manager.is_registered(&path) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(path, error = %err, "webhook delivery body is not valid JSON");
            return Json(json!({
                "status": "error",
                "message": format!("invalid JSON payload: {err}"),
            }))
            .into_response();
        }
    };
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let event = WebhookEvent::new(payload, headers);
    let trace_id = event.trace_id.clone();

    match manager.enqueue(&path, event).await {
        Ok(()) => {
            tracing::debug!(path, trace_id, "webhook delivery accepted");
            Json(json!({ "status": "ok" })).into_response()
        }
        Err(err) => {
            tracing::warn!(path, trace_id, error = %err, "webhook delivery rejected");
            Json(json!({ "status": "error", "message": err.to_string() })).into_response()
        }
    }
}
