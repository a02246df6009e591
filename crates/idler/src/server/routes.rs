use axum::{
    body::Bytes,
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::AppState;
use crate::{
    auth, metrics,
    sources::ShutdownOutcome,
    Result,
};

pub const START_MESSAGE: &str = "Starting code-server instance.";

#[derive(Debug, Deserialize)]
pub struct PushQuery {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics() -> String {
    metrics::gather_metrics()
}

pub async fn start_code_server(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !auth::is_authorized(&state.auth.secret, header) {
        warn!("Rejected start request with invalid credentials");
        metrics::START_REQUESTS_TOTAL
            .with_label_values(&["unauthorized"])
            .inc();
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    }

    metrics::START_REQUESTS_TOTAL
        .with_label_values(&["authorized"])
        .inc();

    let started = state.controller.start(&state.identifier).await?;
    info!("Start of '{}' completed for {} instance(s)", state.identifier, started);

    Ok((StatusCode::OK, START_MESSAGE).into_response())
}

pub async fn pubsub_shutdown(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PushQuery>,
    body: Bytes,
) -> Result<Response> {
    if let Some(expected) = &state.auth.pubsub_token {
        let provided = query.token.as_deref().unwrap_or("");
        if !auth::secure_compare(expected, provided) {
            warn!("Rejected push delivery with invalid verification token");
            return Ok(StatusCode::UNAUTHORIZED.into_response());
        }
    }

    let body = match state.shutdown.handle_push(&body).await? {
        ShutdownOutcome::Stopped { instances } => json!({
            "outcome": "stopped",
            "instances": instances,
        }),
        ShutdownOutcome::Skipped(reason) => json!({
            "outcome": "skipped",
            "reason": reason.as_str(),
            "detail": reason.to_string(),
        }),
    };

    Ok((StatusCode::OK, Json(body)).into_response())
}
