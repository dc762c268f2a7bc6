use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use super::{ApiError, AppState};
use crate::metrics::{self, METRICS_CONTENT_TYPE};

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub models_loaded: usize,
    pub version: String,
}

/// GET /v2/health/live
pub async fn live() -> StatusCode {
    StatusCode::OK
}

/// GET /v2/health/ready
pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        ready: true,
        models_loaded: state.registry.list().len(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /metrics
pub async fn get_metrics() -> Result<impl IntoResponse, ApiError> {
    let buffer = metrics::gather()?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], buffer))
}
