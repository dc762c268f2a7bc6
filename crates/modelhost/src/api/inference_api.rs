//! Inference endpoints.
//!
//! Unary inference answers with one JSON response. Streaming inference
//! answers with a `text/event-stream` body: one `data:` frame per response
//! increment, in order. If the model fails mid-stream, a final frame carries
//! the error object and the stream ends.

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{ApiError, AppState};
use crate::error::ServingError;
use crate::metrics;
use crate::streaming::{self, EVENT_STREAM_CONTENT_TYPE};
use crate::types::{InferenceRequest, InferenceResponse, MetadataModelResponse};

const KEEPALIVE_FRAME: &[u8] = b": keepalive\n\n";

#[derive(Debug, Deserialize)]
pub struct ModelPath {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Error object sent as the last frame of a failed stream.
#[derive(Debug, Serialize)]
struct StreamError<'a> {
    error: String,
    kind: &'a str,
}

/// GET /v2/models/:name[/versions/:version]
pub async fn model_metadata(
    State(state): State<AppState>,
    Path(path): Path<ModelPath>,
) -> Result<Json<MetadataModelResponse>, ApiError> {
    let model = state.registry.get(&path.name, path.version.as_deref())?;
    Ok(Json(model.metadata()))
}

/// POST /v2/models/:name[/versions/:version]/infer
pub async fn infer(
    State(state): State<AppState>,
    Path(path): Path<ModelPath>,
    Json(request): Json<InferenceRequest>,
) -> Result<Json<InferenceResponse>, ApiError> {
    let model = state.registry.get(&path.name, path.version.as_deref())?;
    debug!("Inference request {:?} for {}", request.id, model.settings().key());

    let started = Instant::now();
    let result = model.predict(request).await;
    metrics::observe_inference(started.elapsed().as_secs_f64());

    match result {
        Ok(response) => {
            metrics::inc_request(&path.name, "ok");
            Ok(Json(response))
        }
        Err(e) => {
            metrics::inc_request(&path.name, "error");
            Err(ServingError::from(e).into())
        }
    }
}

enum Next {
    Frame(Option<Result<Bytes, ServingError>>),
    KeepAlive,
}

/// POST /v2/models/:name[/versions/:version]/infer_stream
pub async fn infer_stream(
    State(state): State<AppState>,
    Path(path): Path<ModelPath>,
    Json(request): Json<InferenceRequest>,
) -> Result<Response, ApiError> {
    let model = state.registry.get(&path.name, path.version.as_deref())?;
    info!("Stream request {:?} for {}", request.id, model.settings().key());

    let keepalive_period = match state.config.stream_keepalive_seconds {
        0 => None,
        seconds => Some(Duration::from_secs(seconds)),
    };
    let model_name = path.name;
    let frames = streaming::encode_stream(model.predict_stream(request));

    let body = async_stream::stream! {
        futures_util::pin_mut!(frames);
        let mut keepalive = keepalive_period.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        loop {
            let next = tokio::select! {
                frame = frames.next() => Next::Frame(frame),
                _ = async {
                    match keepalive.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => Next::KeepAlive,
            };

            match next {
                Next::Frame(Some(Ok(frame))) => {
                    if let Some(interval) = keepalive.as_mut() {
                        interval.reset();
                    }
                    yield Ok::<Bytes, Infallible>(frame);
                }
                Next::Frame(Some(Err(e))) => {
                    warn!("Stream for {} failed: {}", model_name, e);
                    metrics::inc_request(&model_name, "error");
                    let error = StreamError { error: e.to_string(), kind: e.kind().as_str() };
                    if let Ok(frame) = streaming::encode(&error) {
                        yield Ok(frame);
                    }
                    break;
                }
                Next::Frame(None) => {
                    metrics::inc_request(&model_name, "ok");
                    break;
                }
                Next::KeepAlive => yield Ok(Bytes::from_static(KEEPALIVE_FRAME)),
            }
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}
