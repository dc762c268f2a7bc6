//! REST surface (KServe v2 style) over the model registry.

pub mod health_api;
pub mod inference_api;
pub mod repository_api;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::config::Config;
use crate::error::{RegistryError, ServingError};
use crate::model_runtime::ModelRegistry;
use crate::repository::ModelRepository;

pub use health_api::{get_metrics, live, ready};
pub use inference_api::{infer, infer_stream, model_metadata};
pub use repository_api::{load_model, repository_index, unload_model};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub repository: ModelRepository,
    pub config: Arc<Config>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

impl From<ServingError> for ApiError {
    fn from(err: ServingError) -> Self {
        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            status,
            kind: err.kind().as_str(),
            message: err.to_string(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        ServingError::from(err).into()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{} ({}): {}", self.status, self.kind, self.message);
        }
        (
            self.status,
            Json(json!({
                "error": self.message,
                "kind": self.kind,
                "code": self.status.as_u16(),
            })),
        )
            .into_response()
    }
}
