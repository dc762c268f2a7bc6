use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{LoadError, PredictError};
use crate::settings::ModelSettings;
use crate::types::{InferenceRequest, InferenceResponse, MetadataModelResponse};

/// Artifact formats with an adapter in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// Generic estimator artifact (bincode or JSON)
    Estimator,
    /// GGUF weights served by llama.cpp
    Gguf,
}

impl ModelFormat {
    /// Probe order used when a format is neither declared nor detectable.
    pub const PRIORITY: [ModelFormat; 2] = [ModelFormat::Estimator, ModelFormat::Gguf];

    pub fn extensions(&self) -> &[&str] {
        match self {
            ModelFormat::Estimator => &["estimator", "bin", "json"],
            ModelFormat::Gguf => &["gguf"],
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ModelFormat::Estimator => "Estimator",
            ModelFormat::Gguf => "GGUF (llama.cpp)",
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type ResponseStream = BoxStream<'static, Result<InferenceResponse, PredictError>>;

/// Format-specific loader. One implementation per [`ModelFormat`].
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn format(&self) -> ModelFormat;

    /// Whether the native capability this adapter needs exists in this
    /// process. Probed once when the adapter is added to a catalog.
    fn is_available(&self) -> bool;

    async fn load(&self, settings: &ModelSettings) -> Result<Arc<dyn LoadedModel>, LoadError>;

    fn metadata(&self) -> RuntimeMetadata;
}

/// A loaded artifact bound to its settings.
///
/// Implementations must allow any number of concurrent `predict` calls on one
/// instance; predict never mutates the loaded artifact.
#[async_trait]
pub trait LoadedModel: Send + Sync + 'static {
    fn settings(&self) -> &ModelSettings;

    fn format(&self) -> ModelFormat;

    fn metadata(&self) -> MetadataModelResponse;

    async fn predict(&self, request: InferenceRequest) -> Result<InferenceResponse, PredictError>;

    /// Incremental predict. The default yields the single full response.
    /// Dropping the stream stops any remaining work.
    fn predict_stream(self: Arc<Self>, request: InferenceRequest) -> ResponseStream {
        Box::pin(futures::stream::once(async move { self.predict(request).await }))
    }

    /// Releases the artifact. Idempotent; callers drain in-flight predicts first.
    async fn unload(&self);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub format: ModelFormat,
    pub runtime_name: String,
    pub version: String,
    pub supports_streaming: bool,
}
