//! Error types for model loading, prediction, encoding and registry access.
//!
//! Each stage of the serving path has its own error enum so callers can match
//! on exactly the failures that stage can produce:
//!
//! - [`LoadError`]: fatal to a single resolve attempt, never retried
//! - [`PredictError`]: per request, never affects the cached model
//! - [`EncodingError`]: a response could not be framed for the wire
//! - [`RegistryError`]: lookup/unload of a model that is not loaded, or a
//!   wrapped load failure
//!
//! [`ServingError`] unifies all of them for the transport layer and maps each
//! kind to a status code.

use std::path::PathBuf;
use thiserror::Error;

/// Failure while turning a [`ModelSettings`](crate::settings::ModelSettings)
/// into a loaded model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("Artifact corrupt at {}: {reason}", .path.display())]
    ArtifactCorrupt { path: PathBuf, reason: String },

    #[error("Adapter unavailable for {format}: {reason}")]
    AdapterUnavailable { format: String, reason: String },
}

impl LoadError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        LoadError::ArtifactCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unavailable(format: impl ToString, reason: impl ToString) -> Self {
        LoadError::AdapterUnavailable {
            format: format.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Failure while running inference on a loaded model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredictError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Datatype mismatch: {0}")]
    DatatypeMismatch(String),

    #[error("Unknown output requested: {0}")]
    UnknownOutput(String),

    #[error("Prediction failed: {0}")]
    PredictionFailed(String),
}

/// The payload could not be serialized into an event frame.
#[derive(Error, Debug)]
#[error("Encoding error: {0}")]
pub struct EncodingError(#[from] pub serde_json::Error);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Model not found: {name} (version {version})")]
    NotFound { name: String, version: String },

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl RegistryError {
    pub fn not_found(name: &str, version: Option<&str>) -> Self {
        RegistryError::NotFound {
            name: name.to_string(),
            version: version.unwrap_or("any").to_string(),
        }
    }
}

/// Stable error classification, independent of message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ArtifactNotFound,
    ArtifactCorrupt,
    AdapterUnavailable,
    ShapeMismatch,
    DatatypeMismatch,
    UnknownOutput,
    PredictionFailed,
    EncodingError,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ArtifactNotFound => "artifact_not_found",
            ErrorKind::ArtifactCorrupt => "artifact_corrupt",
            ErrorKind::AdapterUnavailable => "adapter_unavailable",
            ErrorKind::ShapeMismatch => "shape_mismatch",
            ErrorKind::DatatypeMismatch => "datatype_mismatch",
            ErrorKind::UnknownOutput => "unknown_output",
            ErrorKind::PredictionFailed => "prediction_failed",
            ErrorKind::EncodingError => "encoding_error",
            ErrorKind::NotFound => "not_found",
        }
    }
}

/// Umbrella error for everything the serving core can report.
#[derive(Error, Debug)]
pub enum ServingError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Predict(#[from] PredictError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("Model not found: {name} (version {version})")]
    NotFound { name: String, version: String },
}

impl From<RegistryError> for ServingError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { name, version } => ServingError::NotFound { name, version },
            RegistryError::Load(e) => ServingError::Load(e),
        }
    }
}

impl ServingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServingError::Load(LoadError::ArtifactNotFound(_)) => ErrorKind::ArtifactNotFound,
            ServingError::Load(LoadError::ArtifactCorrupt { .. }) => ErrorKind::ArtifactCorrupt,
            ServingError::Load(LoadError::AdapterUnavailable { .. }) => {
                ErrorKind::AdapterUnavailable
            }
            ServingError::Predict(PredictError::ShapeMismatch(_)) => ErrorKind::ShapeMismatch,
            ServingError::Predict(PredictError::DatatypeMismatch(_)) => ErrorKind::DatatypeMismatch,
            ServingError::Predict(PredictError::UnknownOutput(_)) => ErrorKind::UnknownOutput,
            ServingError::Predict(PredictError::PredictionFailed(_)) => ErrorKind::PredictionFailed,
            ServingError::Encoding(_) => ErrorKind::EncodingError,
            ServingError::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    /// HTTP status the transport should answer with.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::ArtifactNotFound => 404,
            ErrorKind::ShapeMismatch | ErrorKind::DatatypeMismatch | ErrorKind::UnknownOutput => 400,
            ErrorKind::ArtifactCorrupt
            | ErrorKind::AdapterUnavailable
            | ErrorKind::PredictionFailed
            | ErrorKind::EncodingError => 500,
        }
    }

    /// Request-time failures are the client's to fix; everything else is ours.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

pub type Result<T> = std::result::Result<T, ServingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_not_found_maps_to_404() {
        let err: ServingError = RegistryError::not_found("clf", Some("v1")).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.to_string(), "Model not found: clf (version v1)");
    }

    #[test]
    fn test_registry_load_error_keeps_kind() {
        let err: ServingError =
            RegistryError::from(LoadError::corrupt("/tmp/model.bin", "empty file")).into();
        assert_eq!(err.kind(), ErrorKind::ArtifactCorrupt);
        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().contains("/tmp/model.bin"));
    }

    #[test]
    fn test_predict_errors_are_client_errors() {
        let shape: ServingError = PredictError::ShapeMismatch("x".into()).into();
        let dtype: ServingError = PredictError::DatatypeMismatch("x".into()).into();
        let failed: ServingError = PredictError::PredictionFailed("x".into()).into();

        assert!(shape.is_client_error());
        assert!(dtype.is_client_error());
        assert!(!failed.is_client_error());
    }

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(ErrorKind::ArtifactNotFound.as_str(), "artifact_not_found");
        assert_eq!(ErrorKind::EncodingError.as_str(), "encoding_error");
    }
}
