//! Model descriptors.
//!
//! A [`ModelSettings`] identifies one servable model instance by name and
//! version and carries the parameters an adapter needs to load it. Settings
//! are created once (usually by [`ModelRepository`](crate::repository::ModelRepository))
//! and shared read-only afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use validator::Validate;

use crate::error::LoadError;
use crate::model_runtime::ModelFormat;

/// Adapter-facing parameters of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ModelParameters {
    /// Artifact location: a local path or a `file://` URI.
    #[validate(length(min = 1))]
    pub uri: String,
    /// Declared artifact format. When absent the registry detects it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ModelFormat>,
    /// Version token, used when the settings file has no top-level version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Adapter specific options (e.g. `endpoint`, `runtime_binary`).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModelParameters {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            format: None,
            version: None,
            content_type: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_format(mut self, format: ModelFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_extra(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Resolves the uri to a local filesystem path.
    ///
    /// Remote schemes are not fetched here; artifact retrieval happens before
    /// settings reach the runtime, so anything but a local path is reported as
    /// not found.
    pub fn artifact_path(&self) -> Result<PathBuf, LoadError> {
        if let Some(path) = self.uri.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }
        if self.uri.contains("://") {
            return Err(LoadError::ArtifactNotFound(PathBuf::from(&self.uri)));
        }
        Ok(PathBuf::from(&self.uri))
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

/// Identity and configuration of one servable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ModelSettings {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub version: String,
    #[validate]
    pub parameters: ModelParameters,
}

impl ModelSettings {
    pub fn new(name: impl Into<String>, version: impl Into<String>, parameters: ModelParameters) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            parameters,
        }
    }

    pub fn key(&self) -> ModelKey {
        ModelKey::new(&self.name, &self.version)
    }
}

/// Registry key: (name, version). Versions are opaque, so ordering is only
/// lexicographic and carries no "newer than" meaning.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub name: String,
    pub version: String,
}

impl ModelKey {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_path_plain_and_file_uri() {
        let plain = ModelParameters::new("/tmp/model.bin");
        assert_eq!(plain.artifact_path().unwrap(), PathBuf::from("/tmp/model.bin"));

        let uri = ModelParameters::new("file:///tmp/model.bin");
        assert_eq!(uri.artifact_path().unwrap(), PathBuf::from("/tmp/model.bin"));
    }

    #[test]
    fn test_artifact_path_rejects_remote_scheme() {
        let remote = ModelParameters::new("s3://bucket/model.bin");
        assert!(matches!(
            remote.artifact_path(),
            Err(LoadError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_settings_validation() {
        let ok = ModelSettings::new("clf", "v1", ModelParameters::new("/tmp/model.bin"));
        assert!(ok.validate().is_ok());

        let empty_version = ModelSettings::new("clf", "", ModelParameters::new("/tmp/model.bin"));
        assert!(empty_version.validate().is_err());

        let empty_uri = ModelSettings::new("clf", "v1", ModelParameters::new(""));
        assert!(empty_uri.validate().is_err());
    }

    #[test]
    fn test_settings_json_shape() {
        let json = r#"{
            "name": "clf",
            "version": "v1",
            "parameters": {"uri": "/tmp/model.bin", "format": "estimator", "extra": {"threads": 2}}
        }"#;
        let settings: ModelSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.key(), ModelKey::new("clf", "v1"));
        assert_eq!(settings.parameters.format, Some(ModelFormat::Estimator));
        assert_eq!(settings.parameters.extra["threads"], 2);
    }

    #[test]
    fn test_model_key_display_and_order() {
        let a = ModelKey::new("a", "v2");
        let b = ModelKey::new("b", "v1");
        assert_eq!(a.to_string(), "a:v2");
        assert!(a < b);
    }
}
