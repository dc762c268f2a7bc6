//! Estimator Runtime Adapter
//!
//! In-process adapter for generic estimator artifacts. Loading and scoring
//! run on tokio's blocking pool; rows are scored in parallel with rayon.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::estimator::{Estimator, EstimatorArtifact, Prediction};
use super::runtime_trait::*;
use crate::error::{LoadError, PredictError};
use crate::settings::ModelSettings;
use crate::types::{
    Datatype, InferenceRequest, InferenceResponse, MetadataModelResponse, NamedTensor,
    TensorData, TensorMetadata,
};

pub const PREDICT_OUTPUT: &str = "predict";
pub const PREDICT_PROBA_OUTPUT: &str = "predict_proba";

#[derive(Debug, Default)]
pub struct EstimatorAdapter;

impl EstimatorAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModelAdapter for EstimatorAdapter {
    fn format(&self) -> ModelFormat {
        ModelFormat::Estimator
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn load(&self, settings: &ModelSettings) -> Result<Arc<dyn LoadedModel>, LoadError> {
        let path = settings.parameters.artifact_path()?;
        info!("Loading estimator artifact for {} from {}", settings.key(), path.display());

        let task_path = path.clone();
        let artifact = tokio::task::spawn_blocking(move || EstimatorArtifact::read_from(&task_path))
            .await
            .map_err(|e| LoadError::corrupt(&path, format!("loader task failed: {}", e)))??;

        info!(
            "Loaded {} ({} features) for {}",
            artifact.estimator.kind(),
            artifact
                .estimator
                .n_features()
                .map_or_else(|| "any".to_string(), |n| n.to_string()),
            settings.key()
        );
        Ok(Arc::new(EstimatorModel {
            settings: settings.clone(),
            estimator: ArcSwapOption::from_pointee(artifact.estimator),
        }))
    }

    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            format: ModelFormat::Estimator,
            runtime_name: "estimator (in-process)".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            supports_streaming: false,
        }
    }
}

pub struct EstimatorModel {
    settings: ModelSettings,
    /// `None` once unloaded.
    estimator: ArcSwapOption<Estimator>,
}

impl EstimatorModel {
    fn loaded(&self) -> Result<Arc<Estimator>, PredictError> {
        self.estimator.load_full().ok_or_else(|| {
            PredictError::PredictionFailed(format!("model {} is unloaded", self.settings.key()))
        })
    }
}

/// Reads the single feature matrix out of a request: `[rows, features]`, or a
/// 1-D shape as one row.
fn feature_matrix(request: &InferenceRequest) -> Result<(Vec<f64>, usize, usize), PredictError> {
    let input = match request.inputs.as_slice() {
        [input] => input,
        inputs => {
            return Err(PredictError::ShapeMismatch(format!(
                "estimator models take exactly 1 input tensor, got {}",
                inputs.len()
            )))
        }
    };

    if !input.datatype.is_numeric() {
        return Err(PredictError::DatatypeMismatch(format!(
            "input '{}' is {}, expected a numeric datatype",
            input.name,
            input.datatype.as_str()
        )));
    }
    input.validate()?;

    let (rows, cols) = match input.shape.as_slice() {
        [cols] => (1, *cols),
        [rows, cols] => (*rows, *cols),
        shape => {
            return Err(PredictError::ShapeMismatch(format!(
                "input '{}' must be 1-D or 2-D, got shape {:?}",
                input.name, shape
            )))
        }
    };

    let values = input.data.to_f64_vec().ok_or_else(|| {
        PredictError::DatatypeMismatch(format!("input '{}' carries non-numeric data", input.name))
    })?;
    Ok((values, rows, cols))
}

fn score(
    estimator: &Estimator,
    outputs: &[String],
    values: &[f64],
    rows: usize,
    cols: usize,
) -> Result<Vec<NamedTensor>, PredictError> {
    outputs
        .iter()
        .map(|name| match name.as_str() {
            PREDICT_OUTPUT => {
                let tensor = match estimator.predict(values, cols)? {
                    Prediction::Labels(labels) => {
                        NamedTensor::new(PREDICT_OUTPUT, vec![rows, 1], TensorData::Int(labels))
                    }
                    Prediction::Values(values) => {
                        NamedTensor::new(PREDICT_OUTPUT, vec![rows, 1], TensorData::Float(values))
                    }
                };
                Ok(tensor)
            }
            PREDICT_PROBA_OUTPUT => {
                let proba = estimator.predict_proba(values, cols)?;
                let n_classes = estimator.classes().map_or(0, <[i64]>::len);
                Ok(NamedTensor::new(
                    PREDICT_PROBA_OUTPUT,
                    vec![rows, n_classes],
                    TensorData::Float(proba),
                ))
            }
            other => Err(PredictError::UnknownOutput(format!(
                "'{}' (available: {}, {})",
                other, PREDICT_OUTPUT, PREDICT_PROBA_OUTPUT
            ))),
        })
        .collect()
}

#[async_trait]
impl LoadedModel for EstimatorModel {
    fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::Estimator
    }

    fn metadata(&self) -> MetadataModelResponse {
        let estimator = self.estimator.load_full();
        let features = estimator
            .as_ref()
            .and_then(|e| e.n_features())
            .map_or(-1, |n| n as i64);
        let predict_type = match estimator.as_deref() {
            Some(e) if e.is_classifier() => Datatype::Int64,
            _ => Datatype::Fp64,
        };

        let mut outputs = vec![TensorMetadata::new(PREDICT_OUTPUT, predict_type, vec![-1, 1])];
        if let Some(classes) = estimator.as_deref().and_then(Estimator::classes) {
            outputs.push(TensorMetadata::new(
                PREDICT_PROBA_OUTPUT,
                Datatype::Fp64,
                vec![-1, classes.len() as i64],
            ));
        }

        MetadataModelResponse {
            name: self.settings.name.clone(),
            versions: vec![self.settings.version.clone()],
            platform: "estimator".to_string(),
            inputs: vec![TensorMetadata::new("input-0", Datatype::Fp64, vec![-1, features])],
            outputs,
        }
    }

    async fn predict(&self, request: InferenceRequest) -> Result<InferenceResponse, PredictError> {
        let estimator = self.loaded()?;
        let (values, rows, cols) = feature_matrix(&request)?;
        let outputs: Vec<String> = match request.requested_outputs() {
            Some(names) if !names.is_empty() => names.into_iter().map(str::to_string).collect(),
            _ => vec![PREDICT_OUTPUT.to_string()],
        };
        debug!("Scoring {} rows x {} features on {}", rows, cols, self.settings.key());

        let outputs = tokio::task::spawn_blocking(move || {
            score(&estimator, &outputs, &values, rows, cols)
        })
        .await
        .map_err(|e| PredictError::PredictionFailed(format!("scoring task failed: {}", e)))??;

        Ok(InferenceResponse {
            model_name: self.settings.name.clone(),
            model_version: Some(self.settings.version.clone()),
            id: Some(
                request
                    .id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ),
            parameters: None,
            outputs,
        })
    }

    async fn unload(&self) {
        if self.estimator.swap(None).is_some() {
            info!("Unloaded estimator {}", self.settings.key());
        }
    }
}
