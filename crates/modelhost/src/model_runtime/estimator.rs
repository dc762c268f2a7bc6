//! Generic estimator artifacts.
//!
//! Binary artifacts are the 4-byte magic `MHE1` followed by a bincode
//! (fixed-int) encoding of [`EstimatorArtifact`]; `.json` artifacts hold the
//! same structure as JSON without the magic.

use bincode::Options;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{LoadError, PredictError};

pub const ARTIFACT_MAGIC: [u8; 4] = *b"MHE1";
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Rows handed to each rayon task.
const ROWS_PER_TASK: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimator {
    /// Ignores features; predicts the most frequent class and the class prior.
    DummyClassifier {
        classes: Vec<i64>,
        class_prior: Vec<f64>,
        n_features: Option<usize>,
    },
    LinearRegression { coef: Vec<f64>, intercept: f64 },
    /// Binary models carry one coefficient row (sigmoid); multiclass models
    /// one row per class (softmax).
    LogisticRegression {
        classes: Vec<i64>,
        coef: Vec<Vec<f64>>,
        intercept: Vec<f64>,
    },
}

impl Estimator {
    pub fn kind(&self) -> &'static str {
        match self {
            Estimator::DummyClassifier { .. } => "dummy_classifier",
            Estimator::LinearRegression { .. } => "linear_regression",
            Estimator::LogisticRegression { .. } => "logistic_regression",
        }
    }

    /// Feature count the estimator expects, if it constrains it.
    pub fn n_features(&self) -> Option<usize> {
        match self {
            Estimator::DummyClassifier { n_features, .. } => *n_features,
            Estimator::LinearRegression { coef, .. } => Some(coef.len()),
            Estimator::LogisticRegression { coef, .. } => coef.first().map(Vec::len),
        }
    }

    pub fn classes(&self) -> Option<&[i64]> {
        match self {
            Estimator::DummyClassifier { classes, .. }
            | Estimator::LogisticRegression { classes, .. } => Some(classes),
            Estimator::LinearRegression { .. } => None,
        }
    }

    pub fn is_classifier(&self) -> bool {
        self.classes().is_some()
    }

    /// Structural consistency checks run once at load time.
    pub fn check(&self) -> Result<(), String> {
        match self {
            Estimator::DummyClassifier { classes, class_prior, .. } => {
                if classes.is_empty() {
                    return Err("dummy classifier has no classes".into());
                }
                if classes.len() != class_prior.len() {
                    return Err(format!(
                        "{} classes but {} prior values",
                        classes.len(),
                        class_prior.len()
                    ));
                }
                if class_prior.iter().any(|p| !p.is_finite() || *p < 0.0) {
                    return Err("class prior must be finite and non-negative".into());
                }
            }
            Estimator::LinearRegression { coef, intercept } => {
                if coef.is_empty() {
                    return Err("linear regression has no coefficients".into());
                }
                if !intercept.is_finite() || coef.iter().any(|c| !c.is_finite()) {
                    return Err("coefficients must be finite".into());
                }
            }
            Estimator::LogisticRegression { classes, coef, intercept } => {
                if classes.len() < 2 {
                    return Err("logistic regression needs at least two classes".into());
                }
                let expected_rows = if classes.len() == 2 { 1 } else { classes.len() };
                if coef.len() != expected_rows || intercept.len() != expected_rows {
                    return Err(format!(
                        "expected {} coefficient rows and intercepts for {} classes, got {} and {}",
                        expected_rows,
                        classes.len(),
                        coef.len(),
                        intercept.len()
                    ));
                }
                let width = coef[0].len();
                if width == 0 || coef.iter().any(|row| row.len() != width) {
                    return Err("coefficient rows must be non-empty and equally wide".into());
                }
                if coef.iter().flatten().chain(intercept).any(|c| !c.is_finite()) {
                    return Err("coefficients must be finite".into());
                }
            }
        }
        Ok(())
    }

    /// Point predictions, one value per row. Classifiers return labels.
    pub fn predict(&self, x: &[f64], n_cols: usize) -> Result<Prediction, PredictError> {
        let rows = self.rows(x, n_cols)?;
        match self {
            Estimator::LinearRegression { coef, intercept } => {
                let values: Vec<f64> = par_map_rows(&rows, |row| dot(coef, row) + intercept);
                ensure_finite(&values)?;
                Ok(Prediction::Values(values))
            }
            _ => {
                let proba = self.predict_proba(x, n_cols)?;
                let classes = self.classes().unwrap_or_default();
                let labels = proba
                    .chunks(classes.len())
                    .map(|p| classes[argmax(p)])
                    .collect();
                Ok(Prediction::Labels(labels))
            }
        }
    }

    /// Class probabilities, row-major `[rows, n_classes]`.
    pub fn predict_proba(&self, x: &[f64], n_cols: usize) -> Result<Vec<f64>, PredictError> {
        let rows = self.rows(x, n_cols)?;
        let proba: Vec<f64> = match self {
            Estimator::DummyClassifier { class_prior, .. } => {
                let total: f64 = class_prior.iter().sum();
                let normalized: Vec<f64> = if total > 0.0 {
                    class_prior.iter().map(|p| p / total).collect()
                } else {
                    vec![1.0 / class_prior.len() as f64; class_prior.len()]
                };
                rows.iter().flat_map(|_| normalized.iter().copied()).collect()
            }
            Estimator::LogisticRegression { classes, coef, intercept } => {
                let binary = classes.len() == 2;
                par_map_rows(&rows, |row| {
                    if binary {
                        let p = sigmoid(dot(&coef[0], row) + intercept[0]);
                        vec![1.0 - p, p]
                    } else {
                        let scores: Vec<f64> = coef
                            .iter()
                            .zip(intercept)
                            .map(|(c, b)| dot(c, row) + b)
                            .collect();
                        softmax(&scores)
                    }
                })
                .into_iter()
                .flatten()
                .collect()
            }
            Estimator::LinearRegression { .. } => {
                return Err(PredictError::UnknownOutput(
                    "predict_proba is only available for classifiers".into(),
                ))
            }
        };
        ensure_finite(&proba)?;
        Ok(proba)
    }

    fn rows<'a>(&self, x: &'a [f64], n_cols: usize) -> Result<Vec<&'a [f64]>, PredictError> {
        if n_cols == 0 {
            return Err(PredictError::ShapeMismatch("input has zero features".into()));
        }
        if let Some(expected) = self.n_features() {
            if expected != n_cols {
                return Err(PredictError::ShapeMismatch(format!(
                    "{} expects {} features, got {}",
                    self.kind(),
                    expected,
                    n_cols
                )));
            }
        }
        if x.len() % n_cols != 0 {
            return Err(PredictError::ShapeMismatch(format!(
                "{} values do not split into rows of {}",
                x.len(),
                n_cols
            )));
        }
        Ok(x.chunks(n_cols).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Labels(Vec<i64>),
    Values(Vec<f64>),
}

impl Prediction {
    pub fn len(&self) -> usize {
        match self {
            Prediction::Labels(v) => v.len(),
            Prediction::Values(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn par_map_rows<T, F>(rows: &[&[f64]], f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&[f64]) -> T + Sync + Send,
{
    rows.par_iter()
        .with_min_len(ROWS_PER_TASK)
        .map(|row| f(*row))
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// First index of the maximum; ties go to the lower class like numpy's argmax.
fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, best_v), (i, v)| {
            if *v > best_v {
                (i, *v)
            } else {
                (best, best_v)
            }
        })
        .0
}

fn ensure_finite(values: &[f64]) -> Result<(), PredictError> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(PredictError::PredictionFailed(
            "computation produced non-finite values".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorArtifact {
    pub format_version: u32,
    pub estimator: Estimator,
}

impl EstimatorArtifact {
    pub fn new(estimator: Estimator) -> Self {
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            estimator,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        let mut bytes = ARTIFACT_MAGIC.to_vec();
        bytes.extend(bincode::DefaultOptions::new().with_fixint_encoding().serialize(self)?);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.is_empty() {
            return Err("artifact is empty".into());
        }
        let body = bytes
            .strip_prefix(&ARTIFACT_MAGIC)
            .ok_or_else(|| "missing estimator artifact magic".to_string())?;
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(body.len() as u64)
            .deserialize(body)
            .map_err(|e| format!("bincode decode failed: {}", e))
    }

    /// Writes the artifact; `.json` paths get the JSON encoding.
    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = if is_json(path) {
            serde_json::to_vec_pretty(self)?
        } else {
            self.to_bytes()?
        };
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Reads and checks an artifact. Blocking; call from a blocking context.
    pub fn read_from(path: &Path) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoadError::ArtifactNotFound(path.to_path_buf()),
            _ => LoadError::corrupt(path, e),
        })?;

        let artifact = if is_json(path) {
            if bytes.is_empty() {
                return Err(LoadError::corrupt(path, "artifact is empty"));
            }
            serde_json::from_slice::<Self>(&bytes).map_err(|e| LoadError::corrupt(path, e))?
        } else {
            Self::from_bytes(&bytes).map_err(|e| LoadError::corrupt(path, e))?
        };

        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(LoadError::corrupt(
                path,
                format!("unsupported artifact format version {}", artifact.format_version),
            ));
        }
        artifact
            .estimator
            .check()
            .map_err(|e| LoadError::corrupt(path, e))?;
        Ok(artifact)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logistic_binary() -> Estimator {
        Estimator::LogisticRegression {
            classes: vec![0, 1],
            coef: vec![vec![2.0, -1.0]],
            intercept: vec![0.0],
        }
    }

    #[test]
    fn test_linear_regression_predict() {
        let model = Estimator::LinearRegression {
            coef: vec![1.0, 2.0],
            intercept: 0.5,
        };
        let out = model.predict(&[1.0, 1.0, 0.0, 2.0], 2).unwrap();
        assert_eq!(out, Prediction::Values(vec![3.5, 4.5]));
    }

    #[test]
    fn test_dummy_classifier_most_frequent() {
        let model = Estimator::DummyClassifier {
            classes: vec![3, 7],
            class_prior: vec![0.25, 0.75],
            n_features: Some(1),
        };
        assert_eq!(model.predict(&[0.1, 0.9], 1).unwrap(), Prediction::Labels(vec![7, 7]));
        assert_eq!(model.predict_proba(&[0.1], 1).unwrap(), vec![0.25, 0.75]);
    }

    #[test]
    fn test_logistic_binary_and_multiclass() {
        let binary = logistic_binary();
        let proba = binary.predict_proba(&[1.0, 0.0], 2).unwrap();
        assert!((proba[0] + proba[1] - 1.0).abs() < 1e-12);
        assert!(proba[1] > 0.5);
        assert_eq!(binary.predict(&[1.0, 0.0, -1.0, 0.0], 2).unwrap(), Prediction::Labels(vec![1, 0]));

        let multi = Estimator::LogisticRegression {
            classes: vec![10, 20, 30],
            coef: vec![vec![1.0], vec![0.0], vec![-1.0]],
            intercept: vec![0.0, 0.0, 0.0],
        };
        assert_eq!(multi.predict(&[5.0, -5.0], 1).unwrap(), Prediction::Labels(vec![10, 30]));
    }

    #[test]
    fn test_feature_count_mismatch() {
        let err = logistic_binary().predict(&[1.0, 2.0, 3.0], 3).unwrap_err();
        assert!(matches!(err, PredictError::ShapeMismatch(_)));
    }

    #[test]
    fn test_predict_proba_on_regressor_is_unknown_output() {
        let model = Estimator::LinearRegression {
            coef: vec![1.0],
            intercept: 0.0,
        };
        assert!(matches!(
            model.predict_proba(&[1.0], 1),
            Err(PredictError::UnknownOutput(_))
        ));
    }

    #[test]
    fn test_overflow_is_prediction_failure() {
        let model = Estimator::LinearRegression {
            coef: vec![f64::MAX],
            intercept: 0.0,
        };
        assert!(matches!(
            model.predict(&[10.0], 1),
            Err(PredictError::PredictionFailed(_))
        ));
    }

    #[test]
    fn test_check_rejects_inconsistent_models() {
        let bad = Estimator::LogisticRegression {
            classes: vec![0, 1, 2],
            coef: vec![vec![1.0]],
            intercept: vec![0.0],
        };
        assert!(bad.check().is_err());
        assert!(logistic_binary().check().is_ok());
    }

    #[test]
    fn test_artifact_files() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = EstimatorArtifact::new(logistic_binary());

        let bin = dir.path().join("model.bin");
        artifact.write_to(&bin).unwrap();
        assert_eq!(EstimatorArtifact::read_from(&bin).unwrap(), artifact);

        let json = dir.path().join("model.json");
        artifact.write_to(&json).unwrap();
        assert_eq!(EstimatorArtifact::read_from(&json).unwrap(), artifact);
    }

    #[test]
    fn test_bad_artifacts_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();

        let empty = dir.path().join("empty.bin");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            EstimatorArtifact::read_from(&empty),
            Err(LoadError::ArtifactCorrupt { .. })
        ));

        let truncated = dir.path().join("truncated.bin");
        let bytes = EstimatorArtifact::new(logistic_binary()).to_bytes().unwrap();
        std::fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(
            EstimatorArtifact::read_from(&truncated),
            Err(LoadError::ArtifactCorrupt { .. })
        ));

        let garbage = dir.path().join("garbage.bin");
        std::fs::write(&garbage, b"MHE1\xff\xff\xff\xff\xff\xff\xff\xff").unwrap();
        assert!(matches!(
            EstimatorArtifact::read_from(&garbage),
            Err(LoadError::ArtifactCorrupt { .. })
        ));

        assert!(matches!(
            EstimatorArtifact::read_from(&dir.path().join("missing.bin")),
            Err(LoadError::ArtifactNotFound(_))
        ));
    }
}
