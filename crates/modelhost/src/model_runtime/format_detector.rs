//!
//! Detects a model format from the file extension, falling back to the
//! artifact's leading magic bytes.
use super::estimator::ARTIFACT_MAGIC;
use super::runtime_trait::ModelFormat;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

const GGUF_MAGIC: [u8; 4] = *b"GGUF";

pub struct FormatDetector;

impl FormatDetector {
    /// Extension first, then magic bytes.
    pub fn detect(path: &Path) -> Option<ModelFormat> {
        Self::detect_from_path(path).or_else(|| Self::detect_from_magic(path))
    }

    pub fn detect_from_path(path: &Path) -> Option<ModelFormat> {
        let extension = path.extension()?.to_str()?.to_lowercase();

        let format = ModelFormat::PRIORITY
            .into_iter()
            .find(|format| format.extensions().contains(&extension.as_str()));
        if let Some(fmt) = format {
            info!("Detected model format: {} for file: {}", fmt.name(), path.display());
        }
        format
    }

    /// Reads the first four bytes. Missing or short files detect nothing.
    pub fn detect_from_magic(path: &Path) -> Option<ModelFormat> {
        let mut magic = [0u8; 4];
        let mut file = File::open(path).ok()?;
        if let Err(e) = file.read_exact(&mut magic) {
            debug!("No magic bytes in {}: {}", path.display(), e);
            return None;
        }

        let format = match magic {
            GGUF_MAGIC => Some(ModelFormat::Gguf),
            ARTIFACT_MAGIC => Some(ModelFormat::Estimator),
            _ => None,
        };
        if let Some(fmt) = format {
            info!("Detected model format: {} from magic bytes of {}", fmt.name(), path.display());
        }
        format
    }

    pub fn supported_extensions() -> Vec<String> {
        ModelFormat::PRIORITY
            .iter()
            .flat_map(|format| format.extensions().iter().map(|ext| ext.to_string()))
            .collect()
    }

    pub fn has_gguf_magic(bytes: &[u8]) -> bool {
        bytes.starts_with(&GGUF_MAGIC)
    }
}
