//! Model Runtime Abstraction
//!
//! Hosts heterogeneous model formats behind one trait-based contract.
//!
//! Architecture:
//! - Each artifact format has its own [`ModelAdapter`]
//! - Adapters probe their native capability once; unavailable ones are never selected
//! - The [`ModelRegistry`] owns loaded models, keyed by (name, version)
//! - Formats are declared in settings or detected from extension and magic bytes
pub mod adapter_catalog;
pub mod estimator;
pub mod estimator_runtime;
pub mod format_detector;
pub mod llama_runtime;
pub mod model_registry;
pub mod runtime_trait;

pub use adapter_catalog::AdapterCatalog;
pub use estimator::{Estimator, EstimatorArtifact};
pub use estimator_runtime::EstimatorAdapter;
pub use format_detector::FormatDetector;
pub use llama_runtime::LlamaAdapter;
pub use model_registry::{ModelListing, ModelRegistry, RegistryEntry};
pub use runtime_trait::{LoadedModel, ModelAdapter, ModelFormat, ResponseStream, RuntimeMetadata};
