//! Inference serving core.
//!
//! Model artifacts of different formats are loaded through format-specific
//! adapters behind one [`LoadedModel`] contract, kept in a [`ModelRegistry`]
//! keyed by name and version, and their responses are framed as server-sent
//! events by [`streaming`].

pub mod config;
pub mod error;
pub mod metrics;
pub mod model_runtime;
pub mod repository;
pub mod settings;
pub mod streaming;
pub mod telemetry;
pub mod types;

#[cfg(feature = "cli")]
pub mod api;
#[cfg(feature = "cli")]
pub mod server;

pub use config::Config;
pub use error::{EncodingError, LoadError, PredictError, RegistryError, ServingError};
pub use model_runtime::{
    AdapterCatalog, LoadedModel, ModelAdapter, ModelFormat, ModelListing, ModelRegistry,
};
pub use repository::ModelRepository;
pub use settings::{ModelKey, ModelParameters, ModelSettings};
pub use streaming::{decode_frame, encode, encode_stream, ServerSentEvent};
pub use types::{
    Datatype, InferenceRequest, InferenceResponse, MetadataModelResponse, NamedTensor,
    RequestInput, RequestOutput, ResponseOutput, TensorData,
};

#[cfg(feature = "cli")]
pub use server::run_server;
