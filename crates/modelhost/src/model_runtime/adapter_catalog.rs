//! Adapter Catalog
//!
//! The set of adapters the registry may select from, keyed by format. Each
//! adapter's capability probe runs exactly once, when it is added.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::estimator_runtime::EstimatorAdapter;
use super::llama_runtime::LlamaAdapter;
use super::runtime_trait::*;

struct CatalogEntry {
    adapter: Arc<dyn ModelAdapter>,
    available: bool,
}

#[derive(Default)]
pub struct AdapterCatalog {
    entries: HashMap<ModelFormat, CatalogEntry>,
}

impl AdapterCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every adapter this crate ships, probed against the current process.
    pub fn discover() -> Self {
        Self::new()
            .with_adapter(Arc::new(EstimatorAdapter::new()))
            .with_adapter(Arc::new(LlamaAdapter::discover()))
    }

    /// Adds (or replaces) the adapter for its format.
    pub fn with_adapter(mut self, adapter: Arc<dyn ModelAdapter>) -> Self {
        let format = adapter.format();
        let available = adapter.is_available();
        let metadata = adapter.metadata();
        if available {
            info!("Adapter available: {} ({})", format.name(), metadata.runtime_name);
        } else {
            warn!("Adapter unavailable: {} ({})", format.name(), metadata.runtime_name);
        }
        self.entries.insert(format, CatalogEntry { adapter, available });
        self
    }

    /// The adapter for `format`, only if its probe succeeded.
    pub fn lookup(&self, format: ModelFormat) -> Option<Arc<dyn ModelAdapter>> {
        self.entries
            .get(&format)
            .filter(|entry| entry.available)
            .map(|entry| entry.adapter.clone())
    }

    pub fn is_registered(&self, format: ModelFormat) -> bool {
        self.entries.contains_key(&format)
    }

    /// Available adapters in [`ModelFormat::PRIORITY`] order.
    pub fn available(&self) -> Vec<Arc<dyn ModelAdapter>> {
        ModelFormat::PRIORITY
            .into_iter()
            .filter_map(|format| self.lookup(format))
            .collect()
    }

    pub fn runtimes(&self) -> Vec<RuntimeMetadata> {
        ModelFormat::PRIORITY
            .into_iter()
            .filter_map(|format| self.entries.get(&format))
            .map(|entry| entry.adapter.metadata())
            .collect()
    }
}
