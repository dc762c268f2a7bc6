//! Model Registry
//!
//! Loaded models keyed by (name, version). Reads go through a lock-free
//! `ArcSwap` snapshot; loads and unloads of one key are serialized by a
//! per-key async mutex, so concurrent resolves of the same key load once
//! while other keys proceed independently.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::adapter_catalog::AdapterCatalog;
use super::format_detector::FormatDetector;
use super::runtime_trait::*;
use crate::error::{LoadError, RegistryError};
use crate::metrics;
use crate::settings::{ModelKey, ModelSettings};

#[derive(Clone)]
pub struct RegistryEntry {
    pub model: Arc<dyn LoadedModel>,
    pub format: ModelFormat,
    load_seq: u64,
}

type ModelMap = BTreeMap<ModelKey, RegistryEntry>;

/// Point-in-time view of the loaded models, ordered by name then version.
/// Later loads and unloads do not affect it; iterate it as often as needed.
#[derive(Clone)]
pub struct ModelListing {
    snapshot: Arc<ModelMap>,
}

impl ModelListing {
    pub fn keys(&self) -> impl Iterator<Item = &ModelKey> + '_ {
        self.snapshot.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModelKey, &RegistryEntry)> + '_ {
        self.snapshot.iter()
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.snapshot.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }
}

pub struct ModelRegistry {
    catalog: AdapterCatalog,
    models: ArcSwap<ModelMap>,
    key_locks: DashMap<ModelKey, Arc<Mutex<()>>>,
    load_seq: AtomicU64,
}

impl ModelRegistry {
    pub fn new(catalog: AdapterCatalog) -> Self {
        Self {
            catalog,
            models: ArcSwap::from_pointee(ModelMap::new()),
            key_locks: DashMap::new(),
            load_seq: AtomicU64::new(0),
        }
    }

    pub fn catalog(&self) -> &AdapterCatalog {
        &self.catalog
    }

    fn key_lock(&self, key: &ModelKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the key's lock once nobody else holds or waits on it.
    fn release_key_lock(&self, key: &ModelKey, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Returns the loaded model for the settings' key, loading it first if
    /// needed. A failed load caches nothing; the next resolve tries again.
    pub async fn resolve(&self, settings: &ModelSettings) -> Result<Arc<dyn LoadedModel>, RegistryError> {
        let key = settings.key();
        if let Some(model) = self.models.load().get(&key).map(|entry| entry.model.clone()) {
            return Ok(model);
        }

        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            let cached = self.models.load().get(&key).map(|entry| entry.model.clone());
            match cached {
                Some(model) => Ok(model),
                None => self.load_and_insert(settings).await,
            }
        };
        self.release_key_lock(&key, lock);
        result
    }

    async fn load_and_insert(&self, settings: &ModelSettings) -> Result<Arc<dyn LoadedModel>, RegistryError> {
        let key = settings.key();
        info!("Loading model {}", key);

        let (format, model) = match self.load_model(settings).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("Failed to load model {}: {}", key, e);
                metrics::inc_model_load("failure");
                return Err(e.into());
            }
        };

        let entry = RegistryEntry {
            model: model.clone(),
            format,
            load_seq: self.load_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.models.rcu(|current| {
            let mut next = ModelMap::clone(current);
            next.insert(key.clone(), entry.clone());
            next
        });
        metrics::inc_model_load("success");
        metrics::set_models_loaded(self.models.load().len());

        info!("Model {} loaded with the {} adapter", key, format.name());
        Ok(model)
    }

    /// Declared format, then detected format, then the first available
    /// adapter (in priority order) that does not report itself unavailable.
    async fn load_model(&self, settings: &ModelSettings) -> Result<(ModelFormat, Arc<dyn LoadedModel>), LoadError> {
        let format = match settings.parameters.format {
            Some(format) => Some(format),
            None => {
                let path = settings.parameters.artifact_path()?;
                tokio::task::spawn_blocking(move || FormatDetector::detect(&path))
                    .await
                    .ok()
                    .flatten()
            }
        };

        if let Some(format) = format {
            let adapter = self.catalog.lookup(format).ok_or_else(|| {
                LoadError::unavailable(format, "adapter is not available in this process")
            })?;
            return Ok((format, adapter.load(settings).await?));
        }

        let mut last_error = None;
        for adapter in self.catalog.available() {
            debug!("Probing {} adapter for {}", adapter.format().name(), settings.key());
            match adapter.load(settings).await {
                Ok(model) => return Ok((adapter.format(), model)),
                Err(e @ LoadError::AdapterUnavailable { .. }) => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| LoadError::unavailable("any format", "no adapter is available")))
    }

    /// Snapshot lookup. With no version, the most recently loaded version of
    /// `name`.
    pub fn get(&self, name: &str, version: Option<&str>) -> Result<Arc<dyn LoadedModel>, RegistryError> {
        let models = self.models.load();
        let entry = match version {
            Some(version) => models.get(&ModelKey::new(name, version)),
            None => models
                .iter()
                .filter(|(key, _)| key.name == name)
                .max_by_key(|(_, entry)| entry.load_seq)
                .map(|(_, entry)| entry),
        };
        entry
            .map(|entry| entry.model.clone())
            .ok_or_else(|| RegistryError::not_found(name, version))
    }

    /// Removes the model and releases its artifact.
    pub async fn unload(&self, name: &str, version: &str) -> Result<(), RegistryError> {
        let key = ModelKey::new(name, version);
        let lock = self.key_lock(&key);
        let removed = {
            let _guard = lock.lock().await;
            let removed = self.models.load().get(&key).cloned();
            if removed.is_some() {
                self.models.rcu(|current| {
                    let mut next = ModelMap::clone(current);
                    next.remove(&key);
                    next
                });
            }
            if let Some(entry) = &removed {
                entry.model.unload().await;
            }
            removed
        };
        self.release_key_lock(&key, lock);

        match removed {
            Some(_) => {
                metrics::set_models_loaded(self.models.load().len());
                info!("Model {} unloaded", key);
                Ok(())
            }
            None => Err(RegistryError::not_found(name, Some(version))),
        }
    }

    pub fn list(&self) -> ModelListing {
        ModelListing {
            snapshot: self.models.load_full(),
        }
    }

    /// Unloads every model in the current snapshot.
    pub async fn unload_all(&self) {
        let listing = self.list();
        for key in listing.keys() {
            match self.unload(&key.name, &key.version).await {
                Ok(()) | Err(RegistryError::NotFound { .. }) => {}
                Err(e) => error!("Failed to unload {}: {}", key, e),
            }
        }
    }

    /// Resolves every model concurrently. One failure does not stop the rest.
    pub async fn load_all(&self, settings: &[ModelSettings]) -> Vec<(ModelKey, Result<(), RegistryError>)> {
        let loads = settings.iter().map(|settings| async move {
            (settings.key(), self.resolve(settings).await.map(|_| ()))
        });
        futures::future::join_all(loads).await
    }
}
