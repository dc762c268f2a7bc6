use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

use super::{inference_api::ModelPath, ApiError, AppState};
use crate::error::RegistryError;
use crate::settings::{ModelKey, ModelSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelState {
    Ready,
    Unavailable,
}

#[derive(Debug, Serialize)]
pub struct RepositoryIndexItem {
    pub name: String,
    pub version: String,
    pub state: ModelState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

async fn scan_repository(state: &AppState) -> Result<Vec<ModelSettings>, ApiError> {
    let repository = state.repository.clone();
    tokio::task::spawn_blocking(move || repository.list())
        .await
        .map_err(|e| ApiError::internal(format!("repository scan failed: {}", e)))?
        .map_err(ApiError::from)
}

/// POST /v2/repository/index
///
/// Every model on disk plus every loaded model, ordered by name then version.
pub async fn repository_index(State(state): State<AppState>) -> Result<Json<Vec<RepositoryIndexItem>>, ApiError> {
    let listing = state.registry.list();
    let mut index: BTreeMap<ModelKey, RepositoryIndexItem> = BTreeMap::new();

    for settings in scan_repository(&state).await? {
        index.insert(
            settings.key(),
            RepositoryIndexItem {
                name: settings.name,
                version: settings.version,
                state: ModelState::Unavailable,
                platform: None,
            },
        );
    }
    for (key, entry) in listing.iter() {
        let item = index.entry(key.clone()).or_insert_with(|| RepositoryIndexItem {
            name: key.name.clone(),
            version: key.version.clone(),
            state: ModelState::Ready,
            platform: None,
        });
        item.state = ModelState::Ready;
        item.platform = Some(entry.format.name().to_string());
    }

    Ok(Json(index.into_values().collect()))
}

/// POST /v2/repository/models/:name/load
///
/// Loads every version of `name` found in the repository.
pub async fn load_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let found: Vec<ModelSettings> = scan_repository(&state)
        .await?
        .into_iter()
        .filter(|settings| settings.name == name)
        .collect();
    if found.is_empty() {
        return Err(RegistryError::not_found(&name, None).into());
    }

    for (key, outcome) in state.registry.load_all(&found).await {
        outcome?;
        info!("Model {} is ready", key);
    }
    Ok(StatusCode::OK)
}

/// POST /v2/repository/models/:name[/versions/:version]/unload
///
/// Without a version, unloads every loaded version of `name`.
pub async fn unload_model(
    State(state): State<AppState>,
    Path(path): Path<ModelPath>,
) -> Result<StatusCode, ApiError> {
    match path.version {
        Some(version) => state.registry.unload(&path.name, &version).await?,
        None => {
            let versions: Vec<String> = state
                .registry
                .list()
                .keys()
                .filter(|key| key.name == path.name)
                .map(|key| key.version.clone())
                .collect();
            if versions.is_empty() {
                return Err(RegistryError::not_found(&path.name, None).into());
            }
            for version in versions {
                state.registry.unload(&path.name, &version).await?;
            }
        }
    }
    Ok(StatusCode::OK)
}
