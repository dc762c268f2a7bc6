//! Model repository on the local filesystem.
//!
//! Every directory below the root that contains a `model-settings.json` is
//! one model. The file looks like
//!
//! ```json
//! {
//!   "name": "clf",
//!   "version": "v1",
//!   "parameters": { "uri": "./model.bin", "format": "estimator" }
//! }
//! ```
//!
//! `name` defaults to the directory name, `version` may also be given as
//! `parameters.version`, and a relative `uri` is resolved against the
//! directory holding the settings file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use validator::Validate;

use crate::settings::{ModelParameters, ModelSettings};

pub const SETTINGS_FILENAME: &str = "model-settings.json";

#[derive(Debug, Deserialize)]
struct SettingsFile {
    name: Option<String>,
    version: Option<String>,
    parameters: ModelParameters,
}

#[derive(Debug, Clone)]
pub struct ModelRepository {
    root: PathBuf,
}

impl ModelRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every valid model below the root, ordered by name then version.
    /// Unreadable or invalid settings files are logged and skipped.
    pub fn list(&self) -> Result<Vec<ModelSettings>> {
        let mut files = Vec::new();
        collect_settings_files(&self.root, &mut files)
            .with_context(|| format!("failed to scan model repository {}", self.root.display()))?;

        let mut models: Vec<ModelSettings> = files
            .iter()
            .filter_map(|path| match load_settings(path) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    warn!("Skipping {}: {:#}", path.display(), e);
                    None
                }
            })
            .collect();
        models.sort_by_key(ModelSettings::key);
        debug!("Found {} models in {}", models.len(), self.root.display());
        Ok(models)
    }

    /// All versions of `name` found in the repository.
    pub fn find(&self, name: &str) -> Result<Vec<ModelSettings>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|settings| settings.name == name)
            .collect())
    }
}

fn collect_settings_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // Symlinked directories are not followed; a link cycle would never end.
        if entry.file_type()?.is_dir() {
            collect_settings_files(&path, out)?;
        } else if path.file_name().is_some_and(|name| name == SETTINGS_FILENAME) {
            out.push(path);
        }
    }
    Ok(())
}

/// Parses and validates one settings file.
pub fn load_settings(path: &Path) -> Result<ModelSettings> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let file: SettingsFile =
        serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = match file.name {
        Some(name) => name,
        None => dir
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .context("model has no name and its directory name is not UTF-8")?,
    };
    let version = file
        .version
        .or_else(|| file.parameters.version.clone())
        .context("model has no version (set `version` or `parameters.version`)")?;

    let mut parameters = file.parameters;
    parameters.uri = resolve_uri(dir, &parameters.uri);

    let settings = ModelSettings::new(name, version, parameters);
    settings
        .validate()
        .with_context(|| format!("invalid settings in {}", path.display()))?;
    Ok(settings)
}

fn resolve_uri(dir: &Path, uri: &str) -> String {
    if uri.is_empty() || uri.contains("://") || Path::new(uri).is_absolute() {
        return uri.to_string();
    }
    dir.join(uri).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runtime::ModelFormat;

    fn write_settings(root: &Path, dir: &str, json: &str) -> PathBuf {
        let dir = root.join(dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(SETTINGS_FILENAME);
        fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn test_load_settings_resolves_relative_uri() {
        let root = tempfile::tempdir().unwrap();
        let path = write_settings(
            root.path(),
            "clf",
            r#"{"name": "clf", "version": "v1", "parameters": {"uri": "./model.bin", "format": "estimator"}}"#,
        );

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.name, "clf");
        assert_eq!(settings.version, "v1");
        assert_eq!(settings.parameters.format, Some(ModelFormat::Estimator));
        assert_eq!(
            settings.parameters.artifact_path().unwrap(),
            root.path().join("clf").join("./model.bin")
        );
    }

    #[test]
    fn test_name_from_directory_and_version_from_parameters() {
        let root = tempfile::tempdir().unwrap();
        let path = write_settings(
            root.path(),
            "sklearn-model",
            r#"{"parameters": {"uri": "/models/model.json", "version": "v1.2.3"}}"#,
        );

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.name, "sklearn-model");
        assert_eq!(settings.version, "v1.2.3");
        assert_eq!(settings.parameters.uri, "/models/model.json");
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let root = tempfile::tempdir().unwrap();

        let unversioned = write_settings(root.path(), "a", r#"{"name": "a", "parameters": {"uri": "m.bin"}}"#);
        assert!(load_settings(&unversioned).is_err());

        let empty_uri = write_settings(root.path(), "b", r#"{"name": "b", "version": "1", "parameters": {"uri": ""}}"#);
        assert!(load_settings(&empty_uri).is_err());

        let empty_version =
            write_settings(root.path(), "c", r#"{"name": "c", "version": "", "parameters": {"uri": "m.bin"}}"#);
        assert!(load_settings(&empty_version).is_err());

        let garbage = write_settings(root.path(), "d", "{not json");
        assert!(load_settings(&garbage).is_err());
    }

    #[test]
    fn test_list_scans_nested_dirs_and_skips_invalid() {
        let root = tempfile::tempdir().unwrap();
        write_settings(root.path(), "b", r#"{"version": "1", "parameters": {"uri": "m.bin"}}"#);
        write_settings(root.path(), "group/a", r#"{"version": "2", "parameters": {"uri": "m.bin"}}"#);
        write_settings(root.path(), "group/a-old", r#"{"name": "a", "version": "1", "parameters": {"uri": "m.bin"}}"#);
        write_settings(root.path(), "broken", r#"{"parameters": {}}"#);
        fs::write(root.path().join("README.md"), "not a model").unwrap();

        let repository = ModelRepository::new(root.path());
        let keys: Vec<String> = repository
            .list()
            .unwrap()
            .iter()
            .map(|s| s.key().to_string())
            .collect();
        assert_eq!(keys, vec!["a:1", "a:2", "b:1"]);

        assert_eq!(repository.find("a").unwrap().len(), 2);
        assert!(repository.find("zzz").unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let repository = ModelRepository::new("/nonexistent/modelhost-repository");
        assert!(repository.list().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_list_ignores_directory_symlink_loops() {
        let root = tempfile::tempdir().unwrap();
        write_settings(root.path(), "clf", r#"{"version": "1", "parameters": {"uri": "m.bin"}}"#);
        std::os::unix::fs::symlink(root.path(), root.path().join("clf").join("loop")).unwrap();

        let settings = ModelRepository::new(root.path()).list().unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0].name, "clf");
    }
}
