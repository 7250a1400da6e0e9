//! Persisted user preferences, stored as JSON in `~/.vlcaptioner/config.json`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum_macros::{AsRefStr, Display, EnumString};

pub const CONFIG_DIR_NAME: &str = ".vlcaptioner";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const HF_TOKEN_ENV: &str = "HF_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory, set HOME or pass a config path")]
    NoHomeDir,
    #[error("failed to write config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(
    Serialize, Deserialize, EnumString, Display, AsRefStr, Clone, Copy, Debug, Default, PartialEq,
    Eq,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AppConfig {
    pub theme: Theme,
    pub hf_token: String,
    pub model_search_paths: Vec<PathBuf>,
}

impl<'de> Deserialize<'de> for AppConfig {
    /// Stored values are merged over the defaults; absent or malformed keys
    /// keep their default and unknown keys are ignored.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = match serde_json::Value::deserialize(deserializer) {
            Ok(value) => value,
            Err(_) => return Ok(AppConfig::default()),
        };
        let defaults = AppConfig::default();

        let config = AppConfig {
            theme: value["theme"]
                .as_str()
                .and_then(|theme| theme.parse().ok())
                .unwrap_or(defaults.theme),
            hf_token: value["hf_token"]
                .as_str()
                .map(str::to_string)
                .unwrap_or(defaults.hf_token),
            model_search_paths: value["model_search_paths"]
                .as_array()
                .map(|paths| {
                    paths
                        .iter()
                        .filter_map(|p| p.as_str())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or(defaults.model_search_paths),
        };
        Ok(config)
    }
}

impl AppConfig {
    /// Token for gated downloads: an explicit value first, then the stored
    /// token, then `HF_TOKEN` from the environment.
    pub fn resolve_hf_token(&self, explicit: Option<&str>) -> Option<String> {
        let env = std::env::var(HF_TOKEN_ENV).ok();
        resolve_token(explicit, &self.hf_token, env.as_deref())
    }

    /// Adds a search path unless it is already present. Returns whether it was added.
    pub fn add_model_search_path(&mut self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        if self.model_search_paths.contains(&path) {
            return false;
        }
        self.model_search_paths.push(path);
        true
    }
}

fn resolve_token(explicit: Option<&str>, stored: &str, env: Option<&str>) -> Option<String> {
    [explicit, Some(stored), env]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|token| !token.is_empty())
        .map(str::to_string)
}

/// `~/.vlcaptioner/config.json`, from `HOME` or `USERPROFILE`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(|home| {
            PathBuf::from(home)
                .join(CONFIG_DIR_NAME)
                .join(CONFIG_FILE_NAME)
        })
        .ok_or(ConfigError::NoHomeDir)
}

#[derive(Clone, Debug)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing file yields the defaults, a broken one is logged
    /// and yields the defaults.
    pub fn load(&self) -> AppConfig {
        match std::fs::File::open(&self.path) {
            Ok(file) => {
                let reader = std::io::BufReader::new(file);
                match serde_json::from_reader::<_, serde_json::Value>(reader) {
                    Ok(value) => match serde_json::from_value::<AppConfig>(value) {
                        Ok(config) => config,
                        Err(e) => {
                            tracing::error!("Failed to parse config.json: {}", e);
                            AppConfig::default()
                        }
                    },
                    Err(e) => {
                        tracing::error!("Failed to read config.json: {}", e);
                        AppConfig::default()
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(e) => {
                tracing::error!("Failed to open config.json, {}", e);
                AppConfig::default()
            }
        }
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, content).map_err(io_err)?;

        tracing::debug!("config saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let config = store.load();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.theme, Theme::Dark);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join(".vlcaptioner").join("config.json"));

        let mut config = AppConfig {
            theme: Theme::Light,
            hf_token: "hf_abc".into(),
            ..Default::default()
        };
        assert!(config.add_model_search_path("/models/extra"));
        assert!(!config.add_model_search_path("/models/extra"));
        store.save(&config).unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("\"theme\": \"light\""));
        assert_eq!(store.load(), config);
    }

    #[test]
    fn test_partial_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));

        std::fs::write(
            store.path(),
            r#"{"hf_token": "hf_x", "theme": "sepia", "window": {"w": 3}}"#,
        )
        .unwrap();
        let config = store.load();
        assert_eq!(config.hf_token, "hf_x");
        assert_eq!(config.theme, Theme::Dark);
        assert!(config.model_search_paths.is_empty());

        std::fs::write(store.path(), "{not json").unwrap();
        assert_eq!(store.load(), AppConfig::default());
    }

    #[test]
    fn test_token_precedence() {
        assert_eq!(
            resolve_token(Some("flag"), "stored", Some("env")).as_deref(),
            Some("flag")
        );
        assert_eq!(
            resolve_token(Some("  "), "stored", Some("env")).as_deref(),
            Some("stored")
        );
        assert_eq!(resolve_token(None, "", Some("env")).as_deref(), Some("env"));
        assert_eq!(resolve_token(None, "", None), None);
    }
}
