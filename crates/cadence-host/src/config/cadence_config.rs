use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::config::host_config::HostConfig;

#[derive(Debug)]
pub enum ConfigLoadError {
    NotFound,
    NoConfigDir,
    ParseError(String),
    IoError(String),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::NotFound => write!(f, "Config file not found"),
            ConfigLoadError::NoConfigDir => write!(f, "Could not determine config directory"),
            ConfigLoadError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigLoadError::IoError(msg) => write!(f, "IO error reading config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigLoadError {}

/// Project directories for cadence (config, data, cache)
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "cadence")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptsConfig {
    /// Base for relative autoload entries (default: <data dir>/scripts)
    #[serde(default)]
    pub script_dir: Option<PathBuf>,

    /// Scripts started automatically, as URLs or paths
    #[serde(default)]
    pub autoload: Vec<String>,
}

impl ScriptsConfig {
    /// Get the script directory path (use provided or default)
    pub fn script_dir(&self) -> PathBuf {
        self.script_dir.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|p| p.data_dir().join("scripts"))
                .unwrap_or_else(|| PathBuf::from(".scripts"))
        })
    }

    /// Autoload entries with relative paths placed under the script directory
    pub fn autoload_paths(&self) -> Vec<String> {
        let script_dir = self.script_dir();
        self.autoload
            .iter()
            .map(|entry| {
                let has_scheme = Url::parse(entry).is_ok_and(|url| url.scheme().len() > 1);
                if has_scheme || Path::new(entry).is_absolute() {
                    entry.clone()
                } else {
                    script_dir.join(entry).display().to_string()
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Run loop and streaming settings shared by every host
    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub scripts: ScriptsConfig,
}

impl CadenceConfig {
    pub fn config_path() -> Result<PathBuf, ConfigLoadError> {
        let dirs = project_dirs().ok_or(ConfigLoadError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound);
        }

        let content =
            fs::read_to_string(path).map_err(|e| ConfigLoadError::IoError(e.to_string()))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigLoadError> {
        toml::from_str(content).map_err(|e| ConfigLoadError::ParseError(e.to_string()))
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(&self)?;
        fs::write(path, content)?;
        info!("Saved config to {}", path.display());
        Ok(())
    }

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.save_to(&Self::config_path()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = CadenceConfig::from_toml_str("").unwrap();
        assert_eq!(config, CadenceConfig::default());
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = CadenceConfig::from_toml_str("host = 3").unwrap_err();
        assert!(matches!(err, ConfigLoadError::ParseError(_)));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = CadenceConfig::default();
        config.host.tick_interval_us = 50_000;
        config.scripts.autoload = vec!["scripts/walk.js".to_string()];

        config.save_to(&path).unwrap();
        let loaded = CadenceConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[cfg(unix)]
    #[test]
    fn test_relative_autoload_entries_live_in_script_dir() {
        let scripts = ScriptsConfig {
            script_dir: Some(PathBuf::from("/srv/scripts")),
            autoload: vec![
                "walk.js".to_string(),
                "/opt/other.js".to_string(),
                "https://cdn.example/remote.js".to_string(),
            ],
        };
        assert_eq!(
            scripts.autoload_paths(),
            vec![
                "/srv/scripts/walk.js".to_string(),
                "/opt/other.js".to_string(),
                "https://cdn.example/remote.js".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = CadenceConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::NotFound));
    }
}
