use crate::error::{ModeldError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub latency: LatencyConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
    #[serde(default = "default_true")]
    pub cors: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct StoreConfig {
    /// Store root; empty means `$XDG_DATA_HOME/modeld/models`
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct EngineConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Argument vector for training. Placeholders: `{dataset}`, `{config}`, `{output}`
    #[serde(default = "default_train_command")]
    pub train_command: Vec<String>,
    /// Argument vector for prediction. Placeholder: `{model}`; JSON input on stdin
    #[serde(default = "default_predict_command")]
    pub predict_command: Vec<String>,
    #[serde(default = "default_train_timeout_secs")]
    pub train_timeout_secs: u64,
    #[serde(default = "default_predict_timeout_secs")]
    pub predict_timeout_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct LatencyConfig {
    #[serde(default = "default_latency_capacity")]
    pub capacity: usize,
}

// Default value functions
fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}
const fn default_max_upload_mb() -> usize {
    2048
}
const fn default_true() -> bool {
    true
}
fn default_backend() -> String {
    "echo".to_string()
}
fn default_train_command() -> Vec<String> {
    [
        "ludwig",
        "train",
        "--dataset",
        "{dataset}",
        "--config",
        "{config}",
        "--output_directory",
        "{output}",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}
fn default_predict_command() -> Vec<String> {
    ["ludwig-predict-json", "--model_path", "{model}"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
const fn default_train_timeout_secs() -> u64 {
    24 * 60 * 60
}
const fn default_predict_timeout_secs() -> u64 {
    60
}
const fn default_latency_capacity() -> usize {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_mb: default_max_upload_mb(),
            cors: default_true(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            train_command: default_train_command(),
            predict_command: default_predict_command(),
            train_timeout_secs: default_train_timeout_secs(),
            predict_timeout_secs: default_predict_timeout_secs(),
        }
    }
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            capacity: default_latency_capacity(),
        }
    }
}

impl Config {
    /// Load config from the default location, falling back to defaults if absent
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ModeldError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ModeldError::Config(format!("Failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.latency.capacity == 0 {
            return Err(ModeldError::Config(
                "latency.capacity must be greater than 0".to_string(),
            ));
        }
        if self.server.max_upload_mb == 0 {
            return Err(ModeldError::Config(
                "server.max_upload_mb must be greater than 0".to_string(),
            ));
        }
        match self.engine.backend.as_str() {
            "echo" => {}
            "command" => {
                if self.engine.train_command.is_empty() || self.engine.predict_command.is_empty() {
                    return Err(ModeldError::Config(
                        "engine.train_command and engine.predict_command must not be empty"
                            .to_string(),
                    ));
                }
            }
            other => {
                return Err(ModeldError::Config(format!(
                    "Unknown engine backend: {other}. Must be 'echo' or 'command'"
                )))
            }
        }
        Ok(())
    }

    /// Resolved store root
    pub fn store_root(&self) -> Result<PathBuf> {
        match &self.store.root {
            Some(root) if !root.as_os_str().is_empty() => Ok(root.clone()),
            _ => models_data_dir(),
        }
    }
}

/// Get config file path
pub fn config_path() -> Result<PathBuf> {
    let config_dir = if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config)
    } else {
        dirs::config_dir()
            .ok_or_else(|| ModeldError::Config("Cannot determine config directory".to_string()))?
    };

    Ok(config_dir.join("modeld").join("config.toml"))
}

/// Get default models data directory
pub fn models_data_dir() -> Result<PathBuf> {
    let data_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg_data)
    } else {
        dirs::data_dir()
            .ok_or_else(|| ModeldError::Config("Cannot determine data directory".to_string()))?
    };

    Ok(data_dir.join("modeld/models"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.backend, "echo");
        assert_eq!(config.latency.capacity, 10_000);
    }

    #[test]
    fn test_partial_config_merges_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            bind = "0.0.0.0:8080"

            [latency]
            capacity = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.server.max_upload_mb, 2048);
        assert_eq!(config.latency.capacity, 16);
        assert_eq!(config.engine.predict_timeout_secs, 60);
    }

    #[test]
    fn test_shipped_sample_matches_defaults() {
        let config: Config = toml::from_str(include_str!("../../config/default.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind, Config::default().server.bind);
        assert_eq!(config.engine.train_command, Config::default().engine.train_command);
        assert!(config.store.root.is_none());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = Config::default();
        config.latency.capacity = 0;
        assert!(matches!(config.validate(), Err(ModeldError::Config(_))));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut config = Config::default();
        config.engine.backend = "gpu-farm".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Unknown engine backend"));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[store]\nroot = \"/srv/models\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.store_root().unwrap(), PathBuf::from("/srv/models"));
    }

    #[test]
    #[serial]
    fn test_store_root_follows_xdg_data_home() {
        let temp_dir = TempDir::new().unwrap();
        let original = std::env::var("XDG_DATA_HOME").ok();
        std::env::set_var("XDG_DATA_HOME", temp_dir.path());

        let root = Config::default().store_root().unwrap();
        assert_eq!(root, temp_dir.path().join("modeld/models"));

        match original {
            Some(val) => std::env::set_var("XDG_DATA_HOME", val),
            None => std::env::remove_var("XDG_DATA_HOME"),
        }
    }

    #[test]
    #[serial]
    fn test_load_without_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let original = std::env::var("XDG_CONFIG_HOME").ok();
        std::env::set_var("XDG_CONFIG_HOME", temp_dir.path());

        let config = Config::load().unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:3000");

        match original {
            Some(val) => std::env::set_var("XDG_CONFIG_HOME", val),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
    }
}
