pub mod command;
pub mod echo;

use crate::config::schema::EngineConfig;
use crate::error::{ModeldError, Result};
use crate::models::schema::Schema;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

pub use command::CommandEngine;
pub use echo::EchoEngine;

/// A model materialized by an engine and ready to serve predictions.
///
/// Handles are read-only once published, so concurrent `predict` calls are allowed.
#[async_trait]
pub trait ModelHandle: Send + Sync + Debug {
    /// Run inference; the output is returned to the caller verbatim
    async fn predict(&self, input: &Value) -> Result<Value>;
}

/// Shared reference to a loaded model
pub type Handle = Arc<dyn ModelHandle>;

/// Everything a training run needs, already persisted on disk
#[derive(Debug, Clone, Copy)]
pub struct TrainJob<'a> {
    pub key: &'a str,
    pub dataset: &'a Path,
    pub io_params: &'a Path,
    pub schema: &'a Schema,
    /// Directory the engine must write the trained model into
    pub output: &'a Path,
}

/// Unified interface for training / inference engines
#[async_trait]
pub trait Engine: Send + Sync {
    /// Fit a model on the persisted dataset, writing it to `job.output`
    async fn train(&self, job: TrainJob<'_>) -> Result<()>;

    /// Materialize a ready-to-predict handle from a model directory
    async fn load(&self, model_dir: &Path, schema: &Schema) -> Result<Handle>;

    /// Get engine name for logging/debugging
    fn engine_name(&self) -> &str;
}

/// Create engine from config
pub fn from_config(config: &EngineConfig) -> Result<Arc<dyn Engine>> {
    match config.backend.as_str() {
        "echo" => Ok(Arc::new(EchoEngine::new())),
        "command" => Ok(Arc::new(CommandEngine::new(config)?)),
        _ => Err(ModeldError::Config(format!(
            "Unknown engine backend: {}. Must be 'echo' or 'command'",
            config.backend
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_echo() {
        let engine = from_config(&EngineConfig::default()).unwrap();
        assert_eq!(engine.engine_name(), "echo");
    }

    #[test]
    fn test_from_config_invalid() {
        let config = EngineConfig {
            backend: "invalid".to_string(),
            ..EngineConfig::default()
        };
        let result = from_config(&config);
        assert!(result.is_err());
        assert!(result
            .err()
            .map(|e| e.to_string().contains("Unknown engine backend"))
            .unwrap_or(false));
    }
}
