use std::time::Duration;
use thiserror::Error;

/// Main error type for modeld
#[derive(Error, Debug)]
pub enum ModeldError {
    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Invalid model key '{0}': keys must be 1-128 characters of [A-Za-z0-9._-] and must not start with '.'")]
    InvalidKey(String),

    #[error("Unknown model key '{0}'")]
    UnknownKey(String),

    #[error("Operation in progress: model '{key}' is currently {status}")]
    OperationInProgress { key: String, status: String },

    #[error("Model '{key}' is not ready (status: {status})")]
    ModelNotReady { key: String, status: String },

    #[error("Schema validation failed: missing required fields: {}", missing.join(", "))]
    SchemaValidationFailed { missing: Vec<String> },

    #[error("Artifact corrupt: {0}\n\nTroubleshooting:\n- Inspect the version directory under the store root\n- Re-load or re-train the model to publish a fresh version")]
    ArtifactCorrupt(String),

    #[error("Version conflict: model '{key}' already has version {version}")]
    VersionConflict { key: String, version: String },

    #[error("No versions stored for model '{0}'")]
    NoVersions(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/modeld/config.toml\n- See example: config/default.toml\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("HTTP error: {0}\n\nTroubleshooting:\n- Is the daemon running? Start with: modeld serve\n- Check the server address with --server")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors raised by the training / inference engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Training failed: {0}")]
    TrainFailed(String),

    #[error("Model loading failed: {0}")]
    LoadFailed(String),

    #[error("Prediction failed: {0}")]
    PredictFailed(String),

    #[error("Engine call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Engine call cancelled")]
    Cancelled,

    #[error("Engine command not found: {0}\n\nTroubleshooting:\n- Install the engine and make sure it is in PATH\n- Or set engine.backend = \"echo\" in config for a development backend")]
    CommandNotFound(String),
}

impl ModeldError {
    /// Errors caused by the caller rather than by the system.
    ///
    /// These are reported back to the client but never logged as incidents.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::MissingInput(_)
                | Self::InvalidKey(_)
                | Self::UnknownKey(_)
                | Self::OperationInProgress { .. }
                | Self::ModelNotReady { .. }
                | Self::SchemaValidationFailed { .. }
                | Self::VersionConflict { .. }
                | Self::NoVersions(_)
                | Self::Archive(_)
        )
    }

    /// Stable short name of the error kind, used in transport responses
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingInput(_) => "missing_input",
            Self::InvalidKey(_) => "invalid_key",
            Self::UnknownKey(_) => "unknown_key",
            Self::OperationInProgress { .. } => "operation_in_progress",
            Self::ModelNotReady { .. } => "model_not_ready",
            Self::SchemaValidationFailed { .. } => "schema_validation_failed",
            Self::ArtifactCorrupt(_) => "artifact_corrupt",
            Self::VersionConflict { .. } => "version_conflict",
            Self::NoVersions(_) => "no_versions",
            Self::Engine(_) => "engine_failure",
            Self::Archive(_) => "archive",
            Self::Config(_) => "config",
            Self::Http(_) => "http",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

impl From<serde_json::Error> for ModeldError {
    fn from(e: serde_json::Error) -> Self {
        Self::Other(format!("JSON error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, ModeldError>;
