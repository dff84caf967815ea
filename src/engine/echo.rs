use crate::engine::{Engine, Handle, ModelHandle, TrainJob};
use crate::error::{EngineError, Result};
use crate::models::schema::Schema;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MODEL_FILE: &str = "echo_model.json";

/// Development engine: "trains" by summarizing the dataset and predicts by
/// echoing the input back alongside the declared output features.
#[derive(Debug, Default)]
pub struct EchoEngine;

impl EchoEngine {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Handle produced by [`EchoEngine`]
#[derive(Debug)]
pub struct EchoModel {
    model_dir: PathBuf,
    outputs: Vec<String>,
}

#[async_trait]
impl Engine for EchoEngine {
    async fn train(&self, job: TrainJob<'_>) -> Result<()> {
        let dataset = tokio::fs::metadata(job.dataset).await.map_err(|e| {
            EngineError::TrainFailed(format!("Cannot read dataset {}: {e}", job.dataset.display()))
        })?;
        if dataset.len() == 0 {
            return Err(EngineError::TrainFailed("Dataset is empty".to_string()).into());
        }

        let summary = json!({
            "engine": "echo",
            "key": job.key,
            "dataset_bytes": dataset.len(),
            "input_features": job.schema.input_names().collect::<Vec<_>>(),
            "output_features": job.schema.output_features.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
        });

        tokio::fs::create_dir_all(job.output).await?;
        tokio::fs::write(job.output.join(MODEL_FILE), serde_json::to_vec_pretty(&summary)?).await?;

        tracing::debug!(key = job.key, bytes = dataset.len(), "Echo engine trained");
        Ok(())
    }

    async fn load(&self, model_dir: &Path, schema: &Schema) -> Result<Handle> {
        let mut entries = tokio::fs::read_dir(model_dir).await.map_err(|e| {
            EngineError::LoadFailed(format!("Cannot open {}: {e}", model_dir.display()))
        })?;
        if entries.next_entry().await?.is_none() {
            return Err(EngineError::LoadFailed(format!(
                "Model directory {} is empty",
                model_dir.display()
            ))
            .into());
        }

        Ok(Arc::new(EchoModel {
            model_dir: model_dir.to_path_buf(),
            outputs: schema
                .output_features
                .iter()
                .map(|f| f.name.clone())
                .collect(),
        }))
    }

    fn engine_name(&self) -> &'static str {
        "echo"
    }
}

#[async_trait]
impl ModelHandle for EchoModel {
    async fn predict(&self, input: &Value) -> Result<Value> {
        Ok(json!({
            "model": self.model_dir.parent().and_then(Path::file_name).map(|n| n.to_string_lossy()),
            "outputs": self.outputs,
            "input": input,
        }))
    }
}
