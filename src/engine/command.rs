use crate::config::schema::EngineConfig;
use crate::engine::{Engine, Handle, ModelHandle, TrainJob};
use crate::error::{EngineError, ModeldError, Result};
use crate::models::schema::Schema;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Keep error messages readable when a tool dumps a long traceback
const STDERR_TAIL_BYTES: usize = 2048;

/// Engine that shells out to external training / prediction programs.
///
/// Child processes are killed when the calling future is dropped, so a client
/// disconnect or timeout never leaves an orphaned training run behind.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    train_command: Vec<String>,
    predict_command: Vec<String>,
    train_timeout: Duration,
    predict_timeout: Duration,
}

/// Handle produced by [`CommandEngine`]: one predict process per request
#[derive(Debug)]
pub struct CommandModel {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandEngine {
    /// Create a new command engine, verifying the programs are in PATH
    pub fn new(config: &EngineConfig) -> Result<Self> {
        for argv in [&config.train_command, &config.predict_command] {
            let program = argv
                .first()
                .ok_or_else(|| ModeldError::Config("Engine command is empty".to_string()))?;
            if which::which(program).is_err() {
                return Err(EngineError::CommandNotFound(program.clone()).into());
            }
        }

        Ok(Self {
            train_command: config.train_command.clone(),
            predict_command: config.predict_command.clone(),
            train_timeout: Duration::from_secs(config.train_timeout_secs),
            predict_timeout: Duration::from_secs(config.predict_timeout_secs),
        })
    }

    /// Substitute `{name}` placeholders in an argument vector
    fn render(argv: &[String], vars: &[(&str, &Path)]) -> Vec<String> {
        argv.iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{name}}}"), &value.to_string_lossy())
                })
            })
            .collect()
    }
}

/// Spawn `argv`, optionally feed `stdin`, and wait with a deadline.
///
/// Input is written while output is drained, both under the same deadline.
async fn run(argv: &[String], stdin: Option<Vec<u8>>, timeout: Duration) -> Result<Output> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ModeldError::Config("Engine command is empty".to_string()))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EngineError::CommandNotFound(format!("{program}: {e}")))?;

    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
            match pipe.write_all(&input).await {
                // The child may exit without reading everything; its status says why
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
            // Dropping the pipe closes stdin so the child sees EOF
        }
        Ok::<(), std::io::Error>(())
    };

    let (fed, output) = tokio::time::timeout(timeout, async {
        tokio::join!(feed, child.wait_with_output())
    })
    .await
    .map_err(|_| EngineError::Timeout(timeout))?;
    fed?;
    output.map_err(ModeldError::from)
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    let start = trimmed.len().saturating_sub(STDERR_TAIL_BYTES);
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(trimmed.len());
    format!("{}: {}", output.status, &trimmed[start..])
}

#[async_trait]
impl Engine for CommandEngine {
    async fn train(&self, job: TrainJob<'_>) -> Result<()> {
        let argv = Self::render(
            &self.train_command,
            &[
                ("dataset", job.dataset),
                ("config", job.io_params),
                ("output", job.output),
            ],
        );
        tracing::info!(key = job.key, command = ?argv, "Starting training process");

        let output = run(&argv, None, self.train_timeout).await?;
        if !output.status.success() {
            return Err(EngineError::TrainFailed(stderr_tail(&output)).into());
        }
        if !job.output.is_dir() {
            return Err(EngineError::TrainFailed(format!(
                "Training finished but wrote nothing to {}",
                job.output.display()
            ))
            .into());
        }
        Ok(())
    }

    async fn load(&self, model_dir: &Path, _schema: &Schema) -> Result<Handle> {
        if !model_dir.is_dir() {
            return Err(EngineError::LoadFailed(format!(
                "Model directory {} does not exist",
                model_dir.display()
            ))
            .into());
        }

        Ok(Arc::new(CommandModel {
            argv: Self::render(&self.predict_command, &[("model", model_dir)]),
            timeout: self.predict_timeout,
        }))
    }

    fn engine_name(&self) -> &'static str {
        "command"
    }
}

#[async_trait]
impl ModelHandle for CommandModel {
    async fn predict(&self, input: &Value) -> Result<Value> {
        let output = run(&self.argv, Some(serde_json::to_vec(input)?), self.timeout).await?;
        if !output.status.success() {
            return Err(EngineError::PredictFailed(stderr_tail(&output)).into());
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            EngineError::PredictFailed(format!("Prediction output is not JSON: {e}")).into()
        })
    }
}
