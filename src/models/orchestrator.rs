//! Model lifecycle: load, train, eval, package, import, recover, delete.
//!
//! Per-key exclusion for every state-changing operation comes from
//! [`ModelRegistry::begin`]; the busy state is owned by an [`OperationGuard`]
//! that marks the key failed if the calling future is dropped before finishing.

use crate::archive;
use crate::engine::{Engine, Handle, TrainJob};
use crate::error::{EngineError, ModeldError, Result};
use crate::models::registry::{ModelRecord, ModelRegistry, Operation};
use crate::models::resolver;
use crate::models::schema::Schema;
use crate::models::store::{
    ArtifactStore, Stage, METADATA_FILE, MODEL_DIR, SCHEMA_FILE, TRAINING_DATA_DIR,
};
use crate::models::version::{validate_key, ArtifactVersion, Origin, VersionId};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One uploaded file
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    /// Last path segment of the client-supplied name, or `fallback`
    fn safe_name(&self, fallback: &str) -> String {
        self.file_name
            .rsplit(['/', '\\'])
            .next()
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .unwrap_or(fallback)
            .to_string()
    }
}

/// Parts of a Load request; all three are required
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    pub model: Option<Upload>,
    pub metadata: Option<Upload>,
    pub io_params: Option<Upload>,
}

/// Parts of a Train request; both are required
#[derive(Debug, Clone, Default)]
pub struct TrainRequest {
    pub training_data: Option<Upload>,
    pub io_params: Option<Upload>,
}

/// A record together with the versions stored for its key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(flatten)]
    pub record: ModelRecord,
    pub versions: Vec<ArtifactVersion>,
}

/// Outcome of a startup scan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub ready: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub pending_stages: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Ready,
    Skipped,
}

/// Owns a key's busy state until completed or failed
struct OperationGuard<'a> {
    registry: &'a ModelRegistry,
    key: &'a str,
    previous: Option<ModelRecord>,
    armed: bool,
}

impl OperationGuard<'_> {
    fn complete(mut self, version: ArtifactVersion, schema: Schema, handle: Handle) {
        self.armed = false;
        self.registry.publish(self.key, version, schema, handle);
    }

    fn fail(mut self, error: &ModeldError) {
        self.armed = false;
        self.registry.fail(self.key, error.to_string());
    }

    /// Nothing changed on disk: put the key back as it was
    fn abandon(mut self) {
        self.armed = false;
        self.registry.restore(self.key, self.previous.take());
    }

    /// The key is gone from disk: drop its record
    fn retire(mut self) {
        self.armed = false;
        self.registry.remove(self.key);
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(key = self.key, "Operation dropped before completion");
            self.registry.fail(self.key, EngineError::Cancelled.to_string());
        }
    }
}

/// Coordinates the registry, the artifact store and the engine
pub struct Orchestrator {
    store: ArtifactStore,
    registry: ModelRegistry,
    engine: Arc<dyn Engine>,
}

impl Orchestrator {
    pub fn new(store: ArtifactStore, engine: Arc<dyn Engine>) -> Self {
        Self {
            store,
            registry: ModelRegistry::new(),
            engine,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &ArtifactStore {
        &self.store
    }

    #[must_use]
    pub const fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    #[must_use]
    pub fn engine_name(&self) -> &str {
        self.engine.engine_name()
    }

    /// Import a pre-built model bundle as a new version and make it live
    pub async fn load(&self, key: &str, request: LoadRequest) -> Result<ArtifactVersion> {
        validate_key(key)?;
        let model = required(request.model, "model")?;
        let metadata = required(request.metadata, "metadata")?;
        let io_params = required(request.io_params, "io_params")?;
        let schema = Schema::from_slice(&io_params.bytes)?;

        let guard = self.begin(key, Operation::Load)?;
        tracing::info!(key, bytes = model.bytes.len(), "Loading model bundle");

        let store = self.store.clone();
        let owned_key = key.to_string();
        let staged =
            blocking(move || stage_load(&store, &owned_key, &model, &metadata, &io_params)).await;

        let outcome = match staged {
            Ok(version) => self
                .engine
                .load(&version.model_dir(), &schema)
                .await
                .map(|handle| (version, handle)),
            Err(e) => Err(e),
        };

        match outcome {
            Ok((version, handle)) => {
                tracing::info!(key, version = %version.version, "Model ready");
                guard.complete(version.clone(), schema, handle);
                Ok(version)
            }
            Err(e) => {
                report("load", key, &e);
                guard.fail(&e);
                Err(e)
            }
        }
    }

    /// Train a new version from an uploaded dataset and make it live.
    ///
    /// Runs to completion before returning. A failed run leaves the key
    /// `Failed` and its stage on disk; it is never retried automatically.
    pub async fn train(&self, key: &str, request: TrainRequest) -> Result<ArtifactVersion> {
        validate_key(key)?;
        let training_data = required(request.training_data, "training_data")?;
        let io_params = required(request.io_params, "io_params")?;
        let schema = Schema::from_slice(&io_params.bytes)?;

        let guard = self.begin(key, Operation::Train)?;

        match self.run_training(key, training_data, io_params, &schema).await {
            Ok((version, handle)) => {
                tracing::info!(key, version = %version.version, "Training complete, model ready");
                guard.complete(version.clone(), schema, handle);
                Ok(version)
            }
            Err(e) => {
                report("train", key, &e);
                guard.fail(&e);
                Err(e)
            }
        }
    }

    /// Validate `payload` against the live schema and run inference
    pub async fn eval(&self, key: &str, payload: &Value) -> Result<Value> {
        let (schema, handle) = self.registry.ready_handle(key)?;
        schema.validate(payload)?;

        handle.predict(payload).await.map_err(|e| {
            report("eval", key, &e);
            e
        })
    }

    /// Zip every stored version of `key`
    pub async fn package(&self, key: &str) -> Result<Vec<u8>> {
        let store = self.store.clone();
        let key = key.to_string();
        blocking(move || {
            if store.list_versions(&key)?.is_empty() {
                return Err(ModeldError::NoVersions(key));
            }
            archive::pack(&store.key_dir(&key)?)
        })
        .await
    }

    /// Publish the versions contained in a package, then reload the key.
    ///
    /// The key is `Loading` for the whole import. A rejected archive leaves
    /// the key as it was.
    pub async fn import(&self, key: &str, bytes: Vec<u8>) -> Result<Vec<ArtifactVersion>> {
        validate_key(key)?;
        if !archive::is_zip(&bytes) {
            return Err(ModeldError::Archive(
                "Import body is not a zip archive".to_string(),
            ));
        }

        let guard = self.begin(key, Operation::Load)?;
        let store = self.store.clone();
        let owned_key = key.to_string();
        let imported = match blocking(move || import_archive(&store, &owned_key, &bytes)).await {
            Ok(imported) => imported,
            Err(e) => {
                report("import", key, &e);
                guard.abandon();
                return Err(e);
            }
        };
        tracing::info!(key, count = imported.len(), "Imported model versions");

        match self.materialize_latest(key).await {
            Ok((version, schema, handle)) => {
                guard.complete(version, schema, handle);
                Ok(imported)
            }
            Err(e) => {
                report("import", key, &e);
                guard.fail(&e);
                Err(e)
            }
        }
    }

    /// Rebuild registry state from the store.
    ///
    /// Every key on disk ends up `Ready` on its latest version or `Failed`
    /// with the reason; keys with a Load/Train in flight are left alone.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let store = self.store.clone();
        let (keys, pending_stages) =
            blocking(move || Ok((store.keys()?, store.pending_stages()?))).await?;

        for stage in &pending_stages {
            tracing::warn!(
                "Unpublished stage kept for manual retry: {}",
                stage.display()
            );
        }

        let outcomes = join_all(keys.iter().map(|key| self.recover_key(key))).await;

        let mut summary = RecoveryReport {
            pending_stages,
            ..RecoveryReport::default()
        };
        for (key, outcome) in keys.into_iter().zip(outcomes) {
            match outcome {
                Ok(Recovery::Ready) => summary.ready.push(key),
                Ok(Recovery::Skipped) => summary.skipped.push(key),
                Err(_) => summary.failed.push(key),
            }
        }

        tracing::info!(
            ready = summary.ready.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            "Recovery complete"
        );
        Ok(summary)
    }

    /// Remove every stored version of a key, then its record.
    ///
    /// The key stays `Deleting` until its directory is gone.
    pub async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let guard = self.begin(key, Operation::Delete)?;
        let existed = guard.previous.is_some();

        let store = self.store.clone();
        let owned_key = key.to_string();
        let removed_dir = match blocking(move || store.remove_key(&owned_key)).await {
            Ok(removed) => removed,
            Err(e) => {
                report("delete", key, &e);
                guard.fail(&e);
                return Err(e);
            }
        };
        guard.retire();

        if !existed && !removed_dir {
            return Err(ModeldError::UnknownKey(key.to_string()));
        }
        tracing::info!(key, "Deleted model");
        Ok(())
    }

    /// Record snapshot plus stored versions
    pub async fn status(&self, key: &str) -> Result<ModelDetails> {
        let record = self.registry.get(key)?;
        let store = self.store.clone();
        let owned_key = key.to_string();
        let versions = blocking(move || store.list_versions(&owned_key)).await?;
        Ok(ModelDetails { record, versions })
    }

    #[must_use]
    pub fn list(&self) -> Vec<ModelRecord> {
        self.registry.list()
    }

    fn begin<'a>(&'a self, key: &'a str, op: Operation) -> Result<OperationGuard<'a>> {
        let previous = self.registry.begin(key, op)?;
        Ok(OperationGuard {
            registry: &self.registry,
            key,
            previous,
            armed: true,
        })
    }

    async fn run_training(
        &self,
        key: &str,
        training_data: Upload,
        io_params: Upload,
        schema: &Schema,
    ) -> Result<(ArtifactVersion, Handle)> {
        let store = self.store.clone();
        let owned_key = key.to_string();
        let prepared =
            blocking(move || prepare_training(&store, &owned_key, &training_data, &io_params))
                .await?;

        tracing::info!(
            key,
            version = %prepared.stage.version(),
            engine = self.engine.engine_name(),
            "Training started"
        );

        let output = prepared.stage.model_dir();
        let job = TrainJob {
            key,
            dataset: &prepared.dataset,
            io_params: &prepared.io_params,
            schema,
            output: &output,
        };
        if let Err(e) = self.engine.train(job).await {
            tracing::warn!(
                key,
                "Training failed, stage kept at {}",
                prepared.stage.path().display()
            );
            return Err(e);
        }

        let store = self.store.clone();
        let stage = prepared.stage;
        let version = blocking(move || store.publish(&stage, Origin::Trained)).await?;
        let handle = self.engine.load(&version.model_dir(), schema).await?;
        Ok((version, handle))
    }

    async fn recover_key(&self, key: &str) -> Result<Recovery> {
        let guard = match self.begin(key, Operation::Load) {
            Ok(guard) => guard,
            Err(ModeldError::OperationInProgress { .. }) => {
                tracing::debug!(key, "Skipping recovery of busy key");
                return Ok(Recovery::Skipped);
            }
            Err(e) => return Err(e),
        };

        match self.materialize_latest(key).await {
            Ok((version, schema, handle)) => {
                tracing::debug!(key, version = %version.version, "Recovered model");
                guard.complete(version, schema, handle);
                Ok(Recovery::Ready)
            }
            Err(e) => {
                report("recover", key, &e);
                guard.fail(&e);
                Err(e)
            }
        }
    }

    async fn materialize_latest(&self, key: &str) -> Result<(ArtifactVersion, Schema, Handle)> {
        let store = self.store.clone();
        let owned_key = key.to_string();
        let (version, schema) = blocking(move || {
            let version = resolver::latest(&store, &owned_key)?;
            let schema = store.read_schema(&owned_key, &version.version)?;
            Ok((version, schema))
        })
        .await?;

        let handle = self.engine.load(&version.model_dir(), &schema).await?;
        Ok((version, schema, handle))
    }
}

/// Dataset and schema persisted in a stage before the engine runs
struct PreparedTraining {
    stage: Stage,
    dataset: PathBuf,
    io_params: PathBuf,
}

fn required(part: Option<Upload>, name: &str) -> Result<Upload> {
    part.ok_or_else(|| ModeldError::MissingInput(format!("request part '{name}' is required")))
}

/// User errors are routine; everything else is an incident
fn report(op: &str, key: &str, error: &ModeldError) {
    if error.is_user_error() {
        tracing::debug!(key, "{op} rejected: {error}");
    } else {
        tracing::error!(key, "{op} failed: {error}");
    }
}

/// Run filesystem work off the async worker threads
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ModeldError::Other(format!("Blocking task failed: {e}")))?
}

fn next_version(store: &ArtifactStore, key: &str) -> Result<VersionId> {
    let versions = store.list_versions(key)?;
    Ok(VersionId::next_after(versions.last().map(|v| &v.version)))
}

fn upload_size(uploads: &[&Upload]) -> u64 {
    uploads.iter().map(|u| u.bytes.len() as u64).sum()
}

fn stage_load(
    store: &ArtifactStore,
    key: &str,
    model: &Upload,
    metadata: &Upload,
    io_params: &Upload,
) -> Result<ArtifactVersion> {
    store.ensure_space(upload_size(&[model, metadata, io_params]))?;
    let stage = store.stage(key, &next_version(store, key)?)?;

    let published = fill_load_stage(&stage, model, metadata, io_params)
        .and_then(|()| store.publish(&stage, Origin::Loaded));
    if published.is_err() {
        if let Err(e) = store.discard(stage) {
            tracing::warn!(key, "Failed to discard stage: {e}");
        }
    }
    published
}

fn fill_load_stage(stage: &Stage, model: &Upload, metadata: &Upload, io_params: &Upload) -> Result<()> {
    stage.write_bytes(SCHEMA_FILE, &io_params.bytes)?;
    stage.write_bytes(METADATA_FILE, &metadata.bytes)?;

    if archive::is_zip(&model.bytes) {
        stage.unpack(MODEL_DIR, &model.bytes)
    } else {
        let name = model.safe_name("model.bin");
        stage.write_bytes(Path::new(MODEL_DIR).join(name), &model.bytes)?;
        Ok(())
    }
}

fn prepare_training(
    store: &ArtifactStore,
    key: &str,
    training_data: &Upload,
    io_params: &Upload,
) -> Result<PreparedTraining> {
    store.ensure_space(upload_size(&[training_data, io_params]))?;
    let stage = store.stage(key, &next_version(store, key)?)?;

    let written = stage.write_bytes(SCHEMA_FILE, &io_params.bytes).and_then(|io_params| {
        let name = training_data.safe_name("dataset");
        let dataset =
            stage.write_bytes(Path::new(TRAINING_DATA_DIR).join(name), &training_data.bytes)?;
        Ok((dataset, io_params))
    });

    match written {
        Ok((dataset, io_params)) => Ok(PreparedTraining {
            stage,
            dataset,
            io_params,
        }),
        Err(e) => {
            if let Err(discard_err) = store.discard(stage) {
                tracing::warn!(key, "Failed to discard stage: {discard_err}");
            }
            Err(e)
        }
    }
}

fn import_archive(store: &ArtifactStore, key: &str, bytes: &[u8]) -> Result<Vec<ArtifactVersion>> {
    store.ensure_space(bytes.len() as u64)?;

    let scratch = store.scratch_dir(key)?;
    let result = publish_unpacked(store, key, bytes, &scratch);
    if let Err(e) = store.remove_scratch(key, &scratch) {
        tracing::warn!(key, "Failed to remove {}: {e}", scratch.display());
    }
    result
}

fn publish_unpacked(
    store: &ArtifactStore,
    key: &str,
    bytes: &[u8],
    scratch: &Path,
) -> Result<Vec<ArtifactVersion>> {
    archive::unpack(bytes, scratch)?;

    let mut versions: Vec<VersionId> = fs::read_dir(scratch)?
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().and_then(|n| VersionId::parse(n).ok()))
        .collect();
    versions.sort();

    if versions.is_empty() {
        return Err(ModeldError::Archive(
            "Archive contains no model versions".to_string(),
        ));
    }

    // Check everything before publishing anything
    for version in &versions {
        if store.has_version(key, version) {
            return Err(ModeldError::VersionConflict {
                key: key.to_string(),
                version: version.to_string(),
            });
        }
        if !scratch.join(version.as_str()).join(SCHEMA_FILE).is_file() {
            return Err(ModeldError::ArtifactCorrupt(format!(
                "Archived version {version} has no {SCHEMA_FILE}"
            )));
        }
    }

    versions
        .iter()
        .map(|version| {
            let stage = store.adopt(key, version, &scratch.join(version.as_str()))?;
            store.publish(&stage, Origin::Imported)
        })
        .collect()
}
