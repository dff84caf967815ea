//! In-memory registry of per-key model state.
//!
//! Backed by a sharded `DashMap`: operations on unrelated keys never contend,
//! and every read-modify-write happens under that key's entry lock. No lock is
//! ever held across an `.await`.

use crate::engine::Handle;
use crate::error::{ModeldError, Result};
use crate::models::schema::Schema;
use crate::models::version::ArtifactVersion;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a model key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Ready,
    Training,
    Failed,
    Deleting,
}

impl ModelStatus {
    /// A busy key refuses every other state-changing operation
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Loading | Self::Training | Self::Deleting)
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Training => "training",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
        };
        f.write_str(name)
    }
}

/// Exclusive operations that mark a key busy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Load,
    Train,
    Delete,
}

impl Operation {
    const fn status(self) -> ModelStatus {
        match self {
            Self::Load => ModelStatus::Loading,
            Self::Train => ModelStatus::Training,
            Self::Delete => ModelStatus::Deleting,
        }
    }
}

/// Snapshot of one key's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub key: String,
    pub status: ModelStatus,
    pub schema: Option<Schema>,
    pub active_version: Option<ArtifactVersion>,
    #[serde(skip)]
    pub handle: Option<Handle>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ModelRecord {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            status: ModelStatus::Unloaded,
            schema: None,
            active_version: None,
            handle: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Concurrency-safe key → record map
#[derive(Debug, Default)]
pub struct ModelRegistry {
    records: DashMap<String, ModelRecord>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of `key`'s record
    pub fn get(&self, key: &str) -> Result<ModelRecord> {
        self.records
            .get(key)
            .map(|record| record.clone())
            .ok_or_else(|| ModeldError::UnknownKey(key.to_string()))
    }

    #[must_use]
    pub fn status(&self, key: &str) -> Option<ModelStatus> {
        self.records.get(key).map(|record| record.status)
    }

    /// Apply `f` to the record for `key`, creating an `Unloaded` one if absent
    pub fn upsert<T>(&self, key: &str, f: impl FnOnce(&mut ModelRecord) -> T) -> T {
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| ModelRecord::new(key));
        let out = f(record.value_mut());
        record.touch();
        out
    }

    /// Atomically mark `key` busy for `op`.
    ///
    /// Fails with `OperationInProgress` if another operation already owns the
    /// key. Returns the record as it was before, `None` if it did not exist.
    pub fn begin(&self, key: &str, op: Operation) -> Result<Option<ModelRecord>> {
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.status.is_busy() {
                    return Err(ModeldError::OperationInProgress {
                        key: key.to_string(),
                        status: record.status.to_string(),
                    });
                }
                let previous = record.clone();
                record.status = op.status();
                record.last_error = None;
                record.touch();
                Ok(Some(previous))
            }
            Entry::Vacant(entry) => {
                let mut record = ModelRecord::new(key);
                record.status = op.status();
                entry.insert(record);
                Ok(None)
            }
        }
    }

    /// Put back the record `begin` replaced, or drop the one it created
    pub fn restore(&self, key: &str, previous: Option<ModelRecord>) {
        match previous {
            Some(record) => {
                self.records.insert(key.to_string(), record);
            }
            None => {
                self.records.remove(key);
            }
        }
    }

    /// Swap in a freshly materialized version in a single step
    pub fn publish(&self, key: &str, version: ArtifactVersion, schema: Schema, handle: Handle) {
        self.upsert(key, |record| {
            record.status = ModelStatus::Ready;
            record.active_version = Some(version);
            record.schema = Some(schema);
            record.handle = Some(handle);
            record.last_error = None;
        });
    }

    /// Mark `key` failed, keeping the error text for inspection
    pub fn fail(&self, key: &str, error: impl Into<String>) {
        let error = error.into();
        self.upsert(key, |record| {
            record.status = ModelStatus::Failed;
            record.handle = None;
            record.last_error = Some(error);
        });
    }

    /// Schema and handle of a `Ready` model
    pub fn ready_handle(&self, key: &str) -> Result<(Schema, Handle)> {
        let record = self
            .records
            .get(key)
            .ok_or_else(|| ModeldError::UnknownKey(key.to_string()))?;

        match (record.status, &record.schema, &record.handle) {
            (ModelStatus::Ready, Some(schema), Some(handle)) => Ok((schema.clone(), handle.clone())),
            (status, _, _) => Err(ModeldError::ModelNotReady {
                key: key.to_string(),
                status: status.to_string(),
            }),
        }
    }

    /// All records, sorted by key
    #[must_use]
    pub fn list(&self) -> Vec<ModelRecord> {
        let mut records: Vec<ModelRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Drop the record for `key`
    pub fn remove(&self, key: &str) -> Option<ModelRecord> {
        self.records.remove(key).map(|(_, record)| record)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
