//! Filesystem artifact store.
//!
//! Layout under the store root:
//!
//! ```text
//! {key}/{version}/            published version (listable)
//!     version.json            ArtifactVersion record
//!     io_params.json          schema document
//!     metadata.json           caller metadata (loaded versions)
//!     model/                  serialized model
//!     training_data/{file}    raw training input (trained versions)
//! .staging/{key}/{version}/   in-progress writes, never listed
//! ```
//!
//! A version becomes visible only through a single directory rename out of
//! `.staging`, so readers never observe partially written versions.

use crate::archive;
use crate::error::{ModeldError, Result};
use crate::models::schema::Schema;
use crate::models::version::{validate_key, ArtifactVersion, Origin, VersionId};
use std::fs;
use std::path::{Path, PathBuf};

pub const SCHEMA_FILE: &str = "io_params.json";
pub const VERSION_FILE: &str = "version.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const MODEL_DIR: &str = "model";
pub const TRAINING_DATA_DIR: &str = "training_data";
const STAGING_DIR: &str = ".staging";

/// Headroom kept free on the store filesystem
const DISK_RESERVE_BYTES: u64 = 64 * 1024 * 1024;

/// A file to be written into a version, relative to the version directory
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

impl StagedFile {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// An unpublished version directory
#[derive(Debug)]
pub struct Stage {
    key: String,
    version: VersionId,
    dir: PathBuf,
}

impl Stage {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub const fn version(&self) -> &VersionId {
        &self.version
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Directory the engine writes its model output into
    #[must_use]
    pub fn model_dir(&self) -> PathBuf {
        self.dir.join(MODEL_DIR)
    }

    /// Write one file into the stage
    pub fn write(&self, file: &StagedFile) -> Result<PathBuf> {
        self.write_bytes(&file.path, &file.contents)
    }

    /// Write `contents` at `path` relative to the stage, refusing escaping paths
    pub fn write_bytes(&self, path: impl AsRef<Path>, contents: &[u8]) -> Result<PathBuf> {
        let relative = archive::safe_relative_path(&path.as_ref().to_string_lossy())?;
        let dest = self.dir.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&dest, contents)?;
        Ok(dest)
    }

    /// Unpack an archive into a subdirectory of the stage
    pub fn unpack(&self, subdir: &str, bytes: &[u8]) -> Result<()> {
        archive::unpack(bytes, &self.dir.join(subdir))?;
        Ok(())
    }
}

/// Versioned model artifacts on disk
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every version of `key`
    pub fn key_dir(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// All keys with a directory in the store, sorted
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = fs::read_dir(&self.root)?
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| validate_key(name).is_ok())
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Published versions of `key`, ascending by version id
    pub fn list_versions(&self, key: &str) -> Result<Vec<ArtifactVersion>> {
        let key_dir = self.key_dir(key)?;
        if !key_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&key_dir)?.flatten() {
            let location = entry.path();
            if !location.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(version) = VersionId::parse(&name) else {
                tracing::debug!("Skipping non-version entry {}", location.display());
                continue;
            };
            versions.push(Self::describe(key, version, location));
        }

        versions.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(versions)
    }

    /// Read the schema stored with a version
    pub fn read_schema(&self, key: &str, version: &VersionId) -> Result<Schema> {
        let path = self.key_dir(key)?.join(version.as_str()).join(SCHEMA_FILE);
        let bytes = fs::read(&path).map_err(|e| {
            ModeldError::ArtifactCorrupt(format!("Cannot read {}: {e}", path.display()))
        })?;
        Schema::from_slice(&bytes).map_err(|e| {
            ModeldError::ArtifactCorrupt(format!("Cannot parse {}: {e}", path.display()))
        })
    }

    /// Create a fresh stage for `key`/`version`.
    ///
    /// Fails with `VersionConflict` if that version is already published.
    pub fn stage(&self, key: &str, version: &VersionId) -> Result<Stage> {
        let published = self.key_dir(key)?.join(version.as_str());
        if published.exists() {
            return Err(ModeldError::VersionConflict {
                key: key.to_string(),
                version: version.to_string(),
            });
        }

        let dir = self.root.join(STAGING_DIR).join(key).join(version.as_str());
        if dir.exists() {
            return Err(ModeldError::VersionConflict {
                key: key.to_string(),
                version: version.to_string(),
            });
        }
        fs::create_dir_all(&dir)?;

        Ok(Stage {
            key: key.to_string(),
            version: version.clone(),
            dir,
        })
    }

    /// Stage an already populated directory as `key`/`version` by moving it
    pub fn adopt(&self, key: &str, version: &VersionId, source: &Path) -> Result<Stage> {
        let stage = self.stage(key, version)?;
        fs::remove_dir(&stage.dir)?;
        if let Err(e) = fs::rename(source, &stage.dir) {
            self.prune_staging_parent(key);
            return Err(e.into());
        }
        Ok(stage)
    }

    #[must_use]
    pub fn has_version(&self, key: &str, version: &VersionId) -> bool {
        self.key_dir(key)
            .map(|dir| dir.join(version.as_str()).exists())
            .unwrap_or(false)
    }

    /// Private working directory under the staging area; the caller removes it
    pub fn scratch_dir(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let dir = self
            .root
            .join(STAGING_DIR)
            .join(key)
            .join(format!(".scratch-{}", VersionId::next_after(None)));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove a scratch directory created by [`Self::scratch_dir`]
    pub fn remove_scratch(&self, key: &str, dir: &Path) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        self.prune_staging_parent(key);
        Ok(())
    }

    /// Atomically publish a stage as a listable version
    pub fn publish(&self, stage: &Stage, origin: Origin) -> Result<ArtifactVersion> {
        let key_dir = self.key_dir(&stage.key)?;
        let dest = key_dir.join(stage.version.as_str());
        if dest.exists() {
            return Err(ModeldError::VersionConflict {
                key: stage.key.clone(),
                version: stage.version.to_string(),
            });
        }

        if !stage.dir.join(SCHEMA_FILE).is_file() {
            return Err(ModeldError::ArtifactCorrupt(format!(
                "Stage {} has no {SCHEMA_FILE}",
                stage.dir.display()
            )));
        }

        let mut record = Self::describe(&stage.key, stage.version.clone(), dest.clone());
        record.origin = Some(origin);
        let record_json = serde_json::to_vec_pretty(&record)?;
        fs::write(stage.dir.join(VERSION_FILE), record_json)?;

        fs::create_dir_all(&key_dir)?;
        fs::rename(&stage.dir, &dest).map_err(|e| {
            if dest.exists() {
                ModeldError::VersionConflict {
                    key: stage.key.clone(),
                    version: stage.version.to_string(),
                }
            } else {
                ModeldError::Io(e)
            }
        })?;
        self.prune_staging_parent(&stage.key);

        tracing::info!(key = %stage.key, version = %stage.version, "Published version");
        Ok(record)
    }

    /// Drop an unpublished stage
    pub fn discard(&self, stage: Stage) -> Result<()> {
        if stage.dir.exists() {
            fs::remove_dir_all(&stage.dir)?;
        }
        self.prune_staging_parent(&stage.key);
        Ok(())
    }

    /// Write `files` as a new version in one all-or-nothing step
    pub fn put(
        &self,
        key: &str,
        version: &VersionId,
        files: &[StagedFile],
        origin: Origin,
    ) -> Result<ArtifactVersion> {
        let stage = self.stage(key, version)?;
        let published = files
            .iter()
            .try_for_each(|file| stage.write(file).map(|_| ()))
            .and_then(|()| self.publish(&stage, origin));

        if published.is_err() {
            self.discard(stage)?;
        }
        published
    }

    /// Stages that were never published or discarded (crash or failed training)
    pub fn pending_stages(&self) -> Result<Vec<PathBuf>> {
        let staging = self.root.join(STAGING_DIR);
        let mut pending = Vec::new();
        if !staging.is_dir() {
            return Ok(pending);
        }
        for key_entry in fs::read_dir(&staging)?.flatten() {
            if !key_entry.path().is_dir() {
                continue;
            }
            for version_entry in fs::read_dir(key_entry.path())?.flatten() {
                pending.push(version_entry.path());
            }
        }
        pending.sort();
        Ok(pending)
    }

    /// Delete every version of `key`
    pub fn remove_key(&self, key: &str) -> Result<bool> {
        let key_dir = self.key_dir(key)?;
        if key_dir.exists() {
            fs::remove_dir_all(&key_dir)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Fail early if `needed` bytes would not fit on the store filesystem
    pub fn ensure_space(&self, needed: u64) -> Result<()> {
        let stats = nix::sys::statvfs::statvfs(&self.root)
            .map_err(|e| ModeldError::Other(format!("Failed to check disk space: {e}")))?;

        #[allow(clippy::useless_conversion)]
        let available = u64::from(stats.blocks_available()) * u64::from(stats.fragment_size());
        let required = needed + DISK_RESERVE_BYTES;

        if available < required {
            return Err(ModeldError::Other(format!(
                "Not enough disk space in {}: {} MB required, {} MB available",
                self.root.display(),
                required / (1024 * 1024),
                available / (1024 * 1024)
            )));
        }
        Ok(())
    }

    /// Record for a version directory, preferring its `version.json`
    fn describe(key: &str, version: VersionId, location: PathBuf) -> ArtifactVersion {
        let stored = fs::read(location.join(VERSION_FILE))
            .ok()
            .and_then(|bytes| serde_json::from_slice::<ArtifactVersion>(&bytes).ok());

        let created_at = stored
            .as_ref()
            .map(|v| v.created_at)
            .or_else(|| version.created_at())
            .unwrap_or_else(chrono::Utc::now);

        ArtifactVersion {
            key: key.to_string(),
            version,
            created_at,
            origin: stored.and_then(|v| v.origin),
            location,
        }
    }

    fn prune_staging_parent(&self, key: &str) {
        // Only succeeds when empty
        let _ = fs::remove_dir(self.root.join(STAGING_DIR).join(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const IO_PARAMS: &[u8] = br#"{"input_features":[{"name":"x","type":"number"}]}"#;

    fn store() -> (TempDir, ArtifactStore) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path().join("models")).unwrap();
        (dir, store)
    }

    fn files() -> Vec<StagedFile> {
        vec![
            StagedFile::new(SCHEMA_FILE, IO_PARAMS),
            StagedFile::new("model/weights.bin", vec![1u8, 2, 3]),
        ]
    }

    #[test]
    fn test_put_and_list() {
        let (_dir, store) = store();
        let v1 = VersionId::parse("20230101T000000").unwrap();
        let v2 = VersionId::parse("20230601T000000").unwrap();

        store.put("key1", &v2, &files(), Origin::Loaded).unwrap();
        let put = store.put("key1", &v1, &files(), Origin::Trained).unwrap();
        assert_eq!(put.location, store.root().join("key1/20230101T000000"));

        let versions = store.list_versions("key1").unwrap();
        let ids: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(ids, vec!["20230101T000000", "20230601T000000"]);
        assert_eq!(versions[0].origin, Some(Origin::Trained));
        assert!(versions[1].model_dir().join("weights.bin").is_file());
        assert_eq!(store.keys().unwrap(), vec!["key1".to_string()]);
    }

    #[test]
    fn test_duplicate_version_conflicts() {
        let (_dir, store) = store();
        let v = VersionId::parse("20230101T000000").unwrap();
        store.put("key1", &v, &files(), Origin::Loaded).unwrap();

        let err = store.put("key1", &v, &files(), Origin::Loaded).unwrap_err();
        assert!(matches!(err, ModeldError::VersionConflict { .. }));
        assert_eq!(store.list_versions("key1").unwrap().len(), 1);
    }

    #[test]
    fn test_stage_is_not_listed_until_published() {
        let (_dir, store) = store();
        let v = VersionId::parse("20230101T000000").unwrap();
        let stage = store.stage("key1", &v).unwrap();
        stage.write(&StagedFile::new(SCHEMA_FILE, IO_PARAMS)).unwrap();

        assert!(store.list_versions("key1").unwrap().is_empty());
        assert!(store.keys().unwrap().is_empty());
        assert_eq!(store.pending_stages().unwrap().len(), 1);

        store.publish(&stage, Origin::Trained).unwrap();
        assert_eq!(store.list_versions("key1").unwrap().len(), 1);
        assert!(store.pending_stages().unwrap().is_empty());
    }

    #[test]
    fn test_publish_without_schema_is_rejected() {
        let (_dir, store) = store();
        let v = VersionId::parse("20230101T000000").unwrap();
        let err = store
            .put(
                "key1",
                &v,
                &[StagedFile::new("model/w.bin", vec![0u8])],
                Origin::Loaded,
            )
            .unwrap_err();
        assert!(matches!(err, ModeldError::ArtifactCorrupt(_)));
        assert!(store.list_versions("key1").unwrap().is_empty());
        assert!(store.pending_stages().unwrap().is_empty());
    }

    #[test]
    fn test_stage_write_rejects_escaping_paths() {
        let (_dir, store) = store();
        let v = VersionId::parse("20230101T000000").unwrap();
        let stage = store.stage("key1", &v).unwrap();
        assert!(stage
            .write(&StagedFile::new("../../outside.bin", vec![0u8]))
            .is_err());
        assert!(!store.root().join("outside.bin").exists());
        store.discard(stage).unwrap();
    }

    #[test]
    fn test_read_schema() {
        let (_dir, store) = store();
        let v = VersionId::parse("20230101T000000").unwrap();
        store.put("key1", &v, &files(), Origin::Loaded).unwrap();

        let schema = store.read_schema("key1", &v).unwrap();
        assert_eq!(schema.input_features[0].name, "x");
    }

    #[test]
    fn test_corrupt_schema() {
        let (_dir, store) = store();
        let v = VersionId::parse("20230101T000000").unwrap();
        store.put("key1", &v, &files(), Origin::Loaded).unwrap();
        fs::write(store.root().join("key1/20230101T000000").join(SCHEMA_FILE), "{").unwrap();

        let err = store.read_schema("key1", &v).unwrap_err();
        assert!(matches!(err, ModeldError::ArtifactCorrupt(_)));

        fs::remove_file(store.root().join("key1/20230101T000000").join(SCHEMA_FILE)).unwrap();
        let err = store.read_schema("key1", &v).unwrap_err();
        assert!(matches!(err, ModeldError::ArtifactCorrupt(_)));
    }

    #[test]
    fn test_non_version_directories_are_ignored() {
        let (_dir, store) = store();
        fs::create_dir_all(store.root().join("key1/results")).unwrap();
        fs::write(store.root().join("key1/notes.txt"), "hi").unwrap();
        assert!(store.list_versions("key1").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_key_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            store.list_versions("../etc"),
            Err(ModeldError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_remove_key() {
        let (_dir, store) = store();
        let v = VersionId::parse("20230101T000000").unwrap();
        store.put("key1", &v, &files(), Origin::Loaded).unwrap();

        assert!(store.remove_key("key1").unwrap());
        assert!(!store.remove_key("key1").unwrap());
        assert!(store.list_versions("key1").unwrap().is_empty());
    }

    #[test]
    fn test_adopt_scratch_directory() {
        let (_dir, store) = store();
        let v = VersionId::parse("20230101T000000").unwrap();
        let scratch = store.scratch_dir("key1").unwrap();
        let source = scratch.join(v.as_str());
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join(SCHEMA_FILE), IO_PARAMS).unwrap();

        let stage = store.adopt("key1", &v, &source).unwrap();
        let published = store.publish(&stage, Origin::Imported).unwrap();
        store.remove_scratch("key1", &scratch).unwrap();

        assert_eq!(published.origin, Some(Origin::Imported));
        assert!(store.has_version("key1", &v));
        assert!(store.pending_stages().unwrap().is_empty());
        assert!(store.adopt("key1", &v, &source).is_err());
    }

    #[test]
    fn test_ensure_space_small_request() {
        let (_dir, store) = store();
        assert!(store.ensure_space(1).is_ok());
        assert!(store.ensure_space(u64::MAX / 2).is_err());
    }
}
