use crate::error::{ModeldError, Result};
use crate::models::store::ArtifactStore;
use crate::models::version::ArtifactVersion;

/// Pick the version with the greatest id, independent of listing order
#[must_use]
pub fn select_latest(versions: &[ArtifactVersion]) -> Option<&ArtifactVersion> {
    versions.iter().max_by(|a, b| a.version.cmp(&b.version))
}

/// Latest published version of `key`
pub fn latest(store: &ArtifactStore, key: &str) -> Result<ArtifactVersion> {
    let versions = store.list_versions(key)?;
    select_latest(&versions)
        .cloned()
        .ok_or_else(|| ModeldError::NoVersions(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::store::{StagedFile, SCHEMA_FILE};
    use crate::models::version::{Origin, VersionId};
    use chrono::Utc;
    use rand::seq::SliceRandom;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn version(id: &str) -> ArtifactVersion {
        ArtifactVersion {
            key: "key1".to_string(),
            version: VersionId::parse(id).unwrap(),
            created_at: Utc::now(),
            origin: None,
            location: PathBuf::from(id),
        }
    }

    #[test]
    fn test_select_latest_ignores_order() {
        let mut versions = vec![
            version("20230101T000000"),
            version("20230601T000000"),
            version("20221231T000000"),
        ];

        for _ in 0..10 {
            versions.shuffle(&mut rand::thread_rng());
            let latest = select_latest(&versions).unwrap();
            assert_eq!(latest.version.as_str(), "20230601T000000");
        }
    }

    #[test]
    fn test_select_latest_empty() {
        assert!(select_latest(&[]).is_none());
    }

    #[test]
    fn test_latest_from_store() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let schema = StagedFile::new(SCHEMA_FILE, br#"{"input_features":[]}"#.to_vec());

        for id in ["20230101T000000", "20230601T000000", "20221231T000000"] {
            store
                .put(
                    "key1",
                    &VersionId::parse(id).unwrap(),
                    std::slice::from_ref(&schema),
                    Origin::Loaded,
                )
                .unwrap();
        }

        let latest = latest(&store, "key1").unwrap();
        assert_eq!(latest.version.as_str(), "20230601T000000");
    }

    #[test]
    fn test_latest_without_versions() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        assert!(matches!(
            latest(&store, "nothing"),
            Err(ModeldError::NoVersions(_))
        ));
    }
}
