use crate::error::{ModeldError, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Fixed-width UTC timestamps, so byte order equals chronological order.
/// The second-resolution form is a prefix of the microsecond form.
const VERSION_FORMAT: &str = "%Y%m%dT%H%M%S%6f";
const VERSION_FORMAT_SECONDS: &str = "%Y%m%dT%H%M%S";
const VERSION_LEN: usize = 21;
const VERSION_LEN_SECONDS: usize = 15;

const MAX_KEY_LEN: usize = 128;

/// Check that a caller-supplied key can safely name a directory
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(ModeldError::InvalidKey(key.to_string()))
    }
}

/// Sortable, self-describing version identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId(String);

impl VersionId {
    /// Parse a version id, rejecting anything that is not fixed-width
    pub fn parse(raw: &str) -> Result<Self> {
        if Self::timestamp_of(raw).is_some() {
            Ok(Self(raw.to_string()))
        } else {
            Err(ModeldError::ArtifactCorrupt(format!(
                "'{raw}' is not a valid version id"
            )))
        }
    }

    /// Version id for the given instant
    #[must_use]
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.format(VERSION_FORMAT).to_string())
    }

    /// A version id for now that sorts strictly after `prev`
    #[must_use]
    pub fn next_after(prev: Option<&Self>) -> Self {
        let now = Utc::now();
        match prev.and_then(Self::created_at) {
            Some(last) if now <= last => Self::from_datetime(last + Duration::microseconds(1)),
            _ => Self::from_datetime(now),
        }
    }

    /// Instant encoded in the id
    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Self::timestamp_of(&self.0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn timestamp_of(raw: &str) -> Option<DateTime<Utc>> {
        let format = match raw.len() {
            VERSION_LEN => VERSION_FORMAT,
            VERSION_LEN_SECONDS => VERSION_FORMAT_SECONDS,
            _ => return None,
        };
        NaiveDateTime::parse_from_str(raw, format)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VersionId {
    type Error = ModeldError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<VersionId> for String {
    fn from(version: VersionId) -> Self {
        version.0
    }
}

/// How a version came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Loaded,
    Trained,
    Imported,
}

/// One published snapshot of a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactVersion {
    pub key: String,
    pub version: VersionId,
    pub created_at: DateTime<Utc>,
    pub origin: Option<Origin>,
    #[serde(skip)]
    pub location: PathBuf,
}

impl ArtifactVersion {
    /// Directory holding the serialized model
    #[must_use]
    pub fn model_dir(&self) -> PathBuf {
        self.location.join(super::store::MODEL_DIR)
    }
}
