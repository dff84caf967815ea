pub mod client;
pub mod server;

use crate::latency::{LatencySample, LatencySummary};
use crate::models::VersionId;
use crate::telemetry::ProcessStats;
use serde::{Deserialize, Serialize};

/// Message returned by Load / Train / Delete on success
pub const DONE: &str = "DONE";

/// Successful response envelope
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Reply<T> {
    pub status: u16,
    pub msg: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionId>,
}

impl<T> Reply<T> {
    pub const fn ok(msg: T) -> Self {
        Self {
            status: 200,
            msg,
            version: None,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: VersionId) -> Self {
        self.version = Some(version);
        self
    }
}

/// Error response body
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorReply {
    pub status: u16,
    /// Stable error kind, see `ModeldError::kind`
    pub error: String,
    pub msg: String,
}

/// Payload of `GET /stats`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatsReport {
    pub engine: String,
    pub models: usize,
    pub process: ProcessStats,
    pub latency: Option<LatencySummary>,
    pub samples: Vec<LatencySample>,
}
