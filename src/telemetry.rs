//! Process-level CPU / memory / disk sampling reported by `/stats`.

use crate::error::{ModeldError, Result};
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::time::TimeValLike;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// One telemetry reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// CPU used by this process since the previous sample, as a share of one core
    pub cpu_percent: f64,
    pub cpu_time_secs: f64,
    pub peak_rss_kb: i64,
    pub disk_total_bytes: u64,
    pub disk_available_bytes: u64,
}

/// Samples resource usage; CPU is reported relative to the previous sample
#[derive(Debug)]
pub struct Telemetry {
    disk_path: PathBuf,
    last: Mutex<(Instant, i64)>,
}

impl Telemetry {
    pub fn new(disk_path: impl Into<PathBuf>) -> Result<Self> {
        let cpu = cpu_micros()?;
        Ok(Self {
            disk_path: disk_path.into(),
            last: Mutex::new((Instant::now(), cpu)),
        })
    }

    #[allow(clippy::cast_precision_loss, clippy::useless_conversion)]
    pub fn sample(&self) -> Result<ProcessStats> {
        let usage = getrusage(UsageWho::RUSAGE_SELF)
            .map_err(|e| ModeldError::Other(format!("getrusage failed: {e}")))?;
        let cpu = usage.user_time().num_microseconds() + usage.system_time().num_microseconds();
        let now = Instant::now();

        let cpu_percent = {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            let wall = now.duration_since(last.0).as_micros() as f64;
            let used = (cpu - last.1).max(0) as f64;
            *last = (now, cpu);
            if wall > 0.0 {
                used / wall * 100.0
            } else {
                0.0
            }
        };

        let (disk_total_bytes, disk_available_bytes) = disk_usage(&self.disk_path)?;

        Ok(ProcessStats {
            cpu_percent,
            cpu_time_secs: cpu as f64 / 1_000_000.0,
            peak_rss_kb: i64::from(usage.max_rss()),
            disk_total_bytes,
            disk_available_bytes,
        })
    }
}

fn cpu_micros() -> Result<i64> {
    let usage = getrusage(UsageWho::RUSAGE_SELF)
        .map_err(|e| ModeldError::Other(format!("getrusage failed: {e}")))?;
    Ok(usage.user_time().num_microseconds() + usage.system_time().num_microseconds())
}

#[allow(clippy::useless_conversion)]
fn disk_usage(path: &Path) -> Result<(u64, u64)> {
    let stats = nix::sys::statvfs::statvfs(path)
        .map_err(|e| ModeldError::Other(format!("Failed to check disk space: {e}")))?;
    let fragment = u64::from(stats.fragment_size());
    Ok((
        u64::from(stats.blocks()) * fragment,
        u64::from(stats.blocks_available()) * fragment,
    ))
}
