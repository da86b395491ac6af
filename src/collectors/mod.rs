pub mod system;
pub mod users;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// One delta-based reading of host-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_mbps: f64,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
}

/// Per-user aggregate over all processes owned by that account during
/// one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct UserSample {
    pub username: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub process_count: usize,
    pub pids: Vec<i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("unexpected format in {path}: {reason}")]
    Format { path: String, reason: String },
}

impl SampleError {
    pub(crate) fn read(path: impl Into<String>, source: std::io::Error) -> Self {
        SampleError::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn format(path: impl Into<String>, reason: impl Into<String>) -> Self {
        SampleError::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
