//! Shared record types persisted by the job store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a job record.
///
/// `Unknown` is reserved for runners that cannot currently classify a job
/// (e.g. a transient SSH disconnect) and is never set by the store itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = super::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "unknown" => Ok(Self::Unknown),
            other => Err(super::StoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// A single job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub work_dir: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub runner_type: String,
    pub cluster_id: Option<String>,
    pub input: Option<String>,
    pub final_energy: Option<f64>,
    pub key_results: Option<serde_json::Value>,
}

/// A queue row: exists iff the referenced job is `Pending` or `Queued`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRow {
    pub job_id: Uuid,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub dependencies: Vec<Uuid>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub runner_type: String,
    pub cluster_id: Option<String>,
    pub submitter_id: Option<String>,
    pub resources: HashMap<String, serde_json::Value>,
}

/// Per-cluster capacity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRow {
    pub cluster_id: String,
    pub max_concurrent_jobs: u32,
    pub paused: bool,
    pub available_resources: HashMap<String, serde_json::Value>,
}

/// Observational scheduler metrics. Never authoritative for control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub scheduled_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub retried_count: u64,
    pub avg_wait_seconds: f64,
    pub queue_depth_by_cluster: HashMap<String, u64>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self {
            scheduled_count: 0,
            completed_count: 0,
            failed_count: 0,
            retried_count: 0,
            avg_wait_seconds: 0.0,
            queue_depth_by_cluster: HashMap::new(),
            updated_at: Utc::now(),
        }
    }
}

impl SchedulerMetrics {
    /// Folds one observed wait time into the smoothed average using a fixed
    /// exponential weight. Mirrors a classic EWMA used for load metrics.
    pub fn record_wait(&mut self, wait_seconds: f64) {
        const ALPHA: f64 = 0.2;
        if self.scheduled_count == 0 {
            self.avg_wait_seconds = wait_seconds;
        } else {
            self.avg_wait_seconds = ALPHA * wait_seconds + (1.0 - ALPHA) * self.avg_wait_seconds;
        }
    }
}
