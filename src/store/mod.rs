//! Persistent store for jobs, queue rows, cluster capacity, and metrics.
//!
//! The store is the single source of truth the queue manager and the
//! orchestrator fall back on after a crash. Two implementations ship: an
//! in-memory store for tests, and a SQLite-backed store (WAL journal mode)
//! for a real embedded single-file deployment.

mod memory;
mod sqlite;
mod types;

pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use types::{ClusterRow, Job, JobStatus, QueueRow, SchedulerMetrics};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("work directory already in use: {0}")]
    DuplicateWorkDir(String),

    #[error("invalid status value: {0}")]
    InvalidStatus(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// The persistence boundary described in §4.1/§6: jobs, queue rows, cluster
/// rows, and a singleton metrics record. Every mutation commits before
/// returning; readers observe only committed state.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(
        &self,
        name: &str,
        work_dir: &str,
        runner_type: &str,
        cluster_id: Option<&str>,
        input: Option<&str>,
    ) -> Result<Job, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError>;

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError>;

    async fn update_results(
        &self,
        job_id: Uuid,
        final_energy: Option<f64>,
        key_results: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Batched status fetch for the scheduling loop's hot path — see §9
    /// "N+1 database queries": this must never be a query per job.
    async fn get_job_statuses_batch(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, JobStatus>, StoreError>;

    async fn upsert_queue_row(&self, row: &QueueRow) -> Result<(), StoreError>;

    async fn delete_queue_row(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn upsert_cluster_row(&self, row: &ClusterRow) -> Result<(), StoreError>;

    async fn load_all_queue_rows(&self) -> Result<Vec<QueueRow>, StoreError>;

    async fn load_all_cluster_rows(&self) -> Result<Vec<ClusterRow>, StoreError>;

    async fn load_metrics(&self) -> Result<SchedulerMetrics, StoreError>;

    async fn save_metrics(&self, metrics: &SchedulerMetrics) -> Result<(), StoreError>;

    /// All jobs currently `Running` with a surviving queue row — the set
    /// crash recovery resets back to `Queued`. See §4.5.5.
    async fn find_running_with_queue_row(&self) -> Result<Vec<Uuid>, StoreError>;
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}
