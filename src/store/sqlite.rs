//! SQLite-backed implementation of [`JobStore`].
//!
//! Adapted from the reference crate's PostgreSQL store: the query shapes
//! (batched status fetch, upsert-by-primary-key) are the same, but SQLite
//! has no `FOR UPDATE SKIP LOCKED` and no typed array binding, so claim-style
//! row locking is not attempted here — the queue manager's own async mutex
//! (§4.5.3) is the sole source of dequeue atomicity, and the store only ever
//! sees single-row reads/writes under that lock.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{now, ClusterRow, Job, JobStatus, JobStore, QueueRow, SchedulerMetrics, StoreError};

/// SQLite-backed job store, opened in WAL journal mode so the scheduling
/// loop's reads are never blocked by a completion callback's write.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    work_dir TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL CHECK (status IN ('pending','queued','running','completed','failed','cancelled','unknown')),
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    runner_type TEXT NOT NULL,
    cluster_id TEXT,
    input TEXT,
    final_energy REAL,
    key_results_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

CREATE TABLE IF NOT EXISTS queue_state (
    job_id TEXT PRIMARY KEY REFERENCES jobs(id),
    priority INTEGER NOT NULL,
    enqueued_at TEXT NOT NULL,
    dependencies_json TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    runner_type TEXT NOT NULL,
    cluster_id TEXT,
    user_id TEXT,
    resources_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cluster_state (
    cluster_id TEXT PRIMARY KEY,
    max_concurrent_jobs INTEGER NOT NULL,
    paused INTEGER NOT NULL,
    available_resources_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scheduler_metrics (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    scheduled_count INTEGER NOT NULL,
    completed_count INTEGER NOT NULL,
    failed_count INTEGER NOT NULL,
    retried_count INTEGER NOT NULL,
    avg_wait_seconds REAL NOT NULL,
    queue_depth_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

impl SqliteJobStore {
    /// Opens (creating if absent) the database file at `path` and applies
    /// the schema. `path` of `:memory:` is accepted for tests that still
    /// want to exercise the SQL path rather than [`super::InMemoryJobStore`].
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        // ensure the metrics singleton exists
        sqlx::query(
            "INSERT OR IGNORE INTO scheduler_metrics
             (id, scheduled_count, completed_count, failed_count, retried_count, avg_wait_seconds, queue_depth_json, updated_at)
             VALUES (0, 0, 0, 0, 0, 0.0, '{}', ?)",
        )
        .bind(now().to_rfc3339())
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job, StoreError> {
        let status: String = row.try_get("status")?;
        let key_results_json: Option<String> = row.try_get("key_results_json")?;
        Ok(Job {
            id: Uuid::parse_str(row.try_get::<String, _>("id")?.as_str())
                .map_err(|e| StoreError::Database(e.to_string()))?,
            name: row.try_get("name")?,
            work_dir: row.try_get("work_dir")?,
            status: JobStatus::from_str(&status)?,
            created_at: parse_ts(row.try_get("created_at")?)?,
            started_at: row
                .try_get::<Option<String>, _>("started_at")?
                .map(parse_ts)
                .transpose()?,
            completed_at: row
                .try_get::<Option<String>, _>("completed_at")?
                .map(parse_ts)
                .transpose()?,
            runner_type: row.try_get("runner_type")?,
            cluster_id: row.try_get("cluster_id")?,
            input: row.try_get("input")?,
            final_energy: row.try_get("final_energy")?,
            key_results: key_results_json
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| StoreError::Database(e.to_string()))?,
        })
    }
}

fn parse_ts(s: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(e.to_string()))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(
        &self,
        name: &str,
        work_dir: &str,
        runner_type: &str,
        cluster_id: Option<&str>,
        input: Option<&str>,
    ) -> Result<Job, StoreError> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM jobs WHERE work_dir = ?")
                .bind(work_dir)
                .fetch_optional(&self.pool)
                .await?;
        if existing.is_some() {
            return Err(StoreError::DuplicateWorkDir(work_dir.to_string()));
        }

        let job = Job {
            id: Uuid::now_v7(),
            name: name.to_string(),
            work_dir: work_dir.to_string(),
            status: JobStatus::Pending,
            created_at: now(),
            started_at: None,
            completed_at: None,
            runner_type: runner_type.to_string(),
            cluster_id: cluster_id.map(|s| s.to_string()),
            input: input.map(|s| s.to_string()),
            final_energy: None,
            key_results: None,
        };

        sqlx::query(
            "INSERT INTO jobs (id, name, work_dir, status, created_at, runner_type, cluster_id, input)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(&job.work_dir)
        .bind(job.status.to_string())
        .bind(job.created_at.to_rfc3339())
        .bind(&job.runner_type)
        .bind(&job.cluster_id)
        .bind(&job.input)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        Self::row_to_job(&row)
    }

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let job = self.get_job(job_id).await?;
        let (started_at, completed_at) = match status {
            JobStatus::Running if job.started_at.is_none() => (Some(now()), job.completed_at),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                (job.started_at, Some(now()))
            }
            _ => (job.started_at, job.completed_at),
        };

        sqlx::query(
            "UPDATE jobs SET status = ?, started_at = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(started_at.map(|d| d.to_rfc3339()))
        .bind(completed_at.map(|d| d.to_rfc3339()))
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_results(
        &self,
        job_id: Uuid,
        final_energy: Option<f64>,
        key_results: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let job = self.get_job(job_id).await?;
        let final_energy = final_energy.or(job.final_energy);
        let key_results_json = key_results
            .or(job.key_results)
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query("UPDATE jobs SET final_energy = ?, key_results_json = ? WHERE id = ?")
            .bind(final_energy)
            .bind(key_results_json)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_job_statuses_batch(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, JobStatus>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        // SQLite has no typed array binding; build a placeholder list instead
        // of falling back to one query per id.
        let placeholders = std::iter::repeat("?")
            .take(ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!("SELECT id, status FROM jobs WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let id_str: String = row.try_get("id")?;
            let status_str: String = row.try_get("status")?;
            let id = Uuid::parse_str(&id_str).map_err(|e| StoreError::Database(e.to_string()))?;
            out.insert(id, JobStatus::from_str(&status_str)?);
        }
        Ok(out)
    }

    async fn upsert_queue_row(&self, row: &QueueRow) -> Result<(), StoreError> {
        let deps_json = serde_json::to_string(&row.dependencies)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let resources_json = serde_json::to_string(&row.resources)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO queue_state
                (job_id, priority, enqueued_at, dependencies_json, retry_count, max_retries, runner_type, cluster_id, user_id, resources_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(job_id) DO UPDATE SET
                priority = excluded.priority,
                enqueued_at = excluded.enqueued_at,
                dependencies_json = excluded.dependencies_json,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries,
                runner_type = excluded.runner_type,
                cluster_id = excluded.cluster_id,
                user_id = excluded.user_id,
                resources_json = excluded.resources_json",
        )
        .bind(row.job_id.to_string())
        .bind(row.priority as i64)
        .bind(row.enqueued_at.to_rfc3339())
        .bind(deps_json)
        .bind(row.retry_count as i64)
        .bind(row.max_retries as i64)
        .bind(&row.runner_type)
        .bind(&row.cluster_id)
        .bind(&row.submitter_id)
        .bind(resources_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_queue_row(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue_state WHERE job_id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_cluster_row(&self, row: &ClusterRow) -> Result<(), StoreError> {
        let resources_json = serde_json::to_string(&row.available_resources)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO cluster_state (cluster_id, max_concurrent_jobs, paused, available_resources_json)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(cluster_id) DO UPDATE SET
                max_concurrent_jobs = excluded.max_concurrent_jobs,
                paused = excluded.paused,
                available_resources_json = excluded.available_resources_json",
        )
        .bind(&row.cluster_id)
        .bind(row.max_concurrent_jobs as i64)
        .bind(row.paused as i64)
        .bind(resources_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_all_queue_rows(&self) -> Result<Vec<QueueRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM queue_state")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let job_id: String = row.try_get("job_id")?;
                let deps_json: String = row.try_get("dependencies_json")?;
                let resources_json: String = row.try_get("resources_json")?;
                Ok(QueueRow {
                    job_id: Uuid::parse_str(&job_id)
                        .map_err(|e| StoreError::Database(e.to_string()))?,
                    priority: row.try_get::<i64, _>("priority")? as u8,
                    enqueued_at: parse_ts(row.try_get("enqueued_at")?)?,
                    dependencies: serde_json::from_str(&deps_json)
                        .map_err(|e| StoreError::Database(e.to_string()))?,
                    retry_count: row.try_get::<i64, _>("retry_count")? as u32,
                    max_retries: row.try_get::<i64, _>("max_retries")? as u32,
                    runner_type: row.try_get("runner_type")?,
                    cluster_id: row.try_get("cluster_id")?,
                    submitter_id: row.try_get("user_id")?,
                    resources: serde_json::from_str(&resources_json)
                        .map_err(|e| StoreError::Database(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn load_all_cluster_rows(&self) -> Result<Vec<ClusterRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM cluster_state")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let resources_json: String = row.try_get("available_resources_json")?;
                Ok(ClusterRow {
                    cluster_id: row.try_get("cluster_id")?,
                    max_concurrent_jobs: row.try_get::<i64, _>("max_concurrent_jobs")? as u32,
                    paused: row.try_get::<i64, _>("paused")? != 0,
                    available_resources: serde_json::from_str(&resources_json)
                        .map_err(|e| StoreError::Database(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn load_metrics(&self) -> Result<SchedulerMetrics, StoreError> {
        let row = sqlx::query("SELECT * FROM scheduler_metrics WHERE id = 0")
            .fetch_one(&self.pool)
            .await?;
        let queue_depth_json: String = row.try_get("queue_depth_json")?;

        Ok(SchedulerMetrics {
            scheduled_count: row.try_get::<i64, _>("scheduled_count")? as u64,
            completed_count: row.try_get::<i64, _>("completed_count")? as u64,
            failed_count: row.try_get::<i64, _>("failed_count")? as u64,
            retried_count: row.try_get::<i64, _>("retried_count")? as u64,
            avg_wait_seconds: row.try_get("avg_wait_seconds")?,
            queue_depth_by_cluster: serde_json::from_str(&queue_depth_json)
                .map_err(|e| StoreError::Database(e.to_string()))?,
            updated_at: parse_ts(row.try_get("updated_at")?)?,
        })
    }

    async fn save_metrics(&self, metrics: &SchedulerMetrics) -> Result<(), StoreError> {
        let queue_depth_json = serde_json::to_string(&metrics.queue_depth_by_cluster)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            "UPDATE scheduler_metrics SET
                scheduled_count = ?, completed_count = ?, failed_count = ?, retried_count = ?,
                avg_wait_seconds = ?, queue_depth_json = ?, updated_at = ?
             WHERE id = 0",
        )
        .bind(metrics.scheduled_count as i64)
        .bind(metrics.completed_count as i64)
        .bind(metrics.failed_count as i64)
        .bind(metrics.retried_count as i64)
        .bind(metrics.avg_wait_seconds)
        .bind(queue_depth_json)
        .bind(metrics.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_running_with_queue_row(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            "SELECT j.id FROM jobs j
             INNER JOIN queue_state q ON q.job_id = j.id
             WHERE j.status = 'running'",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                Uuid::parse_str(&id).map_err(|e| StoreError::Database(e.to_string()))
            })
            .collect()
    }
}
