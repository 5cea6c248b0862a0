//! In-memory implementation of [`JobStore`], used by the test harness and by
//! any embedding that does not need persistence across restarts.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{now, ClusterRow, Job, JobStatus, JobStore, QueueRow, SchedulerMetrics, StoreError};

/// In-memory store. Provides the same semantics as the SQLite-backed store
/// but with no durability across process restarts.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    work_dirs: RwLock<HashMap<String, Uuid>>,
    queue_rows: RwLock<HashMap<Uuid, QueueRow>>,
    clusters: RwLock<HashMap<String, ClusterRow>>,
    metrics: RwLock<SchedulerMetrics>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            work_dirs: RwLock::new(HashMap::new()),
            queue_rows: RwLock::new(HashMap::new()),
            clusters: RwLock::new(HashMap::new()),
            metrics: RwLock::new(SchedulerMetrics::default()),
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(
        &self,
        name: &str,
        work_dir: &str,
        runner_type: &str,
        cluster_id: Option<&str>,
        input: Option<&str>,
    ) -> Result<Job, StoreError> {
        let mut work_dirs = self.work_dirs.write();
        if work_dirs.contains_key(work_dir) {
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

        work_dirs.insert(work_dir.to_string(), job.id);
        self.jobs.write().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        job.status = status;
        match status {
            JobStatus::Running if job.started_at.is_none() => job.started_at = Some(now()),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                job.completed_at = Some(now())
            }
            _ => {}
        }
        Ok(())
    }

    async fn update_results(
        &self,
        job_id: Uuid,
        final_energy: Option<f64>,
        key_results: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        if final_energy.is_some() {
            job.final_energy = final_energy;
        }
        if key_results.is_some() {
            job.key_results = key_results;
        }
        Ok(())
    }

    async fn get_job_statuses_batch(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, JobStatus>, StoreError> {
        let jobs = self.jobs.read();
        Ok(ids
            .iter()
            .filter_map(|id| jobs.get(id).map(|j| (*id, j.status)))
            .collect())
    }

    async fn upsert_queue_row(&self, row: &QueueRow) -> Result<(), StoreError> {
        self.queue_rows.write().insert(row.job_id, row.clone());
        Ok(())
    }

    async fn delete_queue_row(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.queue_rows.write().remove(&job_id);
        Ok(())
    }

    async fn upsert_cluster_row(&self, row: &ClusterRow) -> Result<(), StoreError> {
        self.clusters
            .write()
            .insert(row.cluster_id.clone(), row.clone());
        Ok(())
    }

    async fn load_all_queue_rows(&self) -> Result<Vec<QueueRow>, StoreError> {
        Ok(self.queue_rows.read().values().cloned().collect())
    }

    async fn load_all_cluster_rows(&self) -> Result<Vec<ClusterRow>, StoreError> {
        Ok(self.clusters.read().values().cloned().collect())
    }

    async fn load_metrics(&self) -> Result<SchedulerMetrics, StoreError> {
        Ok(self.metrics.read().clone())
    }

    async fn save_metrics(&self, metrics: &SchedulerMetrics) -> Result<(), StoreError> {
        *self.metrics.write() = metrics.clone();
        Ok(())
    }

    async fn find_running_with_queue_row(&self) -> Result<Vec<Uuid>, StoreError> {
        let jobs = self.jobs.read();
        let queue_rows = self.queue_rows.read();
        Ok(queue_rows
            .keys()
            .filter(|id| {
                jobs.get(id)
                    .map(|j| j.status == JobStatus::Running)
                    .unwrap_or(false)
            })
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_job() {
        let store = InMemoryJobStore::new();
        let job = store
            .create_job("opt", "/scratch/a", "local", None, Some("input"))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        let fetched = store.get_job(job.id).await.unwrap();
        assert_eq!(fetched.work_dir, "/scratch/a");
    }

    #[tokio::test]
    async fn duplicate_work_dir_rejected() {
        let store = InMemoryJobStore::new();
        store
            .create_job("opt", "/scratch/a", "local", None, None)
            .await
            .unwrap();

        let result = store
            .create_job("opt2", "/scratch/a", "local", None, None)
            .await;
        assert!(matches!(result, Err(StoreError::DuplicateWorkDir(_))));
    }

    #[tokio::test]
    async fn status_transitions_set_timestamps() {
        let store = InMemoryJobStore::new();
        let job = store
            .create_job("opt", "/scratch/b", "local", None, None)
            .await
            .unwrap();

        store.update_status(job.id, JobStatus::Running).await.unwrap();
        let running = store.get_job(job.id).await.unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        store
            .update_status(job.id, JobStatus::Completed)
            .await
            .unwrap();
        let done = store.get_job(job.id).await.unwrap();
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn batch_status_fetch() {
        let store = InMemoryJobStore::new();
        let a = store
            .create_job("a", "/scratch/c", "local", None, None)
            .await
            .unwrap();
        let b = store
            .create_job("b", "/scratch/d", "local", None, None)
            .await
            .unwrap();

        let statuses = store.get_job_statuses_batch(&[a.id, b.id]).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[&a.id], JobStatus::Pending);
    }

    #[tokio::test]
    async fn crash_recovery_candidates() {
        let store = InMemoryJobStore::new();
        let job = store
            .create_job("opt", "/scratch/e", "local", None, None)
            .await
            .unwrap();
        store.update_status(job.id, JobStatus::Running).await.unwrap();
        store
            .upsert_queue_row(&QueueRow {
                job_id: job.id,
                priority: 2,
                enqueued_at: now(),
                dependencies: vec![],
                retry_count: 0,
                max_retries: 3,
                runner_type: "local".into(),
                cluster_id: None,
                submitter_id: None,
                resources: HashMap::new(),
            })
            .await
            .unwrap();

        let running = store.find_running_with_queue_row().await.unwrap();
        assert_eq!(running, vec![job.id]);
    }
}
