//! The queue manager (C5, §4.5): a priority queue per runner type,
//! dependency gating, per-cluster concurrency caps, retries, crash recovery,
//! and the ~1s scheduling loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::error::QueueError;
use super::score;
use super::types::{ClusterState, Inner, JobCallback, QueueStatusFilter, QueueStatusSnapshot, ScoredJob};
use crate::graph::assert_acyclic_with_addition;
use crate::runner::{Runner, RunnerStatus};
use crate::store::{ClusterRow, JobStatus, JobStore, QueueRow};

/// Tuning knobs that don't belong in the per-call API.
#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    pub tick_interval: Duration,
    pub fair_share_enabled: bool,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            fair_share_enabled: true,
        }
    }
}

pub struct QueueManager {
    store: Arc<dyn JobStore>,
    runners: HashMap<String, Arc<dyn Runner>>,
    inner: Mutex<Inner>,
    config: QueueManagerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Raw output text collected from each job's `Runner::output_stream`
    /// while it ran, held here until a caller (the orchestrator's result
    /// extraction, §4.6.6) claims it with `take_job_output`. Entries for
    /// jobs nobody ever asks about are simply dropped along with the map;
    /// this is a cache, not a store.
    output_cache: DashMap<Uuid, String>,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        runners: HashMap<String, Arc<dyn Runner>>,
        config: QueueManagerConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            store,
            runners,
            inner: Mutex::new(Inner::new()),
            config,
            shutdown_tx,
            shutdown_rx,
            loop_handle: std::sync::Mutex::new(None),
            output_cache: DashMap::new(),
        })
    }

    /// Removes and returns the raw output text collected for `job_id`, if
    /// any was captured. Consumes the entry: a second call for the same job
    /// returns `None`.
    pub async fn take_job_output(&self, job_id: Uuid) -> Option<String> {
        self.output_cache.remove(&job_id).map(|(_, v)| v)
    }

    /// Registers (or updates) a cluster's capacity record. Not itemized as
    /// its own verb in §4.5.1, but required plumbing: `enqueue`'s
    /// `cluster?` argument and the scheduling loop's capacity check both
    /// need a cluster record to exist before any job targets it.
    pub async fn register_cluster(&self, cluster: ClusterRow) -> Result<(), QueueError> {
        self.store.upsert_cluster_row(&cluster).await?;
        let mut inner = self.inner.lock().await;
        inner.clusters.insert(
            cluster.cluster_id.clone(),
            ClusterState {
                record: cluster,
                running: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Runs recovery (§4.5.5) then starts the background scheduling loop.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), QueueError> {
        {
            let guard = self.loop_handle.lock().unwrap();
            if guard.is_some() {
                return Err(QueueError::AlreadyRunning);
            }
        }

        self.recover().await?;

        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let tick_interval = self.config.tick_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick_interval) => {
                        if let Err(err) = this.tick().await {
                            warn!(error = %err, "scheduling tick failed, continuing on next interval");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("queue manager scheduling loop stopped");
        });
        *self.loop_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Cooperatively cancels the scheduling loop and flushes metrics
    /// (§4.5.6 shutdown).
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let metrics = self.inner.lock().await.metrics.clone();
        if let Err(err) = self.store.save_metrics(&metrics).await {
            warn!(error = %err, "final metrics persistence pass failed");
        }
    }

    /// §4.5.5 crash recovery: requeues orphaned `Running` jobs, reloads
    /// queue rows and cluster state from the store.
    #[instrument(skip(self))]
    async fn recover(&self) -> Result<(), QueueError> {
        let orphaned = self.store.find_running_with_queue_row().await?;
        for job_id in &orphaned {
            self.store.update_status(*job_id, JobStatus::Queued).await?;
            info!(job_id = %job_id, "reset orphaned running job to queued after restart");
        }

        let rows = self.store.load_all_queue_rows().await?;
        let clusters = self.store.load_all_cluster_rows().await?;
        let metrics = self.store.load_metrics().await?;

        // Single batched status fetch for every row, not one query per row
        // (§9 "N+1 database queries").
        let row_ids: Vec<Uuid> = rows.iter().map(|r| r.job_id).collect();
        let statuses = self.store.get_job_statuses_batch(&row_ids).await?;

        let mut inner = self.inner.lock().await;
        inner.queue_rows.clear();
        inner.dependents.clear();
        for row in rows {
            if matches!(
                statuses.get(&row.job_id),
                Some(JobStatus::Pending) | Some(JobStatus::Queued)
            ) {
                for dep in &row.dependencies {
                    inner.dependents.entry(*dep).or_default().insert(row.job_id);
                }
                inner.queue_rows.insert(row.job_id, row);
            }
        }
        inner.clusters = clusters
            .into_iter()
            .map(|c| {
                (
                    c.cluster_id.clone(),
                    ClusterState {
                        record: c,
                        running: HashSet::new(),
                    },
                )
            })
            .collect();
        inner.metrics = metrics;
        Ok(())
    }

    /// Validates and admits a job into the queue (§4.5.1).
    #[instrument(skip(self, resources))]
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        job_id: Uuid,
        priority: u8,
        deps: Vec<Uuid>,
        runner_type: impl Into<String>,
        cluster_id: Option<String>,
        submitter_id: Option<String>,
        max_retries: u32,
        resources: HashMap<String, serde_json::Value>,
    ) -> Result<(), QueueError> {
        self.store
            .get_job(job_id)
            .await
            .map_err(|_| QueueError::InvalidJob(job_id))?;
        for dep in &deps {
            self.store
                .get_job(*dep)
                .await
                .map_err(|_| QueueError::InvalidJob(*dep))?;
        }

        let priority = priority.min(4);
        let row = QueueRow {
            job_id,
            priority,
            enqueued_at: Utc::now(),
            dependencies: deps.clone(),
            retry_count: 0,
            max_retries,
            runner_type: runner_type.into(),
            cluster_id,
            submitter_id,
            resources,
        };

        let mut inner = self.inner.lock().await;
        let existing_graph: HashMap<Uuid, Vec<Uuid>> = inner
            .queue_rows
            .values()
            .map(|r| (r.job_id, r.dependencies.clone()))
            .collect();
        assert_acyclic_with_addition(
            &existing_graph,
            job_id,
            deps.clone(),
            format!("enqueue {job_id}"),
        )?;

        self.store.upsert_queue_row(&row).await?;
        self.store.update_status(job_id, JobStatus::Queued).await?;

        for dep in &deps {
            inner.dependents.entry(*dep).or_default().insert(job_id);
        }
        inner.queue_rows.insert(job_id, row);
        Ok(())
    }

    /// Computes the current scheduling order (§4.5.2). Exposed directly so
    /// tests and observers can inspect it without side effects; `dequeue`
    /// calls this and then commits the top match.
    pub async fn schedule_jobs(&self) -> Result<Vec<ScoredJob>, QueueError> {
        let (rows, clusters, last_scheduled) = {
            let inner = self.inner.lock().await;
            (
                inner.queue_rows.clone(),
                inner
                    .clusters
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
                inner.last_scheduled.clone(),
            )
        };

        let mut ids: HashSet<Uuid> = HashSet::new();
        for row in rows.values() {
            ids.insert(row.job_id);
            ids.extend(row.dependencies.iter().copied());
        }
        let id_vec: Vec<Uuid> = ids.into_iter().collect();
        let statuses = self.store.get_job_statuses_batch(&id_vec).await?;

        let now = Utc::now();
        let mut eligible = Vec::new();
        for row in rows.values() {
            if !matches!(
                statuses.get(&row.job_id),
                Some(JobStatus::Pending) | Some(JobStatus::Queued)
            ) {
                continue;
            }
            let deps_ready = row
                .dependencies
                .iter()
                .all(|d| matches!(statuses.get(d), Some(JobStatus::Completed)));
            if !deps_ready {
                continue;
            }
            if let Some(cluster_id) = &row.cluster_id {
                let Some(cluster) = clusters.get(cluster_id) else {
                    continue;
                };
                if !cluster.has_capacity() {
                    continue;
                }
                if !resources_fit(&row.resources, &cluster.record.available_resources) {
                    continue;
                }
            }

            let last = row
                .submitter_id
                .as_ref()
                .and_then(|s| last_scheduled.get(s))
                .copied();
            let sc = score::score(row, now, self.config.fair_share_enabled, last);
            eligible.push(ScoredJob {
                row: row.clone(),
                score: sc,
            });
        }

        eligible.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(eligible)
    }

    /// Atomically selects and dispatches the highest-scoring ready job for
    /// `runner_type` (§4.5.2, §5 ordering guarantees).
    #[instrument(skip(self))]
    pub async fn dequeue(&self, runner_type: &str) -> Result<Option<Uuid>, QueueError> {
        let ordered = self.schedule_jobs().await?;
        let Some(candidate) = ordered.into_iter().find(|c| c.row.runner_type == runner_type)
        else {
            return Ok(None);
        };

        let mut inner = self.inner.lock().await;
        // Re-validate under the lock: state may have shifted since the
        // lock-free scoring pass above.
        if !inner.queue_rows.contains_key(&candidate.row.job_id) {
            return Ok(None);
        }
        if let Some(cluster_id) = &candidate.row.cluster_id {
            match inner.clusters.get(cluster_id) {
                Some(cluster) if cluster.has_capacity() => {}
                _ => return Ok(None),
            }
        }

        self.store
            .update_status(candidate.row.job_id, JobStatus::Running)
            .await?;

        if let Some(cluster_id) = &candidate.row.cluster_id {
            if let Some(cluster) = inner.clusters.get_mut(cluster_id) {
                cluster.running.insert(candidate.row.job_id);
            }
        }
        inner.running.insert(candidate.row.job_id);
        if let Some(submitter) = &candidate.row.submitter_id {
            inner.last_scheduled.insert(submitter.clone(), Utc::now());
        }
        let wait_seconds = (Utc::now() - candidate.row.enqueued_at).num_seconds().max(0) as f64;
        inner.metrics.record_wait(wait_seconds);
        inner.metrics.scheduled_count += 1;

        Ok(Some(candidate.row.job_id))
    }

    /// Handles a terminal runner outcome for `job_id` (§4.5.1, §4.5.4).
    /// Idempotent: a second call for a job no longer in any cluster's
    /// running set is a no-op, satisfying the "exactly once" callback law.
    #[instrument(skip(self))]
    pub async fn handle_job_completion(&self, job_id: Uuid, success: bool) -> Result<(), QueueError> {
        let mut terminal_outcome: Option<bool> = None;
        {
            let mut inner = self.inner.lock().await;
            if !job_is_running(&inner, job_id) {
                return Ok(());
            }
            release_running_slot(&mut inner, job_id);

            if success {
                inner.queue_rows.remove(&job_id);
                self.store.delete_queue_row(job_id).await?;
                self.store.update_status(job_id, JobStatus::Completed).await?;
                inner.metrics.completed_count += 1;
                terminal_outcome = Some(true);
            } else {
                let retry_eligible = inner
                    .queue_rows
                    .get(&job_id)
                    .map(|r| r.retry_count < r.max_retries)
                    .unwrap_or(false);

                if retry_eligible {
                    // Not terminal: the job goes back to `Queued` with the
                    // same priority/enqueue timestamp. Its callback stays
                    // registered for the eventual terminal outcome.
                    let row = inner.queue_rows.get_mut(&job_id).unwrap();
                    row.retry_count += 1;
                    let row_clone = row.clone();
                    self.store.upsert_queue_row(&row_clone).await?;
                    self.store.update_status(job_id, JobStatus::Queued).await?;
                    inner.metrics.retried_count += 1;
                } else {
                    inner.queue_rows.remove(&job_id);
                    self.store.delete_queue_row(job_id).await?;
                    self.store.update_status(job_id, JobStatus::Failed).await?;
                    inner.metrics.failed_count += 1;
                    self.fail_dependents(&mut inner, job_id).await?;
                    terminal_outcome = Some(false);
                }
            }

            if let Some(outcome) = terminal_outcome {
                if let Some(cb) = inner.callbacks.remove(&job_id) {
                    inner.fired_callbacks.insert(job_id);
                    drop(inner);
                    cb(job_id, outcome).await;
                }
                return Ok(());
            }
        }
        Ok(())
    }

    /// Transitively fails every job that (directly or indirectly) lists
    /// `job_id` as a dependency, since it can now never become `Completed`
    /// (§4.5.4).
    async fn fail_dependents(&self, inner: &mut Inner, job_id: Uuid) -> Result<(), QueueError> {
        let mut queue = vec![job_id];
        let mut visited = HashSet::new();
        while let Some(current) = queue.pop() {
            let Some(dependents) = inner.dependents.remove(&current) else {
                continue;
            };
            for dep in dependents {
                if !visited.insert(dep) {
                    continue;
                }
                if inner.queue_rows.remove(&dep).is_some() {
                    self.store.delete_queue_row(dep).await?;
                    self.store.update_status(dep, JobStatus::Failed).await?;
                    inner.metrics.failed_count += 1;
                    if let Some(cb) = inner.callbacks.remove(&dep) {
                        inner.fired_callbacks.insert(dep);
                        cb(dep, false).await;
                    }
                }
                queue.push(dep);
            }
        }
        Ok(())
    }

    /// Cancels a queued or running job (§4.5.1). Returns `true` iff a
    /// queued-or-running job was actually cancelled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let was_queued = inner.queue_rows.remove(&job_id).is_some();
        let was_running = job_is_running(&inner, job_id);
        if was_running {
            release_running_slot(&mut inner, job_id);
        }

        if was_queued || was_running {
            self.store.delete_queue_row(job_id).await?;
            self.store.update_status(job_id, JobStatus::Cancelled).await?;
        }

        // Remove job_id from every other row's dependency set so those jobs
        // can still become eligible even though this one never completed.
        let mut touched = Vec::new();
        for row in inner.queue_rows.values_mut() {
            if let Some(pos) = row.dependencies.iter().position(|d| *d == job_id) {
                row.dependencies.remove(pos);
                touched.push(row.clone());
            }
        }
        for row in &touched {
            self.store.upsert_queue_row(row).await?;
        }
        inner.dependents.remove(&job_id);

        if was_queued || was_running {
            if let Some(cb) = inner.callbacks.remove(&job_id) {
                inner.fired_callbacks.insert(job_id);
                drop(inner);
                cb(job_id, false).await;
            }
        }

        Ok(was_queued || was_running)
    }

    pub async fn pause_queue(&self, cluster_id: &str) -> Result<(), QueueError> {
        self.set_paused(cluster_id, true).await
    }

    pub async fn resume_queue(&self, cluster_id: &str) -> Result<(), QueueError> {
        self.set_paused(cluster_id, false).await
    }

    async fn set_paused(&self, cluster_id: &str, paused: bool) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let cluster = inner
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| QueueError::UnknownCluster(cluster_id.to_string()))?;
        cluster.record.paused = paused;
        let record = cluster.record.clone();
        self.store.upsert_cluster_row(&record).await
    }

    /// Reprioritizes a still-queued job (§4.5.1).
    pub async fn reorder(&self, job_id: Uuid, new_priority: u8) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .queue_rows
            .get_mut(&job_id)
            .ok_or(QueueError::InvalidJob(job_id))?;
        row.priority = new_priority.min(4);
        let row_clone = row.clone();
        self.store.upsert_queue_row(&row_clone).await
    }

    /// Registers a completion callback, invoked exactly once when `job_id`
    /// reaches a terminal state.
    pub async fn register_callback(&self, job_id: Uuid, callback: JobCallback) {
        self.inner.lock().await.callbacks.insert(job_id, callback);
    }

    /// Observational snapshot (§4.5.1): never blocks scheduling.
    pub async fn get_queue_status(&self, filter: Option<QueueStatusFilter>) -> QueueStatusSnapshot {
        let inner = self.inner.lock().await;
        let rows: Vec<QueueRow> = inner
            .queue_rows
            .values()
            .filter(|r| match &filter {
                Some(f) => {
                    f.runner_type.as_deref().map_or(true, |rt| rt == r.runner_type)
                        && f.cluster_id
                            .as_deref()
                            .map_or(true, |cid| r.cluster_id.as_deref() == Some(cid))
                }
                None => true,
            })
            .cloned()
            .collect();
        let running_by_cluster = inner
            .clusters
            .iter()
            .map(|(id, c)| (id.clone(), c.running.len()))
            .collect();
        QueueStatusSnapshot {
            rows,
            running_by_cluster,
            metrics: inner.metrics.clone(),
        }
    }

    /// One scheduling + dispatch pass, invoked by the background loop and
    /// directly by tests that want deterministic control over timing.
    #[instrument(skip(self))]
    pub async fn tick(self: &Arc<Self>) -> Result<(), QueueError> {
        for runner_type in self.runners.keys().cloned().collect::<Vec<_>>() {
            while let Some(job_id) = self.dequeue(&runner_type).await? {
                self.dispatch(job_id, runner_type.clone());
            }
        }
        let metrics = self.inner.lock().await.metrics.clone();
        self.store.save_metrics(&metrics).await?;
        Ok(())
    }

    /// Spawns the short-lived task that submits a dequeued job to its
    /// runner, watches it to a terminal state, and reports that outcome
    /// back through `handle_job_completion` (§5: "additional short-lived
    /// tasks for each job's runner interaction").
    fn dispatch(self: &Arc<Self>, job_id: Uuid, runner_type: String) {
        let Some(runner) = self.runners.get(&runner_type).cloned() else {
            warn!(job_id = %job_id, runner_type, "no runner registered for type; leaving job running");
            return;
        };
        let manager = Arc::clone(self);
        let poll_interval = self.config.tick_interval;
        tokio::spawn(dispatch_job(job_id, runner, manager, poll_interval));
    }
}

/// Free function (rather than a method capturing `&self`) purely so the
/// borrow checker sees `manager` as an owned `Arc` moved into the spawned
/// task rather than a borrow tied to the caller's stack frame. Reports the
/// runner's terminal outcome back to the manager it came from so retries,
/// metrics, and completion callbacks all still go through
/// `handle_job_completion`.
async fn dispatch_job(
    job_id: Uuid,
    runner: Arc<dyn Runner>,
    manager: Arc<QueueManager>,
    poll_interval: Duration,
) {
    let job = match manager.store.get_job(job_id).await {
        Ok(j) => j,
        Err(err) => {
            warn!(job_id = %job_id, error = %err, "could not load job for dispatch");
            return;
        }
    };

    let input_file = job.input.clone().unwrap_or_default();
    let handle = match runner.submit(job_id, &input_file, &job.work_dir, None).await {
        Ok(h) => h,
        Err(err) => {
            warn!(job_id = %job_id, error = %err, "runner submission failed");
            if let Err(err) = manager.handle_job_completion(job_id, false).await {
                warn!(job_id = %job_id, error = %err, "failed to report submission failure to queue manager");
            }
            return;
        }
    };

    // Drain the runner's output stream concurrently with polling for a
    // terminal status; §4.3 documents that the stream terminates once the
    // job reaches one, so this finishes no later than the poll loop below.
    // The orchestrator's built-in extractors (§4.6.6) need this text rather
    // than a work-directory re-read.
    if let Ok(mut output_stream) = runner.output_stream(&handle).await {
        let mut output = String::new();
        while let Some(chunk) = output_stream.next().await {
            output.push_str(&chunk);
            output.push('\n');
        }
        if !output.is_empty() {
            manager.output_cache.insert(job_id, output);
        }
    }

    let success = loop {
        match runner.status(&handle).await {
            Ok(RunnerStatus::Completed) => {
                let _ = runner.retrieve_results(&handle, &job.work_dir, false).await;
                break true;
            }
            Ok(RunnerStatus::Failed | RunnerStatus::Cancelled) => break false,
            Ok(_) => tokio::time::sleep(poll_interval).await,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "transient runner status error");
                tokio::time::sleep(poll_interval).await;
            }
        }
    };

    if let Err(err) = manager.handle_job_completion(job_id, success).await {
        warn!(job_id = %job_id, error = %err, "failed to report terminal outcome to queue manager");
    }
}

fn job_is_running(inner: &Inner, job_id: Uuid) -> bool {
    inner.running.contains(&job_id)
}

fn release_running_slot(inner: &mut Inner, job_id: Uuid) {
    inner.running.remove(&job_id);
    for cluster in inner.clusters.values_mut() {
        cluster.running.remove(&job_id);
    }
}

fn resources_fit(
    requested: &HashMap<String, serde_json::Value>,
    available: &HashMap<String, serde_json::Value>,
) -> bool {
    for (key, want) in requested {
        let Some(have) = available.get(key) else {
            return false;
        };
        if let (Some(want_n), Some(have_n)) = (want.as_f64(), have.as_f64()) {
            if want_n > have_n {
                return false;
            }
        }
    }
    true
}
