//! Runner interface (§4.3): the narrow, uniform contract the core relies on
//! to submit, observe, cancel, and retrieve output for a DFT job, regardless
//! of whether the backend is a local subprocess, an SSH-reachable host, or a
//! SLURM batch queue. The core never constructs a backend; it is handed a
//! `Arc<dyn Runner>` per runner type at construction and treats all three
//! uniformly.
//!
//! Concrete backends (local process, SSH, SLURM batch) are external
//! collaborators and ship outside this crate. This module owns the trait,
//! the shared status/handle vocabulary, and a concurrency-gated mock used by
//! the queue manager's own test suite.

use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Lifecycle status as reported by a runner backend. Distinct from
/// [`crate::store::JobStatus`]: a runner never reports `Pending` (that is a
/// queue-manager-only state before dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

/// Opaque handle returned by `submit`. The core never inspects its contents;
/// it is round-tripped back into `status`/`cancel`/`output_stream`/
/// `retrieve_results`. Not retained across a process restart — see §4.5.5.
#[derive(Debug, Clone)]
pub struct RunnerHandle(pub String);

impl std::fmt::Display for RunnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("runner configuration error: {0}")]
    Configuration(String),

    #[error("connection to execution target failed: {0}")]
    Connection(String),

    #[error("resource request denied: {0}")]
    ResourceDenied(String),

    #[error("unknown runner handle: {0}")]
    UnknownHandle(String),
}

/// A line of output, yielded as the job produces it. The stream is finite
/// and terminates once the job reaches a terminal [`RunnerStatus`]; it is
/// non-restartable, matching §4.3.
pub type OutputStream = Pin<Box<dyn futures::Stream<Item = String> + Send>>;

/// The five-method capability of §4.3. Every backend additionally enforces
/// its own concurrency cap via a counted gate (`max_concurrent_jobs`
/// in-flight submissions); the core never assumes a runner is local,
/// networked, or batched, so that gating lives in the implementation, not
/// here.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn submit(
        &self,
        job_id: Uuid,
        input_file: &str,
        work_dir: &str,
        threads: Option<u32>,
    ) -> Result<RunnerHandle, RunnerError>;

    async fn status(&self, handle: &RunnerHandle) -> Result<RunnerStatus, RunnerError>;

    /// Returns `true` iff an active job was terminated; `false` if it was
    /// already terminal.
    async fn cancel(&self, handle: &RunnerHandle) -> Result<bool, RunnerError>;

    async fn output_stream(&self, handle: &RunnerHandle) -> Result<OutputStream, RunnerError>;

    /// Copies auxiliary output files into `dest`. May be a no-op when `dest`
    /// equals the job's own work directory.
    async fn retrieve_results(
        &self,
        handle: &RunnerHandle,
        dest: &str,
        cleanup: bool,
    ) -> Result<(), RunnerError>;
}

fn is_terminal(status: RunnerStatus) -> bool {
    matches!(
        status,
        RunnerStatus::Completed | RunnerStatus::Failed | RunnerStatus::Cancelled
    )
}

/// An in-process runner used by the queue manager's own test suite and by
/// any embedding that wants deterministic scheduling without touching a real
/// execution backend. Jobs transition to `Completed` immediately on submit;
/// callers that need to exercise `Running`/`Failed` paths can pre-seed
/// outcomes with [`MockRunner::set_outcome`].
pub struct MockRunner {
    gate: Arc<Semaphore>,
    outcomes: dashmap::DashMap<String, RunnerStatus>,
    /// Permits held for the lifetime of each in-flight job, not just for the
    /// duration of `submit` itself — a permit dropped when `submit` returns
    /// would let the gate never actually cap concurrency.
    permits: dashmap::DashMap<String, tokio::sync::OwnedSemaphorePermit>,
}

impl MockRunner {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            outcomes: dashmap::DashMap::new(),
            permits: dashmap::DashMap::new(),
        }
    }

    /// Pre-seeds the status a subsequent `submit` for this `job_id` should
    /// report, so tests can drive failure/retry paths deterministically.
    pub fn set_outcome(&self, job_id: Uuid, status: RunnerStatus) {
        self.outcomes.insert(job_id.to_string(), status);
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn submit(
        &self,
        job_id: Uuid,
        _input_file: &str,
        _work_dir: &str,
        _threads: Option<u32>,
    ) -> Result<RunnerHandle, RunnerError> {
        let permit = self
            .gate
            .clone()
            .try_acquire_owned()
            .map_err(|_| RunnerError::ResourceDenied("runner at capacity".into()))?;
        self.permits.insert(job_id.to_string(), permit);
        Ok(RunnerHandle(job_id.to_string()))
    }

    async fn status(&self, handle: &RunnerHandle) -> Result<RunnerStatus, RunnerError> {
        let status = self
            .outcomes
            .get(&handle.0)
            .map(|e| *e.value())
            .unwrap_or(RunnerStatus::Completed);
        if is_terminal(status) {
            self.permits.remove(&handle.0);
        }
        Ok(status)
    }

    async fn cancel(&self, handle: &RunnerHandle) -> Result<bool, RunnerError> {
        let was_active = !matches!(
            self.outcomes.get(&handle.0).map(|e| *e.value()),
            Some(RunnerStatus::Completed | RunnerStatus::Failed | RunnerStatus::Cancelled)
        );
        self.outcomes
            .insert(handle.0.clone(), RunnerStatus::Cancelled);
        self.permits.remove(&handle.0);
        Ok(was_active)
    }

    async fn output_stream(&self, _handle: &RunnerHandle) -> Result<OutputStream, RunnerError> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn retrieve_results(
        &self,
        _handle: &RunnerHandle,
        _dest: &str,
        _cleanup: bool,
    ) -> Result<(), RunnerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_runner_defaults_to_completed() {
        let runner = MockRunner::new(4);
        let job_id = Uuid::now_v7();
        let handle = runner.submit(job_id, "in", "/scratch", None).await.unwrap();
        assert_eq!(runner.status(&handle).await.unwrap(), RunnerStatus::Completed);
    }

    #[tokio::test]
    async fn mock_runner_honors_seeded_outcome() {
        let runner = MockRunner::new(4);
        let job_id = Uuid::now_v7();
        runner.set_outcome(job_id, RunnerStatus::Failed);
        let handle = runner.submit(job_id, "in", "/scratch", None).await.unwrap();
        assert_eq!(runner.status(&handle).await.unwrap(), RunnerStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_reports_whether_job_was_active() {
        let runner = MockRunner::new(4);
        let job_id = Uuid::now_v7();
        runner.set_outcome(job_id, RunnerStatus::Running);
        let handle = runner.submit(job_id, "in", "/scratch", None).await.unwrap();
        assert!(runner.cancel(&handle).await.unwrap());
        assert!(!runner.cancel(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn gate_denies_submission_over_capacity() {
        let runner = MockRunner::new(1);
        let job_a = Uuid::now_v7();
        let job_b = Uuid::now_v7();
        runner.set_outcome(job_a, RunnerStatus::Running);
        let _handle_a = runner.submit(job_a, "in", "/scratch", None).await.unwrap();
        let result = runner.submit(job_b, "in", "/scratch", None).await;
        assert!(matches!(result, Err(RunnerError::ResourceDenied(_))));
    }
}
