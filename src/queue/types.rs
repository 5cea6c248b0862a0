//! Supporting types for the queue manager's public contract (§4.5.1).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::{JobStatus, QueueRow};

/// A callback invoked exactly once when a job reaches a terminal state.
/// `bool` is the `success` flag passed to `handle_job_completion`.
pub type JobCallback =
    Arc<dyn Fn(Uuid, bool) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One row of the result of `schedule_jobs`: the queue row plus the
/// deterministic score that ordered it (§4.5.2).
#[derive(Debug, Clone)]
pub struct ScoredJob {
    pub row: QueueRow,
    pub score: f64,
}

/// Optional filter for `get_queue_status`. All fields are ANDed together;
/// `None` matches everything for that dimension.
#[derive(Debug, Clone, Default)]
pub struct QueueStatusFilter {
    pub runner_type: Option<String>,
    pub cluster_id: Option<String>,
}

/// Observational snapshot returned by `get_queue_status`. Never blocks
/// scheduling: built from a point-in-time clone of in-memory state.
#[derive(Debug, Clone)]
pub struct QueueStatusSnapshot {
    pub rows: Vec<QueueRow>,
    pub running_by_cluster: HashMap<String, usize>,
    pub metrics: crate::store::SchedulerMetrics,
}

/// Per-cluster capacity tracked alongside the persisted [`crate::store::ClusterRow`].
#[derive(Debug, Clone)]
pub(crate) struct ClusterState {
    pub record: crate::store::ClusterRow,
    pub running: std::collections::HashSet<Uuid>,
}

impl ClusterState {
    pub fn has_capacity(&self) -> bool {
        !self.record.paused && (self.running.len() as u32) < self.record.max_concurrent_jobs
    }
}

/// In-memory state guarded by the queue manager's single async mutex
/// (§4.5.3): queue rows, per-cluster running sets, the fair-share clock, the
/// dependents index, and the callback registry all live here together so a
/// scheduling pass and a completion callback can never observe a torn state.
pub(crate) struct Inner {
    pub queue_rows: HashMap<Uuid, QueueRow>,
    pub clusters: HashMap<String, ClusterState>,
    /// Every job currently dispatched (between `dequeue` and
    /// `handle_job_completion`), independent of cluster assignment. The
    /// per-cluster `running` sets in [`ClusterState`] exist only to bound
    /// concurrency; this set is the source of truth for "is this job
    /// already being processed", used to make `handle_job_completion` and
    /// `cancel` idempotent even for jobs with no cluster reference.
    pub running: std::collections::HashSet<Uuid>,
    pub metrics: crate::store::SchedulerMetrics,
    /// job_id -> set of job ids that list it as a dependency. Maintained
    /// incrementally on enqueue/cancel/completion so transitive-fail and
    /// cancel-removal never need a full scan.
    pub dependents: HashMap<Uuid, std::collections::HashSet<Uuid>>,
    /// submitter id -> last time a job of theirs was dequeued, for the
    /// fair-share bonus.
    pub last_scheduled: HashMap<String, DateTime<Utc>>,
    pub callbacks: HashMap<Uuid, JobCallback>,
    pub fired_callbacks: std::collections::HashSet<Uuid>,
}

impl Inner {
    pub fn new() -> Self {
        Self {
            queue_rows: HashMap::new(),
            clusters: HashMap::new(),
            running: std::collections::HashSet::new(),
            metrics: crate::store::SchedulerMetrics::default(),
            dependents: HashMap::new(),
            last_scheduled: HashMap::new(),
            callbacks: HashMap::new(),
            fired_callbacks: std::collections::HashSet::new(),
        }
    }
}

/// Batched statuses of every job a set of queue rows could possibly depend
/// on, keyed by job id. Used so a scheduling pass issues exactly one store
/// query regardless of row count (§9 "N+1 database queries").
pub(crate) type StatusMap = HashMap<Uuid, JobStatus>;
