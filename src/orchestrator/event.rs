//! Lifecycle events emitted by the orchestrator (§4.6.8). All carry the
//! workflow id and a timestamp; node-scoped events additionally carry the
//! node id, job id, and a policy-specific payload. Delivered to a single
//! observer callback; a broken callback must not destabilize orchestration
//! (§4.6.8), so delivery failures are only logged, never propagated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    WorkflowStarted {
        workflow_id: Uuid,
        at: DateTime<Utc>,
    },
    NodeStarted {
        workflow_id: Uuid,
        node_id: String,
        job_id: Uuid,
        at: DateTime<Utc>,
    },
    NodeCompleted {
        workflow_id: Uuid,
        node_id: String,
        job_id: Uuid,
        results: serde_json::Value,
        at: DateTime<Utc>,
    },
    NodeFailed {
        workflow_id: Uuid,
        node_id: String,
        job_id: Option<Uuid>,
        policy: crate::orchestrator::FailurePolicy,
        retry_count: u32,
        error: String,
        at: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_id: Uuid,
        completed_nodes: usize,
        failed_nodes: usize,
        at: DateTime<Utc>,
    },
    WorkflowFailed {
        workflow_id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    },
    WorkflowCancelled {
        workflow_id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// A single callback slot delivering events to any observer (§4.6.8,
/// §6 "Event sink"). Callers are responsible for transporting events
/// onward (to a UI, a log sink, a message bus).
pub type EventSink = std::sync::Arc<dyn Fn(OrchestratorEvent) + Send + Sync>;
