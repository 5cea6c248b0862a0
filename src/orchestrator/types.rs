//! Workflow and node data model (§3): workflows own their nodes; edges are
//! stored as an adjacency list keyed by node id, never as parent pointers —
//! predecessors are discovered through the inverse edge list computed on
//! demand (§9).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of work a node performs. `CALCULATION` is the only variant that
/// submits a job to the queue manager; the other three are modeled for
/// completeness but behave as pass-through/no-submit nodes in this core
/// (real transfer/condition/aggregation semantics are a collaborator
/// concern layered on top).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Calculation,
    DataTransfer,
    Condition,
    Aggregation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Per-node failure policy state machine (§4.6.7, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Retry,
    SkipDependents,
    Continue,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Validating,
    Valid,
    Invalid,
    Running,
    Paused,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

/// A single node in a workflow DAG (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub node_type: NodeType,
    pub input_template: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub dependencies: Vec<String>,
    pub failure_policy: FailurePolicy,
    pub max_retries: u32,
    pub retry_count: u32,
    pub extracted_results: HashMap<String, serde_json::Value>,
    pub status: NodeStatus,
    pub job_id: Option<Uuid>,
    pub output_parsers: Vec<String>,
    /// DFT-code tag and runner type carried through to the job submitted
    /// for this node; not itemized in §3's node fields but required to
    /// call `JobStore::create_job`/`QueueManager::enqueue` (§4.6.5).
    pub code_tag: String,
    pub runner_type: String,
    pub cluster_id: Option<String>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, node_type: NodeType, input_template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type,
            input_template: input_template.into(),
            parameters: HashMap::new(),
            dependencies: Vec::new(),
            failure_policy: FailurePolicy::Continue,
            max_retries: 0,
            retry_count: 0,
            extracted_results: HashMap::new(),
            status: NodeStatus::Pending,
            job_id: None,
            output_parsers: Vec::new(),
            code_tag: "crystal".to_string(),
            runner_type: "local".to_string(),
            cluster_id: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_parsers(mut self, parsers: Vec<String>) -> Self {
        self.output_parsers = parsers;
        self
    }

    pub fn with_parameters(mut self, params: HashMap<String, serde_json::Value>) -> Self {
        self.parameters = params;
        self
    }
}

/// Workflow definition (§3): the thing `register_workflow` validates and
/// stores. Serializable as a flat object so external collaborators can
/// persist it (§6 "Workflow persistence (optional)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub nodes: Vec<WorkflowNode>,
    pub global_parameters: HashMap<String, serde_json::Value>,
    pub default_failure_policy: FailurePolicy,
    pub status: WorkflowStatus,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, nodes: Vec<WorkflowNode>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            nodes,
            global_parameters: HashMap::new(),
            default_failure_policy: FailurePolicy::Continue,
            status: WorkflowStatus::Created,
        }
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Dependency adjacency: node id -> the ids it depends on. Built on
    /// demand; never cached as a second source of truth alongside `nodes`.
    pub fn dependency_graph(&self) -> HashMap<String, Vec<String>> {
        self.nodes
            .iter()
            .map(|n| (n.id.clone(), n.dependencies.clone()))
            .collect()
    }

    /// Inverse of `dependency_graph`: node id -> ids that depend on it.
    /// Computed on demand per §9 ("never use parent pointers").
    pub fn forward_edges(&self) -> HashMap<String, Vec<String>> {
        let mut forward: HashMap<String, Vec<String>> =
            self.nodes.iter().map(|n| (n.id.clone(), Vec::new())).collect();
        for node in &self.nodes {
            for dep in &node.dependencies {
                forward.entry(dep.clone()).or_default().push(node.id.clone());
            }
        }
        forward
    }
}

/// Runtime progress of a workflow, separate from its definition (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowState {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_nodes: HashSet<String>,
    pub failed_nodes: HashSet<String>,
    pub running_nodes: HashSet<String>,
    pub skipped_nodes: HashSet<String>,
}

impl WorkflowState {
    pub fn percent_progress(&self, total_nodes: usize) -> f64 {
        if total_nodes == 0 {
            return 100.0;
        }
        let done = self.completed_nodes.len() + self.failed_nodes.len() + self.skipped_nodes.len();
        (done as f64 / total_nodes as f64) * 100.0
    }
}

/// Snapshot returned by `get_workflow_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusSnapshot {
    pub definition: WorkflowDefinition,
    pub state: WorkflowState,
    pub percent_progress: f64,
}
