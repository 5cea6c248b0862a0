//! Workflow Orchestrator (C6, §4.6): a DAG executor layered on top of the
//! queue manager. Registers workflow definitions, decides which nodes are
//! ready, renders each node's parameters and input through the sandboxed
//! template evaluator, submits the resulting job to the queue manager,
//! extracts results once a job completes, and drives node failure policies.
//!
//! Workflow definitions and runtime state are process-wide, DashMap-backed
//! state (§9 "Global mutable state"): created on `register_workflow`,
//! destroyed (its scratch directories, specifically) once the workflow
//! reaches a terminal status. No second lock-ordering scheme is introduced
//! against the queue manager; the orchestrator's own per-workflow mutex is
//! only ever held across its own bookkeeping, never across a call into the
//! queue manager while also awaiting the queue manager's lock.

mod error;
mod event;
pub(crate) mod scratch;
mod template;
mod types;

pub use error::OrchestratorError;
pub use event::{EventSink, OrchestratorEvent};
pub use types::{
    FailurePolicy, NodeStatus, NodeType, WorkflowDefinition, WorkflowNode, WorkflowState,
    WorkflowStatus, WorkflowStatusSnapshot,
};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::graph::{assert_acyclic, reachable_from};
use crate::parser::{ExtractorRegistry, OutputExtractor};
use crate::queue::QueueManager;
use crate::store::{JobStatus, JobStore};

/// Tuning knobs for the background monitor and job submission defaults.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// §4.6.9: "a task polls every ~5 s".
    pub monitor_interval: Duration,
    /// §4.6.5: "priority (default NORMAL)" on the 0 (highest) - 4 scale §3
    /// uses for queue rows; 2 is the middle of that range.
    pub default_priority: u8,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(5),
            default_priority: 2,
        }
    }
}

struct WorkflowEntry {
    definition: WorkflowDefinition,
    state: WorkflowState,
}

/// The DAG executor of §4.6. Holds the workflow registry, the node-output
/// extractor registry (seeded with the three built-ins), the scratch
/// directory allocator, and an optional event sink. Talks to the queue
/// manager only through its public contract; never touches a runner or the
/// store's job rows directly except to create a job and read back its
/// results.
pub struct WorkflowOrchestrator {
    store: Arc<dyn JobStore>,
    queue: Arc<QueueManager>,
    workflows: DashMap<Uuid, Arc<AsyncMutex<WorkflowEntry>>>,
    extractors: parking_lot::RwLock<ExtractorRegistry>,
    scratch: scratch::ScratchRegistry,
    event_sink: parking_lot::RwLock<Option<EventSink>>,
    config: OrchestratorConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    monitor_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkflowOrchestrator {
    /// `scratch_base`: explicit scratch root, taking precedence over the
    /// `CRY_SCRATCH_BASE` / `CRY23_SCRDIR` / system-temp-dir fallback chain
    /// resolved inside [`scratch::ScratchRegistry::new`] (§4.6.4).
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<QueueManager>,
        scratch_base: Option<PathBuf>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            store,
            queue,
            workflows: DashMap::new(),
            extractors: parking_lot::RwLock::new(ExtractorRegistry::with_builtins()),
            scratch: scratch::ScratchRegistry::new(scratch_base.as_deref()),
            event_sink: parking_lot::RwLock::new(None),
            config,
            shutdown_tx,
            shutdown_rx,
            monitor_handle: std::sync::Mutex::new(None),
        })
    }

    /// §6 "Event sink": a single callback receives every lifecycle event.
    pub fn set_event_sink(&self, sink: EventSink) {
        *self.event_sink.write() = Some(sink);
    }

    /// §4.6.1: registers a named output-parser callable. Built-ins
    /// (`energy`, `bandgap`, `lattice`) are already registered by `new`.
    pub fn register_parser(&self, name: impl Into<String>, extractor: OutputExtractor) {
        self.extractors.write().register(name, extractor);
    }

    /// §4.6.1/§4.6.2, §7 "Validation errors ... state unchanged": validates
    /// the DAG (acyclic, every dependency present, every template reference
    /// confined to a declared dependency, every named parser registered)
    /// before storing anything. Returns the workflow id on success.
    #[instrument(skip(self, definition))]
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<Uuid, OrchestratorError> {
        let graph = definition.dependency_graph();
        assert_acyclic(&graph, format!("workflow {}", definition.id))?;

        for node in &definition.nodes {
            for dep in &node.dependencies {
                if definition.node(dep).is_none() {
                    return Err(OrchestratorError::UnknownDependency(
                        node.id.clone(),
                        dep.clone(),
                    ));
                }
            }
        }

        {
            let extractors = self.extractors.read();
            for node in &definition.nodes {
                for parser_name in &node.output_parsers {
                    if extractors.get(parser_name).is_none() {
                        return Err(OrchestratorError::UnknownParser(
                            node.id.clone(),
                            parser_name.clone(),
                        ));
                    }
                }
            }
        }

        for node in &definition.nodes {
            let mut refs = template::referenced_names(&node.input_template);
            for value in node.parameters.values() {
                if let Some(s) = value.as_str() {
                    refs.extend(template::referenced_names(s));
                }
            }
            for (name, _field) in refs {
                if !node.dependencies.iter().any(|d| d == &name) {
                    return Err(OrchestratorError::UnconfinedTemplateReference {
                        node: node.id.clone(),
                        referenced: name,
                    });
                }
            }
        }

        let mut definition = definition;
        definition.status = WorkflowStatus::Valid;
        let id = definition.id;
        self.workflows.insert(
            id,
            Arc::new(AsyncMutex::new(WorkflowEntry {
                definition,
                state: WorkflowState::default(),
            })),
        );
        Ok(id)
    }

    /// §4.6.1: transitions a validated workflow to `RUNNING` and submits
    /// its initially-ready nodes.
    #[instrument(skip(self))]
    pub async fn start_workflow(self: &Arc<Self>, id: Uuid) -> Result<(), OrchestratorError> {
        let entry = self.workflow_entry(id)?;
        {
            let mut guard = entry.lock().await;
            guard.definition.status = WorkflowStatus::Running;
            guard.state.started_at = Some(Utc::now());
        }
        self.emit(OrchestratorEvent::WorkflowStarted {
            workflow_id: id,
            at: Utc::now(),
        });
        self.advance_workflow(id).await;
        Ok(())
    }

    /// Stops submitting new nodes; jobs already in flight keep running.
    pub async fn pause_workflow(&self, id: Uuid) -> Result<(), OrchestratorError> {
        let entry = self.workflow_entry(id)?;
        let mut guard = entry.lock().await;
        if guard.definition.status != WorkflowStatus::Running {
            return Err(OrchestratorError::NotRunning(id));
        }
        guard.definition.status = WorkflowStatus::Paused;
        Ok(())
    }

    pub async fn resume_workflow(self: &Arc<Self>, id: Uuid) -> Result<(), OrchestratorError> {
        {
            let entry = self.workflow_entry(id)?;
            let mut guard = entry.lock().await;
            if guard.definition.status != WorkflowStatus::Paused {
                return Err(OrchestratorError::NotRunning(id));
            }
            guard.definition.status = WorkflowStatus::Running;
        }
        self.advance_workflow(id).await;
        Ok(())
    }

    /// §4.6.1/§5: cancels every job the workflow has ever submitted through
    /// the queue manager's own `cancel`, then marks the workflow `CANCELLED`.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, id: Uuid, reason: impl Into<String>) -> Result<(), OrchestratorError> {
        let entry = self.workflow_entry(id)?;
        let job_ids: Vec<Uuid> = {
            let guard = entry.lock().await;
            guard.definition.nodes.iter().filter_map(|n| n.job_id).collect()
        };
        for job_id in job_ids {
            let _ = self.queue.cancel(job_id).await;
        }
        {
            let mut guard = entry.lock().await;
            guard.definition.status = WorkflowStatus::Cancelled;
            guard.state.completed_at = Some(Utc::now());
        }
        self.scratch.cleanup_workflow(id);
        self.emit(OrchestratorEvent::WorkflowCancelled {
            workflow_id: id,
            reason: reason.into(),
            at: Utc::now(),
        });
        Ok(())
    }

    pub async fn get_workflow_status(&self, id: Uuid) -> Result<WorkflowStatusSnapshot, OrchestratorError> {
        let entry = self.workflow_entry(id)?;
        let guard = entry.lock().await;
        let percent_progress = guard.state.percent_progress(guard.definition.nodes.len());
        Ok(WorkflowStatusSnapshot {
            definition: guard.definition.clone(),
            state: guard.state.clone(),
            percent_progress,
        })
    }

    /// §4.6.9: starts the background monitor loop.
    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.monitor_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        this.monitor_tick().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.monitor_handle.lock().unwrap() = Some(handle);
    }

    /// §4.6.1: halts the background monitor loop cooperatively.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.monitor_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn workflow_entry(&self, id: Uuid) -> Result<Arc<AsyncMutex<WorkflowEntry>>, OrchestratorError> {
        self.workflows
            .get(&id)
            .map(|e| e.clone())
            .ok_or(OrchestratorError::UnknownWorkflow(id))
    }

    /// §4.6.8: delivers one event to the registered sink, if any. A sink
    /// that panics is caught and logged rather than allowed to unwind into
    /// orchestration logic (§4.6.8 "a broken callback must not destabilize
    /// orchestration").
    fn emit(&self, event: OrchestratorEvent) {
        let sink = self.event_sink.read().clone();
        if let Some(sink) = sink {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink(event))).is_err() {
                warn!("orchestrator event sink panicked; continuing");
            }
        }
    }

    /// §4.6.2 DAG readiness: marks every `PENDING` node whose predecessors
    /// are now all `COMPLETED` for submission, and cascades `SKIPPED` to
    /// every `PENDING` descendant of a `FAILED`/`SKIPPED` node. The cascade
    /// walks forward edges (`WorkflowDefinition::forward_edges`) with
    /// `reachable_from`, so one failed node skips its whole downstream
    /// subtree in a single pass rather than a predecessor-scanning fixpoint.
    async fn advance_workflow(self: &Arc<Self>, workflow_id: Uuid) {
        let entry = match self.workflow_entry(workflow_id) {
            Ok(e) => e,
            Err(_) => return,
        };

        loop {
            let (to_submit, to_complete_passthrough, progressed) = {
                let mut guard = entry.lock().await;
                if guard.definition.status != WorkflowStatus::Running {
                    return;
                }

                let mut progressed = false;
                let forward = guard.definition.forward_edges();
                let roots: Vec<String> = guard
                    .definition
                    .nodes
                    .iter()
                    .filter(|n| matches!(n.status, NodeStatus::Failed | NodeStatus::Skipped))
                    .map(|n| n.id.clone())
                    .collect();
                let to_skip: std::collections::HashSet<String> = roots
                    .iter()
                    .flat_map(|root| reachable_from(&forward, root))
                    .collect();
                for id in &to_skip {
                    if let Some(node) = guard.definition.nodes.iter_mut().find(|n| &n.id == id) {
                        if node.status == NodeStatus::Pending {
                            node.status = NodeStatus::Skipped;
                            guard.state.skipped_nodes.insert(id.clone());
                            progressed = true;
                        }
                    }
                }

                let mut to_submit = Vec::new();
                let mut to_complete_passthrough = Vec::new();
                for node in &guard.definition.nodes {
                    if node.status != NodeStatus::Pending {
                        continue;
                    }
                    let ready = node.dependencies.iter().all(|d| {
                        guard
                            .definition
                            .node(d)
                            .map(|p| p.status == NodeStatus::Completed)
                            .unwrap_or(false)
                    });
                    if !ready {
                        continue;
                    }
                    if node.node_type == NodeType::Calculation {
                        to_submit.push(node.id.clone());
                    } else {
                        to_complete_passthrough.push(node.id.clone());
                    }
                }
                (to_submit, to_complete_passthrough, progressed)
            };

            if to_submit.is_empty() && to_complete_passthrough.is_empty() && !progressed {
                break;
            }

            // DATA_TRANSFER/CONDITION/AGGREGATION nodes submit no job
            // (§3 node-type comment, §1 Non-goals); they pass their
            // resolved parameters straight through as extracted results.
            for node_id in &to_complete_passthrough {
                let mut guard = entry.lock().await;
                if let Some(node) = guard.definition.nodes.iter_mut().find(|n| &n.id == node_id) {
                    node.status = NodeStatus::Completed;
                    node.extracted_results = node.parameters.clone();
                }
                guard.state.completed_nodes.insert(node_id.clone());
            }

            for node_id in &to_submit {
                if let Err(err) = self.submit_node(workflow_id, node_id).await {
                    self.handle_node_failure(workflow_id, node_id, err.to_string()).await;
                }
            }
        }

        self.check_workflow_completion(workflow_id).await;
    }

    /// §4.6.3 parameter resolution/templating, §4.6.4 scratch allocation,
    /// §4.6.5 submission and callback wiring, all for one `CALCULATION`
    /// node.
    async fn submit_node(self: &Arc<Self>, workflow_id: Uuid, node_id: &str) -> Result<(), OrchestratorError> {
        let entry = self.workflow_entry(workflow_id)?;

        let (node, workflow_name, global_parameters) = {
            let guard = entry.lock().await;
            let node = guard
                .definition
                .node(node_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::UnknownDependency(node_id.to_string(), node_id.to_string()))?;
            (node, guard.definition.name.clone(), guard.definition.global_parameters.clone())
        };

        let context: HashMap<String, serde_json::Value> = {
            let guard = entry.lock().await;
            node.dependencies
                .iter()
                .filter_map(|dep| guard.definition.node(dep).map(|p| (dep.clone(), serde_json::json!(p.extracted_results))))
                .collect()
        };

        // §4.6.3 steps 1-2: node parameters overlaid by global parameters,
        // global wins on key conflict.
        let mut effective_params = node.parameters.clone();
        for (k, v) in &global_parameters {
            effective_params.insert(k.clone(), v.clone());
        }
        for value in effective_params.values_mut() {
            if let Some(s) = value.as_str() {
                let rendered = template::render(s, &context)
                    .map_err(|source| OrchestratorError::Template { node: node.id.clone(), source })?;
                *value = serde_json::Value::String(rendered);
            }
        }

        let rendered_input = template::render(&node.input_template, &context)
            .map_err(|source| OrchestratorError::Template { node: node.id.clone(), source })?;

        let work_dir = self.scratch.allocate(workflow_id, &node.id, Utc::now())?;
        let input_path = work_dir.join(format!("{}.inp", node.code_tag));
        tokio::fs::write(&input_path, &rendered_input).await?;

        let job_name = format!("{workflow_name}:{node_id}");
        let job = self
            .store
            .create_job(
                &job_name,
                &work_dir.to_string_lossy(),
                &node.runner_type,
                node.cluster_id.as_deref(),
                Some(&rendered_input),
            )
            .await?;

        let dep_job_ids: Vec<Uuid> = {
            let guard = entry.lock().await;
            node.dependencies
                .iter()
                .filter_map(|d| guard.definition.node(d).and_then(|p| p.job_id))
                .collect()
        };

        // `node.max_retries` is the node-level `FailurePolicy::Retry` budget,
        // enforced by `handle_node_failure` resubmitting the whole node. The
        // queue's own retry counter is a separate layer (silent re-enqueue on
        // job failure); handing it the same budget here would double-count
        // it, retrying each of the node's own resubmissions again internally.
        // The queue is given no retry budget of its own for orchestrator jobs.
        self.queue
            .enqueue(
                job.id,
                self.config.default_priority,
                dep_job_ids,
                node.runner_type.clone(),
                node.cluster_id.clone(),
                None,
                0,
                HashMap::new(),
            )
            .await?;

        let callback_orch = Arc::clone(self);
        let callback_workflow_id = workflow_id;
        let callback_node_id = node.id.clone();
        self.queue
            .register_callback(
                job.id,
                Arc::new(move |job_id, success| {
                    let orch = Arc::clone(&callback_orch);
                    let node_id = callback_node_id.clone();
                    Box::pin(async move {
                        orch.process_node_completion(callback_workflow_id, &node_id, job_id, success)
                            .await;
                    })
                }),
            )
            .await;

        {
            let mut guard = entry.lock().await;
            if let Some(n) = guard.definition.nodes.iter_mut().find(|n| n.id == node_id) {
                n.status = NodeStatus::Queued;
                n.job_id = Some(job.id);
            }
            guard.state.running_nodes.insert(node_id.to_string());
        }

        self.emit(OrchestratorEvent::NodeStarted {
            workflow_id,
            node_id: node_id.to_string(),
            job_id: job.id,
            at: Utc::now(),
        });

        Ok(())
    }

    /// Invoked once per terminal job outcome, either by the queue manager's
    /// completion callback or by the background monitor's safety net
    /// (§4.6.9). A workflow already out of `RUNNING` (cancelled, paused, or
    /// already terminal) ignores further completions — a callback racing a
    /// cancellation must not resurrect events for a dead workflow.
    async fn process_node_completion(self: &Arc<Self>, workflow_id: Uuid, node_id: &str, job_id: Uuid, success: bool) {
        let entry = match self.workflow_entry(workflow_id) {
            Ok(e) => e,
            Err(_) => return,
        };
        {
            let guard = entry.lock().await;
            if guard.definition.status != WorkflowStatus::Running {
                return;
            }
        }

        if success {
            self.complete_node(workflow_id, node_id, job_id).await;
        } else {
            self.handle_node_failure(workflow_id, node_id, format!("job {job_id} failed")).await;
        }

        self.advance_workflow(workflow_id).await;
    }

    /// §4.6.6 result extraction: store-level results first, then each named
    /// parser's output merged in order; a missing or failing parser is
    /// logged and skipped, never fails the node.
    async fn complete_node(self: &Arc<Self>, workflow_id: Uuid, node_id: &str, job_id: Uuid) {
        let entry = match self.workflow_entry(workflow_id) {
            Ok(e) => e,
            Err(_) => return,
        };

        let job = match self.store.get_job(job_id).await {
            Ok(j) => j,
            Err(err) => {
                warn!(node_id, error = %err, "could not load completed job for result extraction");
                return;
            }
        };

        let mut results: HashMap<String, serde_json::Value> = HashMap::new();
        if let Some(energy) = job.final_energy {
            results.insert("final_energy".to_string(), serde_json::json!(energy));
        }
        if let Some(serde_json::Value::Object(map)) = job.key_results {
            for (k, v) in map {
                results.insert(k, v);
            }
        }

        let output_text = self.queue.take_job_output(job_id).await.unwrap_or_default();
        let parser_names = {
            let guard = entry.lock().await;
            guard
                .definition
                .node(node_id)
                .map(|n| n.output_parsers.clone())
                .unwrap_or_default()
        };
        let extractors = self.extractors.read().clone();
        for name in &parser_names {
            match extractors.get(name) {
                Some(extractor) => {
                    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| extractor(&output_text))) {
                        Ok(Ok(map)) => results.extend(map),
                        Ok(Err(msg)) => warn!(node_id, parser = name.as_str(), error = %msg, "output parser failed; skipping"),
                        Err(_) => warn!(node_id, parser = name.as_str(), "output parser panicked; skipping"),
                    }
                }
                None => warn!(node_id, parser = name.as_str(), "unregistered output parser; skipping"),
            }
        }

        {
            let mut guard = entry.lock().await;
            if let Some(node) = guard.definition.nodes.iter_mut().find(|n| n.id == node_id) {
                node.status = NodeStatus::Completed;
                node.extracted_results = results.clone();
            }
            guard.state.running_nodes.remove(node_id);
            guard.state.completed_nodes.insert(node_id.to_string());
        }

        self.emit(OrchestratorEvent::NodeCompleted {
            workflow_id,
            node_id: node_id.to_string(),
            job_id,
            results: serde_json::json!(results),
            at: Utc::now(),
        });
    }

    /// §4.6.7 failure-policy state machine.
    async fn handle_node_failure(self: &Arc<Self>, workflow_id: Uuid, node_id: &str, error_message: String) {
        let entry = match self.workflow_entry(workflow_id) {
            Ok(e) => e,
            Err(_) => return,
        };

        let (policy, retry_count, max_retries) = {
            let guard = entry.lock().await;
            match guard.definition.node(node_id) {
                Some(n) => (n.failure_policy, n.retry_count, n.max_retries),
                None => return,
            }
        };

        if policy == FailurePolicy::Retry && retry_count < max_retries {
            let new_retry_count = retry_count + 1;
            {
                let mut guard = entry.lock().await;
                if let Some(node) = guard.definition.nodes.iter_mut().find(|n| n.id == node_id) {
                    node.retry_count = new_retry_count;
                    node.status = NodeStatus::Pending;
                    node.job_id = None;
                }
                guard.state.running_nodes.remove(node_id);
            }
            self.emit(OrchestratorEvent::NodeFailed {
                workflow_id,
                node_id: node_id.to_string(),
                job_id: None,
                policy,
                retry_count: new_retry_count,
                error: error_message,
                at: Utc::now(),
            });
            return;
        }

        {
            let mut guard = entry.lock().await;
            if let Some(node) = guard.definition.nodes.iter_mut().find(|n| n.id == node_id) {
                node.status = NodeStatus::Failed;
            }
            guard.state.running_nodes.remove(node_id);
            guard.state.failed_nodes.insert(node_id.to_string());
        }

        self.emit(OrchestratorEvent::NodeFailed {
            workflow_id,
            node_id: node_id.to_string(),
            job_id: None,
            policy,
            retry_count,
            error: error_message.clone(),
            at: Utc::now(),
        });

        let retries_exhausted = policy == FailurePolicy::Retry && retry_count >= max_retries;
        if policy == FailurePolicy::Abort || retries_exhausted {
            {
                let mut guard = entry.lock().await;
                guard.definition.status = WorkflowStatus::Failed;
                guard.state.completed_at = Some(Utc::now());
            }
            self.scratch.cleanup_workflow(workflow_id);
            self.emit(OrchestratorEvent::WorkflowFailed {
                workflow_id,
                reason: error_message,
                at: Utc::now(),
            });
        }
    }

    /// §4.6.10: a workflow is complete once every node is terminal
    /// (`COMPLETED`/`FAILED`/`SKIPPED`). Zero failures -> `COMPLETED`;
    /// otherwise `PARTIAL`, still reported through the same
    /// `WorkflowCompleted` event carrying both counts (§7 "a PARTIAL
    /// workflow carries counts of completed and failed nodes").
    async fn check_workflow_completion(self: &Arc<Self>, workflow_id: Uuid) {
        let entry = match self.workflow_entry(workflow_id) {
            Ok(e) => e,
            Err(_) => return,
        };
        let mut guard = entry.lock().await;
        if guard.definition.status != WorkflowStatus::Running {
            return;
        }
        let total = guard.definition.nodes.len();
        let done = guard.state.completed_nodes.len() + guard.state.failed_nodes.len() + guard.state.skipped_nodes.len();
        if done < total {
            return;
        }
        let failed = guard.state.failed_nodes.len();
        let completed = guard.state.completed_nodes.len();
        // §4.6.10 names only COMPLETED/FAILED(abort)/PARTIAL, but §8 scenario 5
        // (SKIP_DEPENDENTS cascading to every other node) has zero completed
        // nodes and expects the workflow to end FAILED rather than PARTIAL.
        // Read the two together as: PARTIAL requires at least one node to have
        // actually succeeded; a run where nothing ever completed is a FAILED
        // run regardless of which policy produced the all-failed/all-skipped
        // outcome.
        guard.definition.status = if failed == 0 {
            WorkflowStatus::Completed
        } else if completed == 0 {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Partial
        };
        guard.state.completed_at = Some(Utc::now());
        let final_status = guard.definition.status.clone();
        drop(guard);

        self.scratch.cleanup_workflow(workflow_id);
        match final_status {
            WorkflowStatus::Failed => {
                self.emit(OrchestratorEvent::WorkflowFailed {
                    workflow_id,
                    reason: "every node failed or was skipped".to_string(),
                    at: Utc::now(),
                });
            }
            _ => {
                self.emit(OrchestratorEvent::WorkflowCompleted {
                    workflow_id,
                    completed_nodes: completed,
                    failed_nodes: failed,
                    at: Utc::now(),
                });
            }
        }
    }

    /// §4.6.9 background monitor: safety net for completion callbacks that
    /// never fire. The only place the orchestrator polls the store.
    async fn monitor_tick(self: &Arc<Self>) {
        let entries: Vec<(Uuid, Arc<AsyncMutex<WorkflowEntry>>)> =
            self.workflows.iter().map(|e| (*e.key(), e.value().clone())).collect();

        for (workflow_id, entry) in entries {
            let running_nodes: Vec<String> = {
                let guard = entry.lock().await;
                if guard.definition.status != WorkflowStatus::Running {
                    continue;
                }
                guard.state.running_nodes.iter().cloned().collect()
            };

            for node_id in running_nodes {
                let job_id = {
                    let guard = entry.lock().await;
                    guard.definition.node(&node_id).and_then(|n| n.job_id)
                };
                let Some(job_id) = job_id else { continue };
                let job = match self.store.get_job(job_id).await {
                    Ok(j) => j,
                    Err(_) => continue,
                };
                if job.status.is_terminal() {
                    let success = job.status == JobStatus::Completed;
                    self.process_node_completion(workflow_id, &node_id, job_id, success).await;
                }
            }
        }
    }
}
