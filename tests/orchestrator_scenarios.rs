//! Cross-module integration scenarios from §8's "seeds for an integration
//! suite": the linear-chain/templating scenario and the skip-dependents
//! cascade, both driven through the real `QueueManager` background loop
//! rather than by calling its internals directly.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dft_core::prelude::*;
use uuid::Uuid;

/// A `Runner` whose status and output text per job are scripted by the test,
/// rather than always succeeding immediately like [`MockRunner`]. Submission
/// is instantaneous; `status`/`output_stream` answer from a pre-seeded map
/// keyed by job id, defaulting to an immediate `Completed` with empty output
/// when nothing was seeded.
struct ScriptedRunner {
    outcomes: DashMap<Uuid, RunnerStatus>,
    outputs: DashMap<Uuid, String>,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self {
            outcomes: DashMap::new(),
            outputs: DashMap::new(),
        }
    }

    fn set_outcome(&self, job_id: Uuid, status: RunnerStatus) {
        self.outcomes.insert(job_id, status);
    }

    fn set_output(&self, job_id: Uuid, text: String) {
        self.outputs.insert(job_id, text);
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn submit(
        &self,
        job_id: Uuid,
        _input_file: &str,
        _work_dir: &str,
        _threads: Option<u32>,
    ) -> Result<RunnerHandle, RunnerError> {
        Ok(RunnerHandle(job_id.to_string()))
    }

    async fn status(&self, handle: &RunnerHandle) -> Result<RunnerStatus, RunnerError> {
        let job_id = Uuid::parse_str(&handle.0).map_err(|e| RunnerError::UnknownHandle(e.to_string()))?;
        Ok(self
            .outcomes
            .get(&job_id)
            .map(|e| *e.value())
            .unwrap_or(RunnerStatus::Completed))
    }

    async fn cancel(&self, _handle: &RunnerHandle) -> Result<bool, RunnerError> {
        Ok(false)
    }

    async fn output_stream(&self, handle: &RunnerHandle) -> Result<dft_core::runner::OutputStream, RunnerError> {
        let job_id = Uuid::parse_str(&handle.0).map_err(|e| RunnerError::UnknownHandle(e.to_string()))?;
        let text = self.outputs.get(&job_id).map(|e| e.value().clone()).unwrap_or_default();
        Ok(Box::pin(futures::stream::once(async move { text })))
    }

    async fn retrieve_results(&self, _handle: &RunnerHandle, _dest: &str, _cleanup: bool) -> Result<(), RunnerError> {
        Ok(())
    }
}

fn scf_energy_text(energy: f64) -> String {
    format!("== SCF ENDED - CONVERGENCE ON ENERGY      E(AU) = {energy}")
}

async fn wait_for<F: Fn() -> bool>(predicate: F, max_iterations: usize) {
    for _ in 0..max_iterations {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_log::test(tokio::test)]
async fn linear_chain_propagates_extracted_energy_through_templates() -> anyhow::Result<()> {
    common::init();

    let store = Arc::new(InMemoryJobStore::new());
    let runner = Arc::new(ScriptedRunner::new());
    let mut runners: HashMap<String, Arc<dyn Runner>> = HashMap::new();
    runners.insert("local".to_string(), runner.clone() as Arc<dyn Runner>);

    let queue = QueueManager::new(
        store.clone(),
        runners,
        QueueManagerConfig {
            tick_interval: Duration::from_millis(15),
            fair_share_enabled: true,
        },
    );
    queue
        .register_cluster(ClusterRow {
            cluster_id: "c1".to_string(),
            max_concurrent_jobs: 4,
            paused: false,
            available_resources: HashMap::new(),
        })
        .await?;
    queue.start().await?;

    let scratch_root = tempfile::tempdir()?;
    let orchestrator = WorkflowOrchestrator::new(
        store.clone(),
        queue.clone(),
        Some(scratch_root.path().to_path_buf()),
        OrchestratorConfig {
            monitor_interval: Duration::from_millis(50),
            default_priority: 2,
        },
    );
    orchestrator.start().await;

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let events_for_sink = events.clone();
    let energies: HashMap<&'static str, f64> = [("A", -75.100000), ("B", -75.200000), ("C", -75.300000)]
        .into_iter()
        .collect();
    let runner_for_sink = runner.clone();
    orchestrator.set_event_sink(Arc::new(move |event| {
        let label = match &event {
            OrchestratorEvent::WorkflowStarted { .. } => "WorkflowStarted".to_string(),
            OrchestratorEvent::NodeStarted { node_id, job_id, .. } => {
                if let Some(energy) = energies.get(node_id.as_str()) {
                    runner_for_sink.set_output(*job_id, scf_energy_text(*energy));
                }
                format!("NodeStarted({node_id})")
            }
            OrchestratorEvent::NodeCompleted { node_id, .. } => format!("NodeCompleted({node_id})"),
            OrchestratorEvent::NodeFailed { node_id, .. } => format!("NodeFailed({node_id})"),
            OrchestratorEvent::WorkflowCompleted { completed_nodes, failed_nodes, .. } => {
                format!("WorkflowCompleted({completed_nodes},{failed_nodes})")
            }
            OrchestratorEvent::WorkflowFailed { .. } => "WorkflowFailed".to_string(),
            OrchestratorEvent::WorkflowCancelled { .. } => "WorkflowCancelled".to_string(),
        };
        events_for_sink.lock().unwrap().push(label);
    }));

    let node_a = WorkflowNode::new("A", NodeType::Calculation, "calculate baseline")
        .with_parsers(vec!["energy".to_string()]);
    let node_b = WorkflowNode::new("B", NodeType::Calculation, "optimize from {{ A.final_energy }}")
        .with_dependencies(vec!["A".to_string()])
        .with_parsers(vec!["energy".to_string()]);
    let node_c = WorkflowNode::new("C", NodeType::Calculation, "single point from {{ B.final_energy }}")
        .with_dependencies(vec!["B".to_string()])
        .with_parsers(vec!["energy".to_string()]);

    let definition = WorkflowDefinition::new("linear-chain", vec![node_a, node_b, node_c]);
    let workflow_id = orchestrator.register_workflow(definition)?;
    orchestrator.start_workflow(workflow_id).await?;

    wait_for(
        || {
            events
                .lock()
                .unwrap()
                .iter()
                .any(|e| e.starts_with("WorkflowCompleted") || e == "WorkflowFailed")
        },
        500,
    )
    .await;

    let snapshot = orchestrator.get_workflow_status(workflow_id).await?;
    assert_eq!(snapshot.definition.status, WorkflowStatus::Completed);

    let recorded = events.lock().unwrap().clone();
    assert_eq!(
        recorded,
        vec![
            "WorkflowStarted",
            "NodeStarted(A)",
            "NodeCompleted(A)",
            "NodeStarted(B)",
            "NodeCompleted(B)",
            "NodeStarted(C)",
            "NodeCompleted(C)",
            "WorkflowCompleted(3,0)",
        ]
    );

    let b_job_id = snapshot.definition.node("B").unwrap().job_id.unwrap();
    let b_job = store.get_job(b_job_id).await?;
    let b_input = b_job.input.unwrap_or_default();
    assert!(
        b_input.contains("-75.1"),
        "B's rendered input should contain A's extracted energy, got: {b_input}"
    );

    queue.stop().await;
    orchestrator.stop().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn retry_policy_resubmits_and_eventually_completes() -> anyhow::Result<()> {
    common::init();

    let store = Arc::new(InMemoryJobStore::new());
    let runner = Arc::new(ScriptedRunner::new());
    let mut runners: HashMap<String, Arc<dyn Runner>> = HashMap::new();
    runners.insert("local".to_string(), runner.clone() as Arc<dyn Runner>);

    let queue = QueueManager::new(
        store.clone(),
        runners,
        QueueManagerConfig {
            tick_interval: Duration::from_millis(15),
            fair_share_enabled: true,
        },
    );
    queue
        .register_cluster(ClusterRow {
            cluster_id: "c1".to_string(),
            max_concurrent_jobs: 4,
            paused: false,
            available_resources: HashMap::new(),
        })
        .await?;
    queue.start().await?;

    let scratch_root = tempfile::tempdir()?;
    let orchestrator = WorkflowOrchestrator::new(
        store.clone(),
        queue.clone(),
        Some(scratch_root.path().to_path_buf()),
        OrchestratorConfig {
            monitor_interval: Duration::from_millis(50),
            default_priority: 2,
        },
    );
    orchestrator.start().await;

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let events_for_sink = events.clone();
    // Each (re)submission of node "A" gets a fresh job id; fail the first two
    // attempts and let the third succeed, exercising `FailurePolicy::Retry`
    // through to exhaustion-free success (§8 scenario 4).
    let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let runner_for_sink = runner.clone();
    orchestrator.set_event_sink(Arc::new(move |event| {
        match &event {
            OrchestratorEvent::NodeStarted { node_id, job_id, .. } if node_id == "A" => {
                let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if attempt < 2 {
                    runner_for_sink.set_outcome(*job_id, RunnerStatus::Failed);
                }
            }
            OrchestratorEvent::NodeFailed { node_id, retry_count, .. } => {
                events_for_sink
                    .lock()
                    .unwrap()
                    .push(format!("NodeFailed({node_id},{retry_count})"));
            }
            OrchestratorEvent::NodeCompleted { node_id, .. } => {
                events_for_sink.lock().unwrap().push(format!("NodeCompleted({node_id})"));
            }
            OrchestratorEvent::WorkflowCompleted { .. } => {
                events_for_sink.lock().unwrap().push("WorkflowCompleted".to_string());
            }
            _ => {}
        }
    }));

    let node_a = WorkflowNode::new("A", NodeType::Calculation, "calculate a")
        .with_failure_policy(FailurePolicy::Retry)
        .with_max_retries(2);

    let definition = WorkflowDefinition::new("retry-then-succeed", vec![node_a]);
    let workflow_id = orchestrator.register_workflow(definition)?;
    orchestrator.start_workflow(workflow_id).await?;

    wait_for(
        || events.lock().unwrap().iter().any(|e| e == "WorkflowCompleted"),
        500,
    )
    .await;

    let recorded = events.lock().unwrap().clone();
    assert_eq!(
        recorded,
        vec![
            "NodeFailed(A,1)",
            "NodeFailed(A,2)",
            "NodeCompleted(A)",
            "WorkflowCompleted",
        ]
    );

    let snapshot = orchestrator.get_workflow_status(workflow_id).await?;
    assert_eq!(snapshot.definition.status, WorkflowStatus::Completed);
    assert_eq!(snapshot.definition.node("A").unwrap().retry_count, 2);

    queue.stop().await;
    orchestrator.stop().await;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn skip_dependents_cascades_and_workflow_ends_failed() -> anyhow::Result<()> {
    common::init();

    let store = Arc::new(InMemoryJobStore::new());
    let runner = Arc::new(ScriptedRunner::new());
    let mut runners: HashMap<String, Arc<dyn Runner>> = HashMap::new();
    runners.insert("local".to_string(), runner.clone() as Arc<dyn Runner>);

    let queue = QueueManager::new(
        store.clone(),
        runners,
        QueueManagerConfig {
            tick_interval: Duration::from_millis(15),
            fair_share_enabled: true,
        },
    );
    queue
        .register_cluster(ClusterRow {
            cluster_id: "c1".to_string(),
            max_concurrent_jobs: 4,
            paused: false,
            available_resources: HashMap::new(),
        })
        .await?;
    queue.start().await?;

    let scratch_root = tempfile::tempdir()?;
    let orchestrator = WorkflowOrchestrator::new(
        store.clone(),
        queue.clone(),
        Some(scratch_root.path().to_path_buf()),
        OrchestratorConfig {
            monitor_interval: Duration::from_millis(50),
            default_priority: 2,
        },
    );
    orchestrator.start().await;

    let runner_for_sink = runner.clone();
    orchestrator.set_event_sink(Arc::new(move |event| {
        if let OrchestratorEvent::NodeStarted { node_id, job_id, .. } = &event {
            if node_id == "A" {
                runner_for_sink.set_outcome(*job_id, RunnerStatus::Failed);
            }
        }
    }));

    let node_a = WorkflowNode::new("A", NodeType::Calculation, "calculate a")
        .with_failure_policy(FailurePolicy::SkipDependents);
    let node_b = WorkflowNode::new("B", NodeType::Calculation, "calculate b")
        .with_dependencies(vec!["A".to_string()]);
    let node_c = WorkflowNode::new("C", NodeType::Calculation, "calculate c")
        .with_dependencies(vec!["A".to_string()]);
    let node_d = WorkflowNode::new("D", NodeType::Calculation, "calculate d")
        .with_dependencies(vec!["B".to_string(), "C".to_string()]);

    let definition = WorkflowDefinition::new("skip-dependents", vec![node_a, node_b, node_c, node_d]);
    let workflow_id = orchestrator.register_workflow(definition)?;
    orchestrator.start_workflow(workflow_id).await?;

    wait_for(
        || {
            // Poll until the workflow has reached a terminal status.
            futures::executor::block_on(async {
                orchestrator
                    .get_workflow_status(workflow_id)
                    .await
                    .map(|s| {
                        matches!(
                            s.definition.status,
                            WorkflowStatus::Failed | WorkflowStatus::Completed | WorkflowStatus::Partial
                        )
                    })
                    .unwrap_or(false)
            })
        },
        500,
    )
    .await;

    let snapshot = orchestrator.get_workflow_status(workflow_id).await?;
    assert_eq!(snapshot.definition.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.definition.node("A").unwrap().status, NodeStatus::Failed);
    assert_eq!(snapshot.definition.node("B").unwrap().status, NodeStatus::Skipped);
    assert_eq!(snapshot.definition.node("C").unwrap().status, NodeStatus::Skipped);
    assert_eq!(snapshot.definition.node("D").unwrap().status, NodeStatus::Skipped);

    queue.stop().await;
    orchestrator.stop().await;
    Ok(())
}
