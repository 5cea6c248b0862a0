//! # dft-core
//!
//! Job scheduling and workflow orchestration for density-functional-theory
//! calculations: a priority queue manager with dependency gating and crash
//! recovery (C5), and a DAG workflow orchestrator layered on top of it that
//! resolves per-node parameter templates, submits jobs, and extracts results
//! (C6).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowOrchestrator                       │
//! │  (DAG readiness, templating, result extraction, failure      │
//! │   policies)                                                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ enqueue / register_callback
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      QueueManager                             │
//! │  (priority scoring, cluster capacity, retries, recovery)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ submit / status / output_stream
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     dyn Runner (per type)                     │
//! │  (local process / SSH / SLURM batch — external collaborators) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! `graph` underlies both the queue manager's dependency DAG and the
//! orchestrator's workflow DAG; `store` is the shared persistence boundary
//! both read and write through; `parser` is the seam external per-code
//! output parsers plug into, plus the built-in text extractors the
//! orchestrator runs itself.
//!
//! ## Example
//!
//! ```ignore
//! use dft_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryJobStore::new());
//! let mut runners: std::collections::HashMap<String, Arc<dyn Runner>> = Default::default();
//! runners.insert("local".into(), Arc::new(MockRunner::new(4)));
//!
//! let queue = QueueManager::new(store.clone(), runners, QueueManagerConfig::default());
//! queue.start().await?;
//!
//! let orchestrator = WorkflowOrchestrator::new(store, queue, None, OrchestratorConfig::default());
//! orchestrator.start().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod graph;
pub mod orchestrator;
pub mod parser;
pub mod queue;
pub mod runner;
pub mod store;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::{init_tracing, Config};
    pub use crate::graph::{assert_acyclic, assert_acyclic_with_addition, reachable_from, CycleError};
    pub use crate::orchestrator::{
        FailurePolicy, NodeStatus, NodeType, OrchestratorConfig, OrchestratorError, OrchestratorEvent,
        WorkflowDefinition, WorkflowNode, WorkflowOrchestrator, WorkflowState, WorkflowStatus,
        WorkflowStatusSnapshot,
    };
    pub use crate::parser::{CodeParser, ExtractorRegistry, ParseError, ParsedResult};
    pub use crate::queue::{QueueError, QueueManager, QueueManagerConfig, QueueStatusFilter, QueueStatusSnapshot};
    pub use crate::runner::{MockRunner, Runner, RunnerError, RunnerHandle, RunnerStatus};
    pub use crate::store::{ClusterRow, InMemoryJobStore, Job, JobStatus, JobStore, QueueRow, SchedulerMetrics, SqliteJobStore, StoreError};
}

// Re-export key types at crate root.
pub use graph::CycleError;
pub use orchestrator::{OrchestratorError, WorkflowOrchestrator};
pub use queue::{QueueError, QueueManager};
pub use store::{JobStore, StoreError};
