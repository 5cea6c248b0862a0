//! Error taxonomy for workflow registration and execution (§7).

use uuid::Uuid;

use crate::graph::CycleError;
use crate::orchestrator::template::TemplateError;
use crate::queue::QueueError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("workflow not found: {0}")]
    UnknownWorkflow(Uuid),

    #[error("node {0:?} references unknown dependency {1:?}")]
    UnknownDependency(String, String),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("node {node:?} template references {referenced:?}, which is neither a declared dependency nor a global parameter")]
    UnconfinedTemplateReference { node: String, referenced: String },

    #[error("node {0:?} names unregistered output parser {1:?}")]
    UnknownParser(String, String),

    #[error("node {node:?} template error: {source}")]
    Template {
        node: String,
        #[source]
        source: TemplateError,
    },

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("workflow {0} is not running")]
    NotRunning(Uuid),

    #[error("scratch directory allocation failed: {0}")]
    Scratch(#[from] std::io::Error),
}
