//! Error taxonomy for the queue manager (§4.5.6, §7).

use uuid::Uuid;

use crate::graph::CycleError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    InvalidJob(Uuid),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("cluster not found: {0}")]
    UnknownCluster(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue manager is already running")]
    AlreadyRunning,
}
