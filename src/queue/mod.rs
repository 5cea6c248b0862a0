//! Queue Manager (C5, §4.5): the priority-based, dependency-aware scheduler
//! with crash recovery and backpressure that the orchestrator (C6) sits on
//! top of.

mod error;
mod manager;
mod score;
mod types;

pub use error::QueueError;
pub use manager::{QueueManager, QueueManagerConfig};
pub use types::{JobCallback, QueueStatusFilter, QueueStatusSnapshot, ScoredJob};
