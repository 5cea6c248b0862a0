//! Parser interface (§4.4): a pure function mapping a job's work directory
//! to a structured result record. One implementation per DFT code
//! (CRYSTAL, Quantum Espresso, VASP) ships outside this crate and is
//! selected by the job's code tag; this module owns the shared result type
//! and the three built-in, code-agnostic extractors the orchestrator runs
//! against raw output text after a job completes (§4.6.6).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod builtin;

/// Convergence classification a parser assigns to a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    Converged,
    NotConverged,
    Failed,
    Unknown,
}

/// Structured result of parsing one DFT code's output. Pure with respect to
/// file contents: a `Parser::parse` call has no side effects and the same
/// work directory always yields the same result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedResult {
    pub final_energy: Option<f64>,
    pub energy_unit: Option<String>,
    pub convergence_status: Option<ConvergenceStatus>,
    pub scf_cycles: Option<u32>,
    pub geometry_converged: Option<bool>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read work directory {0}: {1}")]
    Io(String, String),

    #[error("no recognizable output in {0}")]
    NoOutput(String),
}

/// Selected by the job's DFT-code tag. Implementations live outside this
/// crate; this trait is the seam they plug into.
#[async_trait::async_trait]
pub trait CodeParser: Send + Sync {
    async fn parse(&self, work_dir: &str) -> Result<ParsedResult, ParseError>;
}

/// Output-extractor callable keyed by name and run by the orchestrator
/// against a node's raw stdout/output text after job completion (§4.6.6).
/// Distinct from [`CodeParser`]: these operate on in-memory text already
/// collected rather than re-reading the work directory, and return a
/// shallow key/value map merged into the node's extracted-results map
/// rather than a fixed [`ParsedResult`].
pub type OutputExtractor =
    std::sync::Arc<dyn Fn(&str) -> Result<HashMap<String, serde_json::Value>, String> + Send + Sync>;

/// Registry of named output extractors. Built with the three built-ins
/// (`energy`, `bandgap`, `lattice`) pre-registered, matching
/// `WorkflowOrchestrator::new` in §4.6.1.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, OutputExtractor>,
}

impl ExtractorRegistry {
    pub fn with_builtins() -> Self {
        let mut reg = Self::default();
        reg.register("energy", std::sync::Arc::new(builtin::extract_energy));
        reg.register("bandgap", std::sync::Arc::new(builtin::extract_bandgap));
        reg.register("lattice", std::sync::Arc::new(builtin::extract_lattice));
        reg
    }

    pub fn register(&mut self, name: impl Into<String>, extractor: OutputExtractor) {
        self.extractors.insert(name.into(), extractor);
    }

    pub fn get(&self, name: &str) -> Option<&OutputExtractor> {
        self.extractors.get(name)
    }
}
