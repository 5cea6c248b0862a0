//! Scratch directory allocation for calculation nodes (§4.6.4). Mirrors the
//! fallback chain and naming convention the CRYSTAL tooling already used:
//! `CRY_SCRATCH_BASE` (preferred), then `CRY23_SCRDIR` (CRYSTAL23
//! convention), then the system temp directory.
//!
//! Directories are tracked against the workflow they belong to so cleanup
//! can be conditional on that workflow having reached a terminal state —
//! a running workflow's scratch space must never be removed out from under
//! it.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use uuid::Uuid;

/// Resolve the scratch base directory via the documented fallback chain.
/// `explicit` wins outright when given; otherwise `CRY_SCRATCH_BASE`, then
/// `CRY23_SCRDIR`, then [`std::env::temp_dir`].
pub fn scratch_base(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(p) = std::env::var("CRY_SCRATCH_BASE") {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    if let Ok(p) = std::env::var("CRY23_SCRDIR") {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    std::env::temp_dir()
}

/// Tracks allocated work directories per workflow so they can be cleaned up
/// once (and only once) that workflow reaches a terminal state.
pub struct ScratchRegistry {
    base: PathBuf,
    dirs: DashMap<PathBuf, Uuid>,
}

impl ScratchRegistry {
    pub fn new(explicit_base: Option<&Path>) -> Self {
        Self {
            base: scratch_base(explicit_base),
            dirs: DashMap::new(),
        }
    }

    /// Allocate and create a unique work directory for `node_id` within
    /// `workflow_id`, named `workflow_<id>_node_<node_id>_<timestamp>_<pid>`
    /// to mirror the convention the CRYSTAL job runner already followed.
    pub fn allocate(&self, workflow_id: Uuid, node_id: &str, now: chrono::DateTime<chrono::Utc>) -> std::io::Result<PathBuf> {
        let timestamp = now.format("%Y%m%d_%H%M%S_%f");
        let pid = std::process::id();
        let dir_name = format!("workflow_{workflow_id}_node_{node_id}_{timestamp}_{pid}");
        let work_dir = self.base.join(dir_name);
        std::fs::create_dir_all(&work_dir)?;
        self.dirs.insert(work_dir.clone(), workflow_id);
        Ok(work_dir)
    }

    /// Remove every tracked directory belonging to `workflow_id`. Callers
    /// invoke this only once the workflow has reached a terminal state
    /// (Completed, Failed, or Cancelled) — running workflows must keep their
    /// scratch space.
    pub fn cleanup_workflow(&self, workflow_id: Uuid) {
        let to_remove: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|entry| *entry.value() == workflow_id)
            .map(|entry| entry.key().clone())
            .collect();

        for dir in to_remove {
            let _ = std::fs::remove_dir_all(&dir);
            self.dirs.remove(&dir);
        }
    }

    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        self.dirs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_base_wins_over_environment() {
        let explicit = PathBuf::from("/tmp/explicit-scratch");
        assert_eq!(scratch_base(Some(&explicit)), explicit);
    }

    #[test]
    fn allocate_creates_directory_named_with_workflow_and_node() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ScratchRegistry::new(Some(tmp.path()));
        let workflow_id = Uuid::now_v7();
        let dir = registry.allocate(workflow_id, "opt1", chrono::Utc::now()).unwrap();
        assert!(dir.exists());
        assert!(dir.file_name().unwrap().to_string_lossy().contains("opt1"));
        assert_eq!(registry.tracked_count(), 1);
    }

    #[test]
    fn cleanup_removes_only_the_named_workflows_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ScratchRegistry::new(Some(tmp.path()));
        let finished = Uuid::now_v7();
        let running = Uuid::now_v7();
        let finished_dir = registry.allocate(finished, "a", chrono::Utc::now()).unwrap();
        let running_dir = registry.allocate(running, "b", chrono::Utc::now()).unwrap();

        registry.cleanup_workflow(finished);

        assert!(!finished_dir.exists());
        assert!(running_dir.exists());
        assert_eq!(registry.tracked_count(), 1);
    }
}
