//! Ambient configuration (§10 "Configuration"): resolves the handful of
//! environment-driven settings a host binary or test harness needs before
//! constructing a [`crate::store::SqliteJobStore`] or installing a `tracing`
//! subscriber, following the same `from_env()` convention the reference
//! workspace's own crates use for their runner and telemetry configuration.

use std::path::PathBuf;

use crate::orchestrator::scratch::scratch_base;

/// Resolved configuration for an embedding binary. Every field has a
/// fallback, so construction never fails; callers that need a hard
/// requirement (e.g. a CLI demanding an explicit database path) check the
/// resulting `Option` themselves.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Path to the persistent store's database file, when the file-backed
    /// store is constructed from configuration rather than an explicit path.
    pub db_path: Option<PathBuf>,
    /// `tracing-subscriber` `EnvFilter` directive string.
    pub log_filter: Option<String>,
    /// Scratch directory base for workflow node work directories.
    pub scratch_base: Option<PathBuf>,
}

impl Config {
    /// Create configuration from environment variables:
    /// - `DFT_CORE_DB_PATH`: database file path for [`crate::store::SqliteJobStore::open`]
    /// - `DFT_CORE_LOG`: `EnvFilter` directive string for tracing init
    /// - `CRY_SCRATCH_BASE` / `CRY23_SCRDIR`: scratch directory base (see
    ///   [`crate::orchestrator::scratch::scratch_base`])
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("DFT_CORE_DB_PATH").ok().map(PathBuf::from),
            log_filter: std::env::var("DFT_CORE_LOG").ok(),
            scratch_base: Some(scratch_base(None)),
        }
    }

    /// The database path with no fallback beyond what `from_env` resolved;
    /// callers needing a concrete path for `SqliteJobStore::open` decide how
    /// to handle `None` themselves (in-memory store, error, or a default).
    pub fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    /// The resolved scratch base, falling back to the same chain
    /// [`crate::orchestrator::scratch::scratch_base`] uses directly.
    pub fn scratch_base(&self) -> PathBuf {
        self.scratch_base.clone().unwrap_or_else(|| scratch_base(None))
    }
}

/// Installs a `tracing` subscriber reading `DFT_CORE_LOG` (falling back to
/// `RUST_LOG`, then `"info"`) exactly once per process. Safe to call from
/// multiple test modules or an embedding binary's `main`; subsequent calls
/// after the first are no-ops.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = std::env::var("DFT_CORE_LOG")
            .ok()
            .and_then(|f| tracing_subscriber::EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| {
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
            });
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn from_env_defaults_to_none_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("DFT_CORE_DB_PATH");
        std::env::remove_var("DFT_CORE_LOG");
        let config = Config::from_env();
        assert!(config.db_path().is_none());
        assert!(config.log_filter.is_none());
    }

    #[test]
    fn from_env_reads_db_path_and_log_filter() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DFT_CORE_DB_PATH", "/tmp/dft-core-test.db");
        std::env::set_var("DFT_CORE_LOG", "dft_core=debug");
        let config = Config::from_env();
        assert_eq!(config.db_path(), Some(&PathBuf::from("/tmp/dft-core-test.db")));
        assert_eq!(config.log_filter.as_deref(), Some("dft_core=debug"));
        std::env::remove_var("DFT_CORE_DB_PATH");
        std::env::remove_var("DFT_CORE_LOG");
    }

    #[test]
    fn scratch_base_falls_back_to_temp_dir_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("CRY_SCRATCH_BASE");
        std::env::remove_var("CRY23_SCRDIR");
        let config = Config::from_env();
        assert_eq!(config.scratch_base(), std::env::temp_dir());
    }
}
