//! Immutable runtime context passed explicitly to every component.
//!
//! Bootstrap is the only place the process environment is read; after
//! `RuntimeContext::bootstrap()` returns, no component touches `std::env`
//! for behavior.  This replaces the per-script global state of the kind of
//! pipeline this engine grew out of: one value, built once, passed down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

use crate::core::config::{self, LakewardConfig};

#[derive(Clone)]
pub struct RuntimeContext {
    pub project_root: PathBuf,
    pub config: Arc<LakewardConfig>,
    pub http_client: reqwest::Client,
    /// Caps concurrent service execution (CONCURRENCY_MAX, default 4).
    pub service_limit: Arc<Semaphore>,
    /// Serializes interactive browser sessions; profiles are per-(service,
    /// account) but only one visible login flow runs at a time.
    pub interactive_lock: Arc<Mutex<()>>,
    pub concurrency_max: usize,
    pub headless_browser: bool,
    pub interactive_allowed: bool,
    pub log_level: String,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("project_root", &self.project_root)
            .field("concurrency_max", &self.concurrency_max)
            .field("headless_browser", &self.headless_browser)
            .field("interactive_allowed", &self.interactive_allowed)
            .finish()
    }
}

impl RuntimeContext {
    /// Build the context from the process environment.  `PROJECT_ROOT` is
    /// required; everything else has defaults.
    pub fn bootstrap() -> anyhow::Result<Self> {
        let root = std::env::var(config::ENV_PROJECT_ROOT).map_err(|_| {
            anyhow::anyhow!(
                "PROJECT_ROOT is not set. Point it at the pipeline root (the directory that holds landing/, raw/, staging/, curated/, archive/)."
            )
        })?;
        let project_root = PathBuf::from(root.trim());
        if !project_root.is_dir() {
            anyhow::bail!(
                "PROJECT_ROOT does not exist or is not a directory: {}",
                project_root.display()
            );
        }

        let log_level = std::env::var(config::ENV_LOG_LEVEL)
            .ok()
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| matches!(v.as_str(), "debug" | "info" | "warn" | "error"))
            .unwrap_or_else(|| "info".to_string());

        Ok(Self::assemble(
            project_root,
            config::env_usize(config::ENV_CONCURRENCY_MAX, 4),
            config::env_bool(config::ENV_HEADLESS_BROWSER, false),
            config::env_bool(config::ENV_INTERACTIVE_ALLOWED, true),
            log_level,
        ))
    }

    /// Context rooted at an explicit directory with defaults for everything
    /// else.  Used by tests and by embedded callers that manage their own
    /// environment.
    pub fn for_root(project_root: impl AsRef<Path>) -> Self {
        Self::assemble(
            project_root.as_ref().to_path_buf(),
            4,
            true,
            false,
            "info".to_string(),
        )
    }

    fn assemble(
        project_root: PathBuf,
        concurrency_max: usize,
        headless_browser: bool,
        interactive_allowed: bool,
        log_level: String,
    ) -> Self {
        let concurrency_max = concurrency_max.max(1);
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            config: Arc::new(config::load_config(&project_root)),
            project_root,
            http_client,
            service_limit: Arc::new(Semaphore::new(concurrency_max)),
            interactive_lock: Arc::new(Mutex::new(())),
            concurrency_max,
            headless_browser,
            interactive_allowed,
            log_level,
        }
    }

    /// Replace the loaded config (tests inject policies directly).
    pub fn with_config(mut self, config: LakewardConfig) -> Self {
        self.config = Arc::new(config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_root_defaults_are_safe_for_tests() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = RuntimeContext::for_root(tmp.path());
        assert_eq!(ctx.concurrency_max, 4);
        assert!(!ctx.interactive_allowed, "tests must never pop a browser");
        assert!(ctx.headless_browser);
    }
}
