//! The system-wide orchestration lock.
//!
//! An advisory exclusive lock over `state/orchestrator.lock` guarantees at
//! most one orchestration pass per project root, across processes.  A second
//! `pipeline run` (or scheduler tick) observes contention immediately and
//! exits with the well-known code instead of blocking.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::core::errors::{PipelineError, PipelineResult};
use crate::zones::layout::ZoneLayout;

/// Exit code for a `pipeline run` that found another run in flight.
pub const EXIT_LOCK_HELD: i32 = 10;

pub struct OrchestratorLock {
    file: File,
    path: PathBuf,
}

impl OrchestratorLock {
    /// Try to take the lock.  `Ok(None)` means another run holds it.
    pub fn try_acquire(layout: &ZoneLayout) -> PipelineResult<Option<Self>> {
        let state_dir = layout.state_dir();
        std::fs::create_dir_all(&state_dir)
            .map_err(|e| PipelineError::path(&state_dir, format!("create failed: {}", e)))?;

        let path = layout.lock_path();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| PipelineError::path(&path, format!("lock open failed: {}", e)))?;

        if fs2::FileExt::try_lock_exclusive(&file).is_err() {
            debug!("orchestrator lock held at {}", path.display());
            return Ok(None);
        }

        // Advisory content for operators; the flock is the actual guard.
        let info = format!(
            "pid={}\nacquired_at={}\n",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        if let Err(e) = file.set_len(0).and_then(|_| file.write_all(info.as_bytes())) {
            warn!("orchestrator lock annotate failed: {}", e);
        }

        Ok(Some(Self { file, path }))
    }
}

impl Drop for OrchestratorLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!("orchestrator lock release failed at {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquisition_is_refused_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ZoneLayout::new(tmp.path());

        let first = OrchestratorLock::try_acquire(&layout).unwrap();
        assert!(first.is_some());

        let second = OrchestratorLock::try_acquire(&layout).unwrap();
        assert!(second.is_none(), "lock must be exclusive");

        drop(first);
        let third = OrchestratorLock::try_acquire(&layout).unwrap();
        assert!(third.is_some(), "lock must be reacquirable after release");
    }
}
