//! Auto-remediation.
//!
//! Consumes a health snapshot's `auto_actions` and executes them through the
//! Orchestrator and Session Acquirer.  Hard rules:
//!
//! * never deletes a file — every invoked unit is idempotent;
//! * never downgrades data — cleaners and extractors only add;
//! * at most one sweep per configured interval, tracked on disk so restarts
//!   do not double-run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::context::RuntimeContext;
use crate::core::errors::PipelineResult;
use crate::core::types::{ActionKind, AutoAction, HealthSnapshot};
use crate::orchestrator::{Orchestrator, RunOptions, RunSummary};

#[derive(Debug, Serialize, Deserialize)]
struct SweepMarker {
    last_sweep_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub executed: usize,
    pub skipped: usize,
    pub failures: Vec<String>,
}

pub struct Remediator {
    ctx: RuntimeContext,
    orchestrator: Arc<Orchestrator>,
}

impl Remediator {
    pub fn new(ctx: RuntimeContext, orchestrator: Arc<Orchestrator>) -> Self {
        Self { ctx, orchestrator }
    }

    fn marker_path(&self) -> std::path::PathBuf {
        self.orchestrator
            .layout()
            .state_dir()
            .join("last_remediation.json")
    }

    fn last_sweep(&self) -> Option<DateTime<Utc>> {
        let contents = std::fs::read_to_string(self.marker_path()).ok()?;
        serde_json::from_str::<SweepMarker>(&contents)
            .ok()
            .map(|m| m.last_sweep_at)
    }

    fn record_sweep(&self) {
        let path = self.marker_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let marker = SweepMarker {
            last_sweep_at: Utc::now(),
        };
        match serde_json::to_string_pretty(&marker) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!("remediator: marker write failed: {}", e);
                }
            }
            Err(e) => warn!("remediator: marker serialize failed: {}", e),
        }
    }

    /// Whether the rate limit currently permits a sweep.
    pub fn sweep_due(&self) -> bool {
        let interval =
            chrono::Duration::minutes(self.ctx.config.scheduler.remediation_interval_minutes as i64);
        match self.last_sweep() {
            Some(last) => Utc::now() - last >= interval,
            None => true,
        }
    }

    /// Execute the snapshot's remediation plan, respecting the rate limit.
    /// Returns `None` when the sweep was rate-limited.
    pub async fn sweep(&self, snapshot: &HealthSnapshot) -> PipelineResult<Option<SweepReport>> {
        if !self.ctx.config.scheduler.remediation_enabled {
            return Ok(None);
        }
        if !self.sweep_due() {
            info!("remediator: sweep rate-limited — skipping");
            return Ok(None);
        }
        self.record_sweep();

        let mut report = SweepReport::default();
        for action in &snapshot.auto_actions {
            match self.execute(action).await {
                Ok(true) => report.executed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(
                        "remediator: {:?} for {} failed: {}",
                        action.kind, action.service, e
                    );
                    report.failures.push(format!(
                        "{:?} {}: {}",
                        action.kind, action.service, e
                    ));
                }
            }
        }
        info!(
            "remediator: sweep complete — {} executed, {} skipped, {} failed",
            report.executed,
            report.skipped,
            report.failures.len()
        );
        Ok(Some(report))
    }

    async fn execute(&self, action: &AutoAction) -> PipelineResult<bool> {
        info!(
            "remediator: {:?} for {} ({})",
            action.kind, action.service, action.reason
        );
        match action.kind {
            ActionKind::CookieRefresh => {
                if !self.ctx.interactive_allowed {
                    info!(
                        "remediator: cookie_refresh for {} needs an operator (INTERACTIVE_ALLOWED=false)",
                        action.service
                    );
                    return Ok(false);
                }
                self.orchestrator
                    .acquirer()
                    .refresh_interactive(&action.service, action.account.as_deref())
                    .await?;
                Ok(true)
            }
            ActionKind::RunExtractor => {
                let summary = self
                    .orchestrator
                    .run(&RunOptions {
                        services: Some(vec![action.service.clone()]),
                        no_extractors: false,
                        no_cleaners: true,
                    })
                    .await?;
                Ok(matches!(summary, RunSummary::Completed(_)))
            }
            ActionKind::RunCleaners => {
                let summary = self
                    .orchestrator
                    .run(&RunOptions {
                        services: Some(vec![action.service.clone()]),
                        no_extractors: true,
                        no_cleaners: false,
                    })
                    .await?;
                Ok(matches!(summary, RunSummary::Completed(_)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::LakewardConfig;

    fn remediator(tmp: &tempfile::TempDir, config: LakewardConfig) -> Remediator {
        let ctx = RuntimeContext::for_root(tmp.path()).with_config(config);
        let orchestrator = Arc::new(Orchestrator::new(ctx.clone()));
        Remediator::new(ctx, orchestrator)
    }

    #[test]
    fn sweep_due_respects_recorded_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let r = remediator(&tmp, LakewardConfig::default());
        assert!(r.sweep_due(), "first sweep is always due");
        r.record_sweep();
        assert!(!r.sweep_due(), "immediately after a sweep, rate-limited");
    }

    #[tokio::test]
    async fn disabled_remediation_never_sweeps() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = LakewardConfig::default();
        config.scheduler.remediation_enabled = false;
        let r = remediator(&tmp, config);

        let snapshot = HealthSnapshot {
            generated_at: Utc::now(),
            overall: crate::core::types::HealthStatus::Warning,
            services: Vec::new(),
            auto_actions: vec![AutoAction {
                kind: ActionKind::RunCleaners,
                service: "gamma".into(),
                account: None,
                priority: crate::core::types::ActionPriority::Medium,
                reason: "landing newer than raw".into(),
            }],
        };
        assert!(r.sweep(&snapshot).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cookie_refresh_without_interactive_is_skipped_not_failed() {
        let tmp = tempfile::tempdir().unwrap();
        // for_root disables interactive.
        let r = remediator(&tmp, LakewardConfig::default());
        let snapshot = HealthSnapshot {
            generated_at: Utc::now(),
            overall: crate::core::types::HealthStatus::Critical,
            services: Vec::new(),
            auto_actions: vec![AutoAction {
                kind: ActionKind::CookieRefresh,
                service: "spotify".into(),
                account: Some("zonea0".into()),
                priority: crate::core::types::ActionPriority::High,
                reason: "credentials expired".into(),
            }],
        };
        let report = r.sweep(&snapshot).await.unwrap().unwrap();
        assert_eq!(report.executed, 0);
        assert_eq!(report.skipped, 1);
        assert!(report.failures.is_empty());
    }
}
