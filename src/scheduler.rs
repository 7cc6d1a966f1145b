//! Time-based and on-demand pipeline invocation.
//!
//! The daemon owns three trigger sources:
//!
//! * the configured cron schedule,
//! * manual "run now" requests (CLI or embedded callers via
//!   [`SchedulerHandle`]),
//! * the remediation loop, which turns health-snapshot actions into runs.
//!
//! At most one orchestration pass runs at a time — the orchestrator's lock
//! file guarantees that across processes, and the daemon additionally
//! coalesces triggers that arrive mid-run into a single queued pass.

use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::core::context::RuntimeContext;
use crate::health::{HealthMonitor, Remediator};
use crate::orchestrator::{Orchestrator, RunOptions, RunSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Cron,
    Manual,
    Remediation,
}

/// Cheap cloneable handle for poking the daemon from elsewhere.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Trigger>,
}

impl SchedulerHandle {
    /// Request an immediate orchestration pass.  Returns `false` when the
    /// daemon is gone or its queue is full (a pass is already queued —
    /// coalescing means the request is covered either way).
    pub fn run_now(&self) -> bool {
        self.tx.try_send(Trigger::Manual).is_ok()
    }
}

pub struct Scheduler {
    ctx: RuntimeContext,
    orchestrator: Arc<Orchestrator>,
    monitor: HealthMonitor,
    remediator: Remediator,
    tx: mpsc::Sender<Trigger>,
    rx: mpsc::Receiver<Trigger>,
}

impl Scheduler {
    pub fn new(ctx: RuntimeContext) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(ctx.clone()));
        // Capacity 1: a trigger arriving while one is queued is coalesced.
        let (tx, rx) = mpsc::channel(1);
        Self {
            monitor: HealthMonitor::new(ctx.clone()),
            remediator: Remediator::new(ctx.clone(), Arc::clone(&orchestrator)),
            orchestrator,
            ctx,
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run until a shutdown signal arrives.  Returns `Ok(())` on clean
    /// shutdown.
    pub async fn daemon(mut self) -> anyhow::Result<()> {
        let cron_expr = self.ctx.config.scheduler.cron.clone();
        let schedule = Schedule::from_str(&cron_expr)
            .map_err(|e| anyhow::anyhow!("invalid cron expression '{}': {}", cron_expr, e))?;
        let check_interval = Duration::from_secs(self.ctx.config.scheduler.check_interval_sec.max(1));

        let mut next_execution = schedule.upcoming(chrono::Utc).next();
        info!(
            "scheduler: daemon started (cron '{}', next run {:?})",
            cron_expr, next_execution
        );

        loop {
            let trigger: Option<Trigger> = tokio::select! {
                _ = tokio::time::sleep(check_interval) => {
                    match next_execution {
                        Some(due) if chrono::Utc::now() >= due => {
                            next_execution = schedule.upcoming(chrono::Utc).next();
                            Some(Trigger::Cron)
                        }
                        _ => None,
                    }
                }
                received = self.rx.recv() => received,
                _ = shutdown_signal() => break,
            };

            if let Some(trigger) = trigger {
                self.execute_pass(trigger).await;
                // Coalesce: anything that queued up mid-run collapses into
                // exactly one follow-up pass.
                if self.rx.try_recv().is_ok() {
                    info!("scheduler: coalesced trigger — running one queued pass");
                    self.execute_pass(Trigger::Manual).await;
                }
            }

            self.maybe_remediate().await;
        }

        info!("scheduler: daemon shut down cleanly");
        Ok(())
    }

    async fn execute_pass(&self, trigger: Trigger) {
        info!("scheduler: starting orchestration pass ({:?})", trigger);
        match self.orchestrator.run(&RunOptions::default()).await {
            Ok(RunSummary::Completed(report)) => info!(
                "scheduler: pass finished — {:?}",
                report.classification
            ),
            Ok(RunSummary::AlreadyRunning) => {
                warn!("scheduler: another pass holds the lock — trigger dropped")
            }
            Err(e) => error!("scheduler: orchestration pass failed: {}", e),
        }
    }

    async fn maybe_remediate(&self) {
        if !self.ctx.config.scheduler.remediation_enabled || !self.remediator.sweep_due() {
            return;
        }
        let snapshot = match self.monitor.snapshot() {
            Ok(s) => s,
            Err(e) => {
                warn!("scheduler: health snapshot failed: {}", e);
                return;
            }
        };
        if snapshot.auto_actions.is_empty() {
            return;
        }
        match self.remediator.sweep(&snapshot).await {
            Ok(Some(report)) => info!(
                "scheduler: remediation sweep — {} executed, {} skipped",
                report.executed, report.skipped
            ),
            Ok(None) => {}
            Err(e) => warn!("scheduler: remediation sweep failed: {}", e),
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_coalesces_when_queue_full() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(RuntimeContext::for_root(tmp.path()));
        let handle = scheduler.handle();
        assert!(handle.run_now(), "first trigger queues");
        assert!(!handle.run_now(), "second trigger coalesces into the first");
    }

    #[test]
    fn default_cron_expression_parses() {
        let cfg = crate::core::config::SchedulerConfig::default();
        assert!(Schedule::from_str(&cfg.cron).is_ok());
    }
}
