//! Service orchestration: discovery → session → extractors → cleaners.
//!
//! One orchestration pass walks every discovered service in priority order,
//! runs its extractor units (behind an acquired session when the service
//! declares auth), then its three cleaner stages in fixed order.  Services
//! run concurrently up to the configured cap; a unit's failure flags its
//! service and never touches any other service.
//!
//! The pass is guarded by the system-wide lock file; a concurrent trigger
//! observes [`RunSummary::AlreadyRunning`] and exits with
//! [`lockfile::EXIT_LOCK_HELD`].

pub mod lockfile;
pub mod retry;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::context::RuntimeContext;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{
    OrchestratorReport, RunOutcome, RunRecord, RunStage, ServiceRunReport, UnitReport,
};
use crate::credentials::acquirer::{Session, SessionAcquirer};
use crate::services::contracts::{Cleaner, Extractor, ProcessCleaner, ProcessExtractor, UnitContext};
use crate::services::registry::{discover_services, CleanerStage, ServiceSpec};
use crate::zones::engine::{PromotionEngine, ValidationVerdict};
use crate::zones::layout::{Zone, ZoneLayout};

pub use lockfile::{OrchestratorLock, EXIT_LOCK_HELD};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the pass to these services; `None` runs everything.
    pub services: Option<Vec<String>>,
    pub no_extractors: bool,
    pub no_cleaners: bool,
}

#[derive(Debug)]
pub enum RunSummary {
    Completed(OrchestratorReport),
    /// Another orchestration pass holds the lock.
    AlreadyRunning,
}

pub struct Orchestrator {
    ctx: RuntimeContext,
    layout: ZoneLayout,
    engine: PromotionEngine,
    acquirer: Arc<SessionAcquirer>,
}

impl Orchestrator {
    pub fn new(ctx: RuntimeContext) -> Self {
        let layout = ZoneLayout::new(ctx.project_root.clone());
        Self {
            engine: PromotionEngine::new(layout.clone()),
            acquirer: Arc::new(SessionAcquirer::new(ctx.clone(), layout.clone())),
            layout,
            ctx,
        }
    }

    pub fn acquirer(&self) -> Arc<SessionAcquirer> {
        Arc::clone(&self.acquirer)
    }

    pub fn engine(&self) -> &PromotionEngine {
        &self.engine
    }

    pub fn layout(&self) -> &ZoneLayout {
        &self.layout
    }

    /// Execute one orchestration pass.
    pub async fn run(&self, opts: &RunOptions) -> PipelineResult<RunSummary> {
        let Some(_lock) = OrchestratorLock::try_acquire(&self.layout)? else {
            return Ok(RunSummary::AlreadyRunning);
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let services = self.select_services(opts)?;
        info!(
            "orchestrator: run {} over {} service(s), concurrency {}",
            run_id,
            services.len(),
            self.ctx.concurrency_max
        );

        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

        let results: Vec<(ServiceRunReport, Vec<RunRecord>)> = stream::iter(services)
            .map(|spec| {
                let cancel = cancel_rx.clone();
                async move { self.run_service(spec, opts, run_id, cancel).await }
            })
            .buffer_unordered(self.ctx.concurrency_max)
            .collect()
            .await;

        let mut reports = Vec::new();
        let mut records = Vec::new();
        for (report, mut recs) in results {
            reports.push(report);
            records.append(&mut recs);
        }
        // Deterministic report order regardless of completion order.
        reports.sort_by(|a, b| a.service.cmp(&b.service));

        self.persist_run_records(&records);
        self.prune_run_records();

        let classification = OrchestratorReport::classify(&reports);
        let report = OrchestratorReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            services: reports,
            classification,
        };
        info!(
            "orchestrator: run {} finished — {:?} ({} service(s) reached curated)",
            run_id,
            classification,
            report.services.iter().filter(|s| s.reached_curated).count()
        );
        Ok(RunSummary::Completed(report))
    }

    fn select_services(&self, opts: &RunOptions) -> PipelineResult<Vec<ServiceSpec>> {
        let all = discover_services(&self.ctx.project_root, &self.ctx.config)?;
        let Some(wanted) = &opts.services else {
            return Ok(all);
        };
        for name in wanted {
            if !all.iter().any(|s| &s.name == name) {
                warn!("orchestrator: requested service '{}' was not discovered", name);
            }
        }
        Ok(all
            .into_iter()
            .filter(|s| wanted.iter().any(|w| w == &s.name))
            .collect())
    }

    // ── Per-service execution ───────────────────────────────────────────────

    async fn run_service(
        &self,
        spec: ServiceSpec,
        opts: &RunOptions,
        run_id: Uuid,
        cancel: tokio::sync::watch::Receiver<bool>,
    ) -> (ServiceRunReport, Vec<RunRecord>) {
        let mut report = ServiceRunReport::new(&spec.name);
        let mut records = Vec::new();
        let unit_ctx = UnitContext {
            ctx: self.ctx.clone(),
            layout: self.layout.clone(),
            service: spec.name.clone(),
            cancel,
        };

        let mut session: Option<Session> = None;
        if !opts.no_extractors && !spec.extractors.is_empty() {
            session = self
                .acquire_session(&spec, run_id, &mut report, &mut records)
                .await;
            let auth_blocked = spec.policy.requires_auth && session.is_none();
            if auth_blocked {
                warn!(
                    "orchestrator: {} extractors skipped — no session",
                    spec.name
                );
            } else {
                self.run_extractors(&spec, &unit_ctx, session.as_ref(), run_id, &mut report, &mut records)
                    .await;
            }
        }

        if !opts.no_cleaners {
            self.run_cleaners(&spec, &unit_ctx, run_id, &mut report, &mut records)
                .await;
        }

        (report, records)
    }

    async fn acquire_session(
        &self,
        spec: &ServiceSpec,
        run_id: Uuid,
        report: &mut ServiceRunReport,
        records: &mut Vec<RunRecord>,
    ) -> Option<Session> {
        if !spec.policy.requires_auth {
            return None;
        }
        let account = spec.policy.accounts.first().cloned();
        let started = Utc::now();
        match self.acquirer.acquire(&spec.name, account.as_deref()).await {
            Ok(session) => {
                push_outcome(
                    report,
                    records,
                    run_id,
                    &spec.name,
                    account,
                    "session",
                    RunStage::SessionAcquire,
                    started,
                    RunOutcome::Success,
                    None,
                    None,
                );
                Some(session)
            }
            Err(e) => {
                report.failed = true;
                push_outcome(
                    report,
                    records,
                    run_id,
                    &spec.name,
                    account,
                    "session",
                    RunStage::SessionAcquire,
                    started,
                    RunOutcome::Failed,
                    Some(e.kind().to_string()),
                    Some(e.to_string()),
                );
                None
            }
        }
    }

    async fn run_extractors(
        &self,
        spec: &ServiceSpec,
        unit_ctx: &UnitContext,
        session: Option<&Session>,
        run_id: Uuid,
        report: &mut ServiceRunReport,
        records: &mut Vec<RunRecord>,
    ) {
        let retry_cfg = &self.ctx.config.retry;
        let mut upstream_down = false;

        let run_one = |extractor: ProcessExtractor| async move {
            let label = format!("{}/{}", spec.name, extractor.name());
            retry::with_retries(retry_cfg, &label, || extractor.run(unit_ctx, session)).await
        };

        if spec.policy.extractors_parallel {
            let outcomes: Vec<(String, chrono::DateTime<Utc>, PipelineResult<_>)> =
                stream::iter(spec.extractors.clone())
                    .map(|unit| {
                        let name = unit.name.clone();
                        let started = Utc::now();
                        let fut = run_one(ProcessExtractor { unit });
                        async move { (name, started, fut.await) }
                    })
                    .buffer_unordered(spec.extractors.len().max(1))
                    .collect()
                    .await;
            for (name, started, result) in outcomes {
                self.record_extractor(result, &name, started, run_id, spec, report, records);
            }
        } else {
            for unit in &spec.extractors {
                if upstream_down {
                    push_outcome(
                        report,
                        records,
                        run_id,
                        &spec.name,
                        None,
                        &unit.name,
                        RunStage::Extract,
                        Utc::now(),
                        RunOutcome::Skipped,
                        Some("upstream_unavailable".to_string()),
                        Some("skipped: upstream reported unavailable this cycle".to_string()),
                    );
                    continue;
                }
                let started = Utc::now();
                let result = run_one(ProcessExtractor { unit: unit.clone() }).await;
                if matches!(result, Err(PipelineError::UpstreamUnavailable { .. })) {
                    upstream_down = true;
                }
                self.record_extractor(result, &unit.name, started, run_id, spec, report, records);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_extractor(
        &self,
        result: PipelineResult<crate::services::contracts::ExtractorResult>,
        name: &str,
        started: chrono::DateTime<Utc>,
        run_id: Uuid,
        spec: &ServiceSpec,
        report: &mut ServiceRunReport,
        records: &mut Vec<RunRecord>,
    ) {
        match result {
            Ok(_) => push_outcome(
                report,
                records,
                run_id,
                &spec.name,
                None,
                name,
                RunStage::Extract,
                started,
                RunOutcome::Success,
                None,
                None,
            ),
            Err(e) => {
                report.failed = true;
                push_outcome(
                    report,
                    records,
                    run_id,
                    &spec.name,
                    None,
                    name,
                    RunStage::Extract,
                    started,
                    RunOutcome::Failed,
                    Some(e.kind().to_string()),
                    Some(e.to_string()),
                );
            }
        }
    }

    async fn run_cleaners(
        &self,
        spec: &ServiceSpec,
        unit_ctx: &UnitContext,
        run_id: Uuid,
        report: &mut ServiceRunReport,
        records: &mut Vec<RunRecord>,
    ) {
        for stage in CleanerStage::ALL {
            let started = Utc::now();
            let unit_name = spec
                .cleaner_for(stage)
                .map(|c| c.unit.name.clone())
                .unwrap_or_else(|| stage.token().to_string());

            let result = match stage {
                CleanerStage::Landing2Raw => self.stage_landing2raw(spec, unit_ctx).await,
                CleanerStage::Raw2Staging => self.stage_raw2staging(spec, unit_ctx).await,
                CleanerStage::Staging2Curated => self.stage_staging2curated(spec, unit_ctx).await,
            };

            match result {
                Ok(StageOutcome::Done(detail)) => {
                    if stage == CleanerStage::Staging2Curated {
                        report.reached_curated = true;
                    }
                    push_outcome(
                        report,
                        records,
                        run_id,
                        &spec.name,
                        None,
                        &unit_name,
                        stage_to_run_stage(stage),
                        started,
                        RunOutcome::Success,
                        None,
                        detail,
                    );
                }
                Ok(StageOutcome::NothingToDo(reason)) => {
                    // A service with no curated stage is complete once its
                    // declared stages succeeded.
                    if stage == CleanerStage::Staging2Curated && !report.failed {
                        report.reached_curated = true;
                    }
                    push_outcome(
                        report,
                        records,
                        run_id,
                        &spec.name,
                        None,
                        &unit_name,
                        stage_to_run_stage(stage),
                        started,
                        RunOutcome::Skipped,
                        None,
                        Some(reason),
                    );
                }
                Err(e) => {
                    report.failed = true;
                    let abort = !matches!(e, PipelineError::SchemaChanged { .. });
                    push_outcome(
                        report,
                        records,
                        run_id,
                        &spec.name,
                        None,
                        &unit_name,
                        stage_to_run_stage(stage),
                        started,
                        RunOutcome::Failed,
                        Some(e.kind().to_string()),
                        Some(e.to_string()),
                    );
                    if abort {
                        warn!(
                            "orchestrator: {} aborting remaining stages after {}: {}",
                            spec.name, stage, e
                        );
                        break;
                    }
                }
            }
        }
    }

    // ── Stage implementations ───────────────────────────────────────────────

    async fn stage_landing2raw(
        &self,
        spec: &ServiceSpec,
        unit_ctx: &UnitContext,
    ) -> PipelineResult<StageOutcome> {
        let pending = self.engine.pending_landing_files(&spec.name)?;

        // Validate pending files through the service's landing2raw unit when
        // one exists; one file per invocation so a schema break in one file
        // never blocks its siblings.  Keyed by zone-relative path — equal
        // basenames under different subpaths carry independent verdicts.
        let mut verdicts: HashMap<std::path::PathBuf, ValidationVerdict> = HashMap::new();
        if let Some(cleaner_spec) = spec.cleaner_for(CleanerStage::Landing2Raw) {
            let cleaner = ProcessCleaner {
                spec: cleaner_spec.clone(),
            };
            for file in &pending {
                let label = format!("{}/{}", spec.name, cleaner.name());
                let result = retry::with_retries(&self.ctx.config.retry, &label, || {
                    cleaner.run(unit_ctx, std::slice::from_ref(file))
                })
                .await;
                let verdict = match result {
                    Ok(_) => ValidationVerdict::Ok,
                    Err(PipelineError::SchemaChanged { reason, .. }) => {
                        ValidationVerdict::SchemaChanged(reason)
                    }
                    Err(e) => ValidationVerdict::Rejected(e.to_string()),
                };
                verdicts.insert(file.rel_path.clone(), verdict);
            }
        }

        let report = self.engine.promote_landing_to_raw(&spec.name, |f| {
            verdicts
                .get(&f.rel_path)
                .cloned()
                .unwrap_or(ValidationVerdict::Ok)
        })?;

        Ok(StageOutcome::Done(Some(format!(
            "{} promoted, {} skipped, {} quarantined, {} errored",
            report.promoted, report.skipped, report.quarantined, report.errored
        ))))
    }

    async fn stage_raw2staging(
        &self,
        spec: &ServiceSpec,
        unit_ctx: &UnitContext,
    ) -> PipelineResult<StageOutcome> {
        let Some(cleaner_spec) = spec.cleaner_for(CleanerStage::Raw2Staging) else {
            return Ok(StageOutcome::NothingToDo("no raw2staging unit".into()));
        };
        let cleaner = ProcessCleaner {
            spec: cleaner_spec.clone(),
        };
        let inputs =
            self.layout
                .list_files(Zone::Raw, &spec.name, &spec.policy.raw2staging_glob)?;
        if inputs.is_empty() {
            return Ok(StageOutcome::NothingToDo("raw zone is empty".into()));
        }

        let label = format!("{}/{}", spec.name, cleaner.name());
        match retry::with_retries(&self.ctx.config.retry, &label, || {
            cleaner.run(unit_ctx, &inputs)
        })
        .await
        {
            Ok(r) => Ok(StageOutcome::Done(Some(format!(
                "{} input file(s) transformed",
                r.outcomes.len()
            )))),
            Err(e @ PipelineError::SchemaChanged { .. }) => {
                let reason = e.to_string();
                self.engine.quarantine_files(&spec.name, &inputs, &reason)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn stage_staging2curated(
        &self,
        spec: &ServiceSpec,
        unit_ctx: &UnitContext,
    ) -> PipelineResult<StageOutcome> {
        let Some(cleaner_spec) = spec.cleaner_for(CleanerStage::Staging2Curated) else {
            return Ok(StageOutcome::NothingToDo("no staging2curated unit".into()));
        };
        let cleaner = ProcessCleaner {
            spec: cleaner_spec.clone(),
        };
        let inputs = self.layout.list_files(
            Zone::Staging,
            &spec.name,
            &spec.policy.staging2curated_glob,
        )?;
        if inputs.is_empty() {
            return Ok(StageOutcome::NothingToDo("staging zone is empty".into()));
        }

        let label = format!("{}/{}", spec.name, cleaner.name());
        let cleaner_report = retry::with_retries(&self.ctx.config.retry, &label, || {
            cleaner.run(unit_ctx, &inputs)
        })
        .await?;

        if cleaner_report.candidates.is_empty() {
            return Ok(StageOutcome::Done(Some("no candidates produced".into())));
        }

        let mut details = Vec::new();
        for (candidate, final_name) in &cleaner_report.candidates {
            let outcome = self
                .engine
                .refresh_curated(&spec.name, candidate, final_name)?;
            details.push(format!("{}: {:?}", final_name, outcome));
        }
        Ok(StageOutcome::Done(Some(details.join(", "))))
    }

    // ── Run-record persistence ──────────────────────────────────────────────

    fn persist_run_records(&self, records: &[RunRecord]) {
        if records.is_empty() {
            return;
        }
        let dir = self.layout.run_records_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("run records dir create failed at {}: {}", dir.display(), e);
            return;
        }
        let path = dir.join(format!("{}.ndjson", Utc::now().format("%Y%m%d")));
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                for record in records {
                    if let Ok(line) = serde_json::to_string(record) {
                        writeln!(file, "{}", line)?;
                    }
                }
                Ok(())
            });
        if let Err(e) = result {
            warn!("run records append failed at {}: {}", path.display(), e);
        }
    }

    fn prune_run_records(&self) {
        let retention = self.ctx.config.retention.run_record_retention_days as i64;
        let cutoff = Utc::now() - chrono::Duration::days(retention);
        let cutoff_name = format!("{}.ndjson", cutoff.format("%Y%m%d"));
        let dir = self.layout.run_records_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Lexical comparison works for zero-padded yyyymmdd names.
            if name.ends_with(".ndjson") && name < cutoff_name.as_str() {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("run record prune failed for {}: {}", name, e);
                } else {
                    info!("run records: pruned {}", name);
                }
            }
        }
    }
}

enum StageOutcome {
    Done(Option<String>),
    NothingToDo(String),
}

fn stage_to_run_stage(stage: CleanerStage) -> RunStage {
    match stage {
        CleanerStage::Landing2Raw => RunStage::Landing2Raw,
        CleanerStage::Raw2Staging => RunStage::Raw2Staging,
        CleanerStage::Staging2Curated => RunStage::Staging2Curated,
    }
}

#[allow(clippy::too_many_arguments)]
fn push_outcome(
    report: &mut ServiceRunReport,
    records: &mut Vec<RunRecord>,
    run_id: Uuid,
    service: &str,
    account: Option<String>,
    unit: &str,
    stage: RunStage,
    started_at: chrono::DateTime<Utc>,
    outcome: RunOutcome,
    error_kind: Option<String>,
    detail: Option<String>,
) {
    let finished_at = Utc::now();
    report.units.push(UnitReport {
        unit: unit.to_string(),
        stage,
        outcome,
        error_kind: error_kind.clone(),
        detail: detail.clone(),
        duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
    });
    records.push(RunRecord {
        run_id,
        service: service.to_string(),
        account,
        stage,
        started_at,
        finished_at,
        outcome,
        diagnostics: error_kind
            .into_iter()
            .chain(detail)
            .collect(),
    });
}
