//! Extractor and cleaner contracts, plus the process-boundary runner that
//! adapts on-disk units to them.
//!
//! Units discovered by the registry are external executables.  Each runs in
//! its own process with the project root as working directory and a small
//! injected environment:
//!
//! | variable                   | meaning                                         |
//! |----------------------------|-------------------------------------------------|
//! | `PROJECT_ROOT`             | pipeline root                                   |
//! | `LOG_LEVEL`                | inherited log level                             |
//! | `LAKEWARD_SERVICE`         | owning service name                             |
//! | `LAKEWARD_STAGE`           | `extract` or the cleaner stage token            |
//! | `LAKEWARD_CREDENTIALS_DIR` | this service's credential directory             |
//! | `LAKEWARD_COOKIE_HEADER`   | acquired session cookies (extractors, if any)   |
//! | `LAKEWARD_BEARER_TOKEN`    | acquired bearer token (extractors, if any)      |
//! | `LAKEWARD_INPUT_MANIFEST`  | NDJSON list of input files (cleaners)           |
//! | `LAKEWARD_CANDIDATE_DIR`   | where staging2curated writes candidates         |
//! | `LAKEWARD_STAGING_OUTPUT`  | `replace` or `append_timestamped`               |
//! | `LAKEWARD_RAW_TRANSCODE`   | `preserve` or `csv`                             |
//!
//! Failure protocol (exit codes):
//!
//! * `0`  — success
//! * `20` — `AuthFailed`
//! * `21` — `RateLimited` (retryable)
//! * `22` — `UpstreamUnavailable`
//! * `23` — `SchemaChanged`
//! * any other nonzero — `Transient` for extractors (retryable, the unit may
//!   have died mid-network-call), `CleanerError` for cleaners (aborts the
//!   service's remaining stages)
//!
//! Unit stdout/stderr is captured to `logs/<yyyymmdd>/<service>/<unit>.log`.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::core::context::RuntimeContext;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::credentials::acquirer::Session;
use crate::services::registry::{CleanerSpec, CleanerStage, UnitSpec};
use crate::zones::layout::{FileRecord, ZoneLayout};

// ─────────────────────────────────────────────────────────────────────────────
// Contracts
// ─────────────────────────────────────────────────────────────────────────────

/// Per-invocation context handed to every unit.
pub struct UnitContext {
    pub ctx: RuntimeContext,
    pub layout: ZoneLayout,
    pub service: String,
    /// Flipped by the orchestrator on shutdown; units abandon temp files.
    pub cancel: tokio::sync::watch::Receiver<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractorResult {
    /// Landing files the unit reported writing (informational; the engine
    /// re-enumerates the zone and never trusts this list for promotion).
    pub files_written: Vec<PathBuf>,
    pub diagnostics: Vec<String>,
}

/// An extractor writes new timestamped files under `landing/<service>/` and
/// never modifies anything already present there.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;
    async fn run(
        &self,
        unit_ctx: &UnitContext,
        session: Option<&Session>,
    ) -> PipelineResult<ExtractorResult>;
}

/// Outcome for one input file of a cleaner run.  Retries and quarantines
/// are data, not control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanerOutcome {
    Promoted,
    Skipped,
    Quarantined,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct CleanerReport {
    pub outcomes: Vec<(String, CleanerOutcome)>,
    /// staging2curated only: artifacts produced in the candidate directory,
    /// as (candidate path, final curated basename).  The engine performs the
    /// archive + atomic replace; the cleaner never touches Curated itself.
    pub candidates: Vec<(PathBuf, String)>,
}

/// A cleaner performs one promotion transition.  It reads only the files the
/// engine enumerated for it and writes only inside its declared output zone;
/// it is idempotent — a second run with no new upstream files changes
/// nothing observable.
#[async_trait]
pub trait Cleaner: Send + Sync {
    fn name(&self) -> &str;
    fn stage(&self) -> CleanerStage;
    /// Glob over the input zone, relative to `<zone>/<service>/`.
    fn input_glob(&self) -> &str {
        "**/*"
    }
    async fn run(
        &self,
        unit_ctx: &UnitContext,
        inputs: &[FileRecord],
    ) -> PipelineResult<CleanerReport>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Process-boundary runner
// ─────────────────────────────────────────────────────────────────────────────

/// Line format of `LAKEWARD_INPUT_MANIFEST`.
#[derive(Debug, Serialize)]
struct ManifestLine<'a> {
    path: &'a str,
    basename: &'a str,
    rel_path: &'a str,
}

fn map_exit_code(service: &str, unit: &str, code: i32, cleaner: bool) -> PipelineError {
    match code {
        20 => PipelineError::AuthFailed {
            service: service.to_string(),
            reason: format!("unit {} reported auth failure", unit),
        },
        21 => PipelineError::RateLimited {
            service: service.to_string(),
        },
        22 => PipelineError::UpstreamUnavailable {
            service: service.to_string(),
            reason: format!("unit {} reported upstream outage", unit),
        },
        23 => PipelineError::SchemaChanged {
            service: service.to_string(),
            reason: format!("unit {} reported incompatible input", unit),
        },
        other if cleaner => PipelineError::Cleaner {
            unit: unit.to_string(),
            reason: format!("exit code {}", other),
        },
        other => PipelineError::transient(format!("unit {} exited with code {}", unit, other)),
    }
}

/// Spawn one unit process, enforce the timeout, capture output to the unit
/// log, and map the exit code onto the failure protocol.
async fn run_unit_process(
    unit_ctx: &UnitContext,
    unit: &UnitSpec,
    stage_label: &str,
    timeout: Duration,
    extra_env: Vec<(String, String)>,
    treat_as_cleaner: bool,
) -> PipelineResult<()> {
    let mut cmd = tokio::process::Command::new(&unit.path);
    cmd.current_dir(unit_ctx.ctx.project_root.clone())
        .env("PROJECT_ROOT", &unit_ctx.ctx.project_root)
        .env("LOG_LEVEL", &unit_ctx.ctx.log_level)
        .env("LAKEWARD_SERVICE", &unit_ctx.service)
        .env("LAKEWARD_STAGE", stage_label)
        .env(
            "LAKEWARD_CREDENTIALS_DIR",
            unit_ctx.layout.credentials_dir(&unit_ctx.service),
        )
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in extra_env {
        cmd.env(k, v);
    }
    // Forward declared credential env vars when the parent carries them.
    for key in &unit_ctx.ctx.config.policy(&unit_ctx.service).credential_env {
        if let Ok(v) = std::env::var(key) {
            cmd.env(key, v);
        }
    }

    let mut cancel = unit_ctx.cancel.clone();
    let child = cmd.spawn().map_err(|e| {
        PipelineError::path(&unit.path, format!("unit spawn failed: {}", e))
    })?;

    let output = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(PipelineError::transient(format!(
                    "unit {} wait failed: {}",
                    unit.name, e
                )))
            }
            Err(_) => {
                // kill_on_drop reaps the child; temp-file discipline means
                // nothing partial was committed.
                return Err(PipelineError::transient(format!(
                    "unit {} timed out after {}s",
                    unit.name,
                    timeout.as_secs()
                )));
            }
        },
        _ = cancel.changed() => {
            return Err(PipelineError::transient(format!(
                "unit {} cancelled",
                unit.name
            )));
        }
    };

    write_unit_log(unit_ctx, &unit.name, &output.stdout, &output.stderr).await;

    match output.status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(map_exit_code(
            &unit_ctx.service,
            &unit.name,
            code,
            treat_as_cleaner,
        )),
        None => Err(PipelineError::transient(format!(
            "unit {} killed by signal",
            unit.name
        ))),
    }
}

async fn write_unit_log(unit_ctx: &UnitContext, unit: &str, stdout: &[u8], stderr: &[u8]) {
    let path = unit_ctx
        .layout
        .unit_log_path(chrono::Utc::now(), &unit_ctx.service, unit);
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!("unit log dir create failed at {}: {}", parent.display(), e);
            return;
        }
    }
    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(format!("--- {} ---\n", chrono::Utc::now().to_rfc3339()).as_bytes())
            .await?;
        file.write_all(stdout).await?;
        if !stderr.is_empty() {
            file.write_all(b"--- stderr ---\n").await?;
            file.write_all(stderr).await?;
        }
        std::io::Result::Ok(())
    }
    .await;
    if let Err(e) = result {
        warn!("unit log write failed at {}: {}", path.display(), e);
    }
}

// ── Process extractor ────────────────────────────────────────────────────────

pub struct ProcessExtractor {
    pub unit: UnitSpec,
}

#[async_trait]
impl Extractor for ProcessExtractor {
    fn name(&self) -> &str {
        &self.unit.name
    }

    async fn run(
        &self,
        unit_ctx: &UnitContext,
        session: Option<&Session>,
    ) -> PipelineResult<ExtractorResult> {
        let mut env = Vec::new();
        if let Some(session) = session {
            if !session.cookie_header().is_empty() {
                env.push((
                    "LAKEWARD_COOKIE_HEADER".to_string(),
                    session.cookie_header().to_string(),
                ));
            }
            if let Some(token) = session.bearer_token() {
                env.push(("LAKEWARD_BEARER_TOKEN".to_string(), token.to_string()));
            }
        }
        let timeout = Duration::from_secs(unit_ctx.ctx.config.timeouts.extractor_timeout_sec);
        run_unit_process(unit_ctx, &self.unit, "extract", timeout, env, false).await?;
        Ok(ExtractorResult::default())
    }
}

// ── Process cleaner ──────────────────────────────────────────────────────────

pub struct ProcessCleaner {
    pub spec: CleanerSpec,
}

impl ProcessCleaner {
    fn write_manifest(
        &self,
        unit_ctx: &UnitContext,
        inputs: &[FileRecord],
    ) -> PipelineResult<PathBuf> {
        let dir = unit_ctx.layout.state_dir().join("manifests");
        std::fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::path(&dir, format!("create failed: {}", e)))?;
        let path = dir.join(format!(
            "{}_{}_{}.ndjson",
            unit_ctx.service,
            self.spec.stage.token(),
            uuid::Uuid::new_v4()
        ));
        let mut lines = String::new();
        for record in inputs {
            let line = ManifestLine {
                path: record.path.to_str().unwrap_or_default(),
                basename: &record.basename,
                rel_path: record.rel_path.to_str().unwrap_or_default(),
            };
            lines.push_str(&serde_json::to_string(&line).unwrap_or_default());
            lines.push('\n');
        }
        std::fs::write(&path, lines)
            .map_err(|e| PipelineError::path(&path, format!("write failed: {}", e)))?;
        Ok(path)
    }

    /// Directory the staging2curated unit writes candidates into.
    fn candidate_dir(&self, unit_ctx: &UnitContext) -> PathBuf {
        unit_ctx
            .layout
            .state_dir()
            .join("candidates")
            .join(&unit_ctx.service)
    }
}

#[async_trait]
impl Cleaner for ProcessCleaner {
    fn name(&self) -> &str {
        &self.spec.unit.name
    }

    fn stage(&self) -> CleanerStage {
        self.spec.stage
    }

    async fn run(
        &self,
        unit_ctx: &UnitContext,
        inputs: &[FileRecord],
    ) -> PipelineResult<CleanerReport> {
        let policy = unit_ctx.ctx.config.policy(&unit_ctx.service);
        let manifest = self.write_manifest(unit_ctx, inputs)?;
        let mut env = vec![
            (
                "LAKEWARD_INPUT_MANIFEST".to_string(),
                manifest.to_string_lossy().to_string(),
            ),
            (
                "LAKEWARD_STAGING_OUTPUT".to_string(),
                match policy.staging_output {
                    crate::core::config::StagingOutput::Replace => "replace".to_string(),
                    crate::core::config::StagingOutput::AppendTimestamped => {
                        "append_timestamped".to_string()
                    }
                },
            ),
            (
                "LAKEWARD_RAW_TRANSCODE".to_string(),
                match policy.raw_transcode {
                    crate::core::config::RawTranscode::Preserve => "preserve".to_string(),
                    crate::core::config::RawTranscode::Csv => "csv".to_string(),
                },
            ),
        ];

        let candidate_dir = self.candidate_dir(unit_ctx);
        if self.spec.stage == CleanerStage::Staging2Curated {
            std::fs::create_dir_all(&candidate_dir)
                .map_err(|e| PipelineError::path(&candidate_dir, format!("create failed: {}", e)))?;
            env.push((
                "LAKEWARD_CANDIDATE_DIR".to_string(),
                candidate_dir.to_string_lossy().to_string(),
            ));
        }

        let timeout = Duration::from_secs(unit_ctx.ctx.config.timeouts.cleaner_timeout_sec);
        let run = run_unit_process(unit_ctx, &self.spec.unit, self.spec.stage.token(), timeout, env, true).await;

        if let Err(e) = std::fs::remove_file(&manifest) {
            debug!("manifest cleanup failed at {}: {}", manifest.display(), e);
        }
        run?;

        let mut report = CleanerReport::default();
        for record in inputs {
            report
                .outcomes
                .push((record.basename.clone(), CleanerOutcome::Promoted));
        }

        if self.spec.stage == CleanerStage::Staging2Curated {
            let entries = std::fs::read_dir(&candidate_dir).map_err(|e| {
                PipelineError::path(&candidate_dir, format!("read_dir failed: {}", e))
            })?;
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.starts_with('.') || name.ends_with(".tmp") {
                    continue;
                }
                let name = name.to_string();
                report.candidates.push((path, name));
            }
        }

        Ok(report)
    }
}
