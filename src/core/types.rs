use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Run records
// ─────────────────────────────────────────────────────────────────────────────

/// Pipeline stage a run record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    SessionAcquire,
    Extract,
    Landing2Raw,
    Raw2Staging,
    Staging2Curated,
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStage::SessionAcquire => "session_acquire",
            RunStage::Extract => "extract",
            RunStage::Landing2Raw => "landing2raw",
            RunStage::Raw2Staging => "raw2staging",
            RunStage::Staging2Curated => "staging2curated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Skipped,
    Failed,
}

/// Immutable event describing one unit invocation within an orchestration
/// pass.  Persisted as NDJSON under `state/run_records/<yyyymmdd>.ndjson`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    pub stage: RunStage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Promotion reports
// ─────────────────────────────────────────────────────────────────────────────

/// Terminal state of a single Landing file inside one promotion batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileDisposition {
    /// Copied into Raw and indexed.
    Promoted,
    /// Digest already present in the Raw index.
    Skipped,
    /// Moved into `quarantine/<service>/`.
    Quarantined,
    /// I/O error after the single hash retry; retryable next cycle.
    Errored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub basename: String,
    pub disposition: FileDisposition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-batch result of a Landing→Raw promotion pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromotionReport {
    pub promoted: usize,
    pub skipped: usize,
    pub quarantined: usize,
    pub errored: usize,
    #[serde(default)]
    pub outcomes: Vec<FileOutcome>,
}

impl PromotionReport {
    pub fn record(&mut self, basename: &str, disposition: FileDisposition, detail: Option<String>) {
        match disposition {
            FileDisposition::Promoted => self.promoted += 1,
            FileDisposition::Skipped => self.skipped += 1,
            FileDisposition::Quarantined => self.quarantined += 1,
            FileDisposition::Errored => self.errored += 1,
        }
        self.outcomes.push(FileOutcome {
            basename: basename.to_string(),
            disposition,
            detail,
        });
    }
}

/// Result of a Staging→Curated refresh for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CuratedOutcome {
    /// Prior artifact archived, candidate renamed into place.
    Replaced,
    /// Candidate digest equals the current curated digest; discarded.
    NoOp,
    /// First artifact under this name; no archive entry created.
    Created,
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestration reports
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit: String,
    pub stage: RunStage,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRunReport {
    pub service: String,
    pub units: Vec<UnitReport>,
    /// Set when any unit of this service failed; later stages may have been
    /// skipped but other services are unaffected.
    pub failed: bool,
    /// True when the staging2curated stage completed for this service.
    pub reached_curated: bool,
}

impl ServiceRunReport {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            units: Vec::new(),
            failed: false,
            reached_curated: false,
        }
    }
}

/// Aggregate classification for a whole orchestration pass, mapped onto the
/// `pipeline run` exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunClassification {
    /// Every selected service reached Curated.
    Success,
    /// Some, but not all, selected services reached Curated.
    Partial,
    /// No service reached Curated.
    Failure,
}

impl RunClassification {
    pub fn exit_code(self) -> i32 {
        match self {
            RunClassification::Success => 0,
            RunClassification::Partial => 2,
            RunClassification::Failure => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub services: Vec<ServiceRunReport>,
    pub classification: RunClassification,
}

impl OrchestratorReport {
    pub fn classify(services: &[ServiceRunReport]) -> RunClassification {
        let total = services.len();
        let curated = services.iter().filter(|s| s.reached_curated).count();
        if total == 0 || curated == 0 {
            RunClassification::Failure
        } else if curated < total {
            RunClassification::Partial
        } else {
            RunClassification::Success
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Credential status
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Valid,
    ExpiringSoon,
    Expired,
    Missing,
}

impl CredentialStatus {
    /// `credentials check` exit code for this status.
    pub fn exit_code(self) -> i32 {
        match self {
            CredentialStatus::Valid => 0,
            CredentialStatus::ExpiringSoon => 6,
            CredentialStatus::Expired => 7,
            CredentialStatus::Missing => 8,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Health snapshot
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Failed,
}

impl HealthStatus {
    /// `pipeline status` exit code for this overall status.
    pub fn exit_code(self) -> i32 {
        match self {
            HealthStatus::Healthy | HealthStatus::Warning => 0,
            HealthStatus::Critical => 4,
            HealthStatus::Failed => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneFreshness {
    pub zone: String,
    /// Logical timestamp of the newest file in the zone, when any exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_days: Option<f64>,
    pub file_count: usize,
}

/// One ordered reason data is not reaching Curated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bottleneck {
    /// Stable machine tag, e.g. `landing_newer_than_raw`.
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CookieRefresh,
    RunExtractor,
    RunCleaners,
}

/// Structured remediation step consumed by the Remediator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    pub priority: ActionPriority,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCredentialStatus {
    pub account: String,
    pub status: CredentialStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_days: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: String,
    pub status: HealthStatus,
    pub health_score: u8,
    pub freshness: Vec<ZoneFreshness>,
    pub credentials: Vec<AccountCredentialStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bottlenecks: Vec<Bottleneck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
}

/// Cross-service status with a remediation plan.  Regenerated on every
/// monitor invocation; prior snapshots are archived, never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub generated_at: DateTime<Utc>,
    pub overall: HealthStatus,
    pub services: Vec<ServiceHealth>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auto_actions: Vec<AutoAction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_exit_codes() {
        assert_eq!(RunClassification::Success.exit_code(), 0);
        assert_eq!(RunClassification::Partial.exit_code(), 2);
        assert_eq!(RunClassification::Failure.exit_code(), 3);
    }

    #[test]
    fn classify_counts_curated_services() {
        let mut a = ServiceRunReport::new("alpha");
        a.reached_curated = true;
        let mut b = ServiceRunReport::new("beta");
        b.failed = true;

        assert_eq!(
            OrchestratorReport::classify(&[a.clone(), b.clone()]),
            RunClassification::Partial
        );
        assert_eq!(
            OrchestratorReport::classify(std::slice::from_ref(&a)),
            RunClassification::Success
        );
        assert_eq!(
            OrchestratorReport::classify(&[b]),
            RunClassification::Failure
        );
        assert_eq!(
            OrchestratorReport::classify(&[]),
            RunClassification::Failure
        );
    }

    #[test]
    fn health_status_orders_worst_last() {
        assert!(HealthStatus::Healthy < HealthStatus::Warning);
        assert!(HealthStatus::Warning < HealthStatus::Critical);
        assert!(HealthStatus::Critical < HealthStatus::Failed);
    }

    #[test]
    fn auto_action_serializes_type_field() {
        let action = AutoAction {
            kind: ActionKind::CookieRefresh,
            service: "spotify".into(),
            account: Some("zonea0".into()),
            priority: ActionPriority::High,
            reason: "credentials expired".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "cookie_refresh");
        assert_eq!(json["priority"], "high");
    }
}
