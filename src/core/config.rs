//! File-based config loader (`lakeward.json`) with env-var fallback.
//!
//! Every tunable has three layers, first present wins:
//! 1. the JSON field in `lakeward.json`
//! 2. an environment variable (read once, at bootstrap)
//! 3. a built-in default
//!
//! Service policies (auth strategy, credential ages, accounts, domains) live
//! only in the config file — there is no env fallback for per-service data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ─────────────────────────────────────────────────────────────────────────────
// Service policy
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStrategy {
    /// Refresh token exchange against `token_endpoint`; interactive fallback.
    Oauth,
    /// Inspect stored JWT expiry; interactive fallback.
    TokenJwt,
    /// Probe stored cookies; interactive fallback.
    #[default]
    InteractiveBrowser,
}

impl std::fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthStrategy::Oauth => "oauth",
            AuthStrategy::TokenJwt => "token-jwt",
            AuthStrategy::InteractiveBrowser => "interactive-browser",
        };
        f.write_str(s)
    }
}

/// Whether Raw must mirror Landing bytes exactly or may be transcoded by the
/// landing2raw cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawTranscode {
    /// Raw bytes mirror Landing bytes; the dedup digest is the landing digest.
    #[default]
    Preserve,
    /// The landing2raw cleaner may normalize (e.g. TSV → CSV).
    Csv,
}

/// Whether staging artifacts are retained across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingOutput {
    /// Stable basenames, replaced atomically each run.
    #[default]
    Replace,
    /// One timestamped artifact retained per run.
    AppendTimestamped,
}

/// Per-service configuration.  A service directory with no policy entry gets
/// `ServicePolicy::default()` (no auth, single implicit account).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePolicy {
    pub max_credential_age_days: u32,
    /// Must be ≤ `max_credential_age_days`; ages past this are expiring-soon.
    pub refresh_threshold_days: u32,
    pub strategy: AuthStrategy,
    pub requires_interactive_second_factor: bool,
    /// Empty means exactly one implicit account.
    pub accounts: Vec<String>,
    /// Lower runs first when dependencies permit.
    pub priority: i32,
    /// Cookie domains this service may persist; suffix-matched.
    pub domains: Vec<String>,
    /// Interactive login entry point.
    pub login_url: Option<String>,
    /// Cheap authenticated probe target (HEAD or GET).
    pub health_endpoint: Option<String>,
    /// URL substring that signals a completed login in the browser.
    pub authenticated_url_hint: Option<String>,
    /// OAuth refresh-token exchange endpoint (strategy = oauth).
    pub token_endpoint: Option<String>,
    /// Whether this service requires an acquired session before extraction.
    pub requires_auth: bool,
    pub raw_transcode: RawTranscode,
    pub staging_output: StagingOutput,
    /// Extractors within the service may run concurrently when set.
    pub extractors_parallel: bool,
    /// Names of env vars forwarded into this service's units.
    pub credential_env: Vec<String>,
    /// Input glob the raw2staging cleaner consumes, relative to
    /// `raw/<service>/`.  Declares multi-subpath inputs explicitly instead
    /// of letting the cleaner wander the zone.
    pub raw2staging_glob: String,
    /// Input glob the staging2curated cleaner consumes, relative to
    /// `staging/<service>/`.
    pub staging2curated_glob: String,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            max_credential_age_days: 30,
            refresh_threshold_days: 7,
            strategy: AuthStrategy::default(),
            requires_interactive_second_factor: false,
            accounts: Vec::new(),
            priority: 100,
            domains: Vec::new(),
            login_url: None,
            health_endpoint: None,
            authenticated_url_hint: None,
            token_endpoint: None,
            requires_auth: false,
            raw_transcode: RawTranscode::default(),
            staging_output: StagingOutput::default(),
            extractors_parallel: false,
            credential_env: Vec::new(),
            raw2staging_glob: "**/*".to_string(),
            staging2curated_glob: "**/*".to_string(),
        }
    }
}

impl ServicePolicy {
    /// Account list with the implicit single account materialized.
    pub fn effective_accounts(&self) -> Vec<Option<String>> {
        if self.accounts.is_empty() {
            vec![None]
        } else {
            self.accounts.iter().cloned().map(Some).collect()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timeouts, retries, scheduling, retention
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub extractor_timeout_sec: u64,
    pub cleaner_timeout_sec: u64,
    pub session_acquire_timeout_sec: u64,
    pub second_factor_timeout_sec: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            extractor_timeout_sec: 600,
            cleaner_timeout_sec: 900,
            session_acquire_timeout_sec: 120,
            second_factor_timeout_sec: 300,
        }
    }
}

/// Exponential backoff knobs for `Transient` / `RateLimited` retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub max_elapsed_ms: u64,
    /// Randomization factor in [0, 1]; 0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 30_000,
            max_elapsed_ms: 120_000,
            jitter: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds-resolution cron expression (`sec min hour dom mon dow`).
    pub cron: String,
    /// How often the daemon wakes to check the schedule.
    pub check_interval_sec: u64,
    /// One full Landing→Curated cadence; the monitor uses this to decide
    /// whether Landing is "newer than Raw by more than one promotion cycle".
    pub promotion_cycle_hours: u64,
    /// Minimum spacing between remediation sweeps.
    pub remediation_interval_minutes: u64,
    pub remediation_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 6 * * *".to_string(),
            check_interval_sec: 30,
            promotion_cycle_hours: 24,
            remediation_interval_minutes: 60,
            remediation_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Run records older than this are pruned at orchestrator startup.
    pub run_record_retention_days: u32,
    /// Health snapshots older than this are pruned; the newest always stays.
    pub snapshot_retention_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            run_record_retention_days: 30,
            snapshot_retention_days: 30,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Top-level config
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LakewardConfig {
    pub services: BTreeMap<String, ServicePolicy>,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub retention: RetentionConfig,
    /// Extra extensions recognized as executable units (beyond the exec bit).
    pub unit_extensions: Vec<String>,
}

impl LakewardConfig {
    /// Policy for a service, falling back to defaults for undeclared services.
    pub fn policy(&self, service: &str) -> ServicePolicy {
        self.services.get(service).cloned().unwrap_or_default()
    }

    /// Whether a service declares an auth strategy that needs a session.
    pub fn declares_auth(&self, service: &str) -> bool {
        self.services
            .get(service)
            .map(|p| p.requires_auth)
            .unwrap_or(false)
    }
}

pub const ENV_CONFIG_PATH: &str = "LAKEWARD_CONFIG";

/// Load `lakeward.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `LAKEWARD_CONFIG` env var path
/// 2. `<project_root>/lakeward.json`
/// 3. `./lakeward.json` (process cwd)
/// 4. `~/.lakeward/lakeward.json` (operator-wide fallback)
///
/// Missing file → `LakewardConfig::default()` (silent).
/// Parse error → log a warning, return defaults.
pub fn load_config(project_root: &Path) -> LakewardConfig {
    let mut candidates: Vec<PathBuf> = vec![
        project_root.join("lakeward.json"),
        PathBuf::from("lakeward.json"),
    ];
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".lakeward").join("lakeward.json"));
    }

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<LakewardConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("lakeward.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "lakeward.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return LakewardConfig::default();
                }
            },
            Err(_) => continue, // not found at this path — try next
        }
    }

    LakewardConfig::default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Env helpers (bootstrap only)
// ─────────────────────────────────────────────────────────────────────────────

pub const ENV_PROJECT_ROOT: &str = "PROJECT_ROOT";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_CONCURRENCY_MAX: &str = "CONCURRENCY_MAX";
pub const ENV_HEADLESS_BROWSER: &str = "HEADLESS_BROWSER";
pub const ENV_INTERACTIVE_ALLOWED: &str = "INTERACTIVE_ALLOWED";

pub fn env_bool(key: &str, default: bool) -> bool {
    let Ok(v) = std::env::var(key) else {
        return default;
    };
    let v = v.trim().to_ascii_lowercase();
    if v.is_empty() {
        return default;
    }
    matches!(v.as_str(), "1" | "true" | "yes" | "on")
}

pub fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_has_implicit_account() {
        let policy = ServicePolicy::default();
        assert_eq!(policy.effective_accounts(), vec![None]);
        assert!(policy.refresh_threshold_days <= policy.max_credential_age_days);
    }

    #[test]
    fn declared_accounts_are_preserved_in_order() {
        let policy = ServicePolicy {
            accounts: vec!["zonea0".into(), "pig1987".into()],
            ..Default::default()
        };
        assert_eq!(
            policy.effective_accounts(),
            vec![Some("zonea0".to_string()), Some("pig1987".to_string())]
        );
    }

    #[test]
    fn strategy_round_trips_kebab_case() {
        let json = serde_json::json!({ "strategy": "token-jwt" });
        let policy: ServicePolicy = serde_json::from_value(json).unwrap();
        assert_eq!(policy.strategy, AuthStrategy::TokenJwt);
        assert_eq!(policy.strategy.to_string(), "token-jwt");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let raw = r#"{
            "services": {
                "spotify": {
                    "strategy": "interactive-browser",
                    "requires_auth": true,
                    "accounts": ["zonea0"],
                    "domains": ["spotify.com"],
                    "priority": 10
                }
            },
            "scheduler": { "cron": "0 15 4 * * *" }
        }"#;
        let cfg: LakewardConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.scheduler.cron, "0 15 4 * * *");
        assert_eq!(cfg.scheduler.promotion_cycle_hours, 24);
        let spotify = cfg.policy("spotify");
        assert_eq!(spotify.priority, 10);
        assert_eq!(spotify.max_credential_age_days, 30);
        assert!(cfg.declares_auth("spotify"));
        assert!(!cfg.declares_auth("tiktok"));
    }
}
