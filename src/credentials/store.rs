//! Credential bundle persistence — the single owner of authentication
//! material on disk.
//!
//! Bundles live at `credentials/<service>/<account>.json` (the implicit
//! single account persists as `default.json`).  Cookies are kept as raw JSON
//! values rather than a typed struct: CDP cookie fields drift across browser
//! versions, and a partially-unknown cookie must survive a round trip.
//!
//! The acquisition timestamp is owned by this module's callers and is only
//! advanced after a successful reachability check — saving a bundle is the
//! acquirer's last step, never its first.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::core::config::ServicePolicy;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::CredentialStatus;
use crate::zones::layout::ZoneLayout;

/// Account name used on disk for services with no declared accounts.
pub const IMPLICIT_ACCOUNT: &str = "default";

/// Persisted authentication material for one (service, account) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialBundle {
    /// Raw cookie objects (CDP shape: name, value, domain, path, expires,
    /// secure, sameSite, ...).
    #[serde(default)]
    pub cookies: Vec<serde_json::Value>,
    pub acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub strategy: String,
}

impl CredentialBundle {
    pub fn new(strategy: &str, cookies: Vec<serde_json::Value>) -> Self {
        Self {
            cookies,
            acquired_at: Utc::now(),
            refresh_token: None,
            strategy: strategy.to_string(),
        }
    }

    /// Render the jar as a `Cookie:` request header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .filter_map(|c| {
                let name = c.get("name")?.as_str()?;
                let value = c.get("value")?.as_str()?;
                Some(format!("{}={}", name, value))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Domain filter
// ─────────────────────────────────────────────────────────────────────────────

/// Whether `cookie_domain` belongs to one of the service's declared domains.
///
/// Cookie domains may carry a leading dot and arbitrary subdomains:
/// `.accounts.spotify.com` suffix-matches a declared `spotify.com`, while
/// `notspotify.com` does not (the match must land on a label boundary).
pub fn domain_matches(cookie_domain: &str, declared: &str) -> bool {
    let cookie = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
    let declared = declared.trim_start_matches('.').to_ascii_lowercase();
    cookie == declared || cookie.ends_with(&format!(".{}", declared))
}

/// Keep only cookies whose domain suffix-matches one of `domains`.  Cookies
/// without a parseable domain field are dropped — a cookie this module
/// cannot attribute to the service must not be persisted.
pub fn filter_cookies(
    cookies: Vec<serde_json::Value>,
    domains: &[String],
) -> Vec<serde_json::Value> {
    let before = cookies.len();
    let kept: Vec<serde_json::Value> = cookies
        .into_iter()
        .filter(|c| {
            c.get("domain")
                .and_then(|d| d.as_str())
                .map(|d| domains.iter().any(|declared| domain_matches(d, declared)))
                .unwrap_or(false)
        })
        .collect();
    if kept.len() < before {
        info!(
            "credential store: domain filter kept {}/{} cookies",
            kept.len(),
            before
        );
    }
    kept
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CredentialStore {
    layout: ZoneLayout,
}

impl CredentialStore {
    pub fn new(layout: ZoneLayout) -> Self {
        Self { layout }
    }

    pub fn bundle_path(&self, service: &str, account: Option<&str>) -> PathBuf {
        self.layout
            .credentials_dir(service)
            .join(format!("{}.json", account.unwrap_or(IMPLICIT_ACCOUNT)))
    }

    /// Load the bundle for a (service, account) pair.
    pub fn load(
        &self,
        service: &str,
        account: Option<&str>,
    ) -> PipelineResult<Option<CredentialBundle>> {
        let path = self.bundle_path(service, account);
        let contents = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::path(&path, format!("read failed: {}", e))),
        };
        match serde_json::from_str::<CredentialBundle>(&contents) {
            Ok(b) => Ok(Some(b)),
            Err(e) => {
                warn!(
                    "credential store: unparseable bundle at {}: {} — treating as missing",
                    path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Persist a bundle atomically (temp + rename), applying the service's
    /// domain filter first.  Refuses to persist an all-foreign cookie jar —
    /// that is an acquisition bug, not a save.
    pub fn save(
        &self,
        service: &str,
        account: Option<&str>,
        mut bundle: CredentialBundle,
        declared_domains: &[String],
    ) -> PipelineResult<()> {
        if !declared_domains.is_empty() {
            let had_cookies = !bundle.cookies.is_empty();
            bundle.cookies = filter_cookies(std::mem::take(&mut bundle.cookies), declared_domains);
            if had_cookies && bundle.cookies.is_empty() && bundle.refresh_token.is_none() {
                return Err(PipelineError::AuthFailed {
                    service: service.to_string(),
                    reason: "no cookie matched the service's declared domains".into(),
                });
            }
        }

        let path = self.bundle_path(service, account);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::path(parent, format!("create failed: {}", e)))?;
        }
        let json = serde_json::to_string_pretty(&bundle)
            .map_err(|e| PipelineError::path(&path, format!("serialize failed: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .map_err(|e| PipelineError::path(&tmp, format!("write failed: {}", e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| PipelineError::path(&path, format!("rename failed: {}", e)))?;

        info!(
            "credential store: 🍪 saved bundle for {}/{} ({} cookies)",
            service,
            account.unwrap_or(IMPLICIT_ACCOUNT),
            bundle.cookies.len()
        );
        Ok(())
    }

    /// Age of the stored bundle, when one exists.
    pub fn age(&self, service: &str, account: Option<&str>) -> PipelineResult<Option<Duration>> {
        Ok(self
            .load(service, account)?
            .map(|b| Utc::now() - b.acquired_at))
    }

    /// Status computed from age vs the service policy.
    pub fn status(
        &self,
        service: &str,
        account: Option<&str>,
        policy: &ServicePolicy,
    ) -> PipelineResult<CredentialStatus> {
        let Some(age) = self.age(service, account)? else {
            return Ok(CredentialStatus::Missing);
        };
        let age_days = age.num_seconds() as f64 / 86_400.0;
        if age_days >= policy.max_credential_age_days as f64 {
            Ok(CredentialStatus::Expired)
        } else if age_days >= policy.refresh_threshold_days as f64 {
            Ok(CredentialStatus::ExpiringSoon)
        } else {
            Ok(CredentialStatus::Valid)
        }
    }

    /// Remove the stored bundle so the next acquisition starts interactive.
    pub fn invalidate(&self, service: &str, account: Option<&str>) {
        let path = self.bundle_path(service, account);
        if path.exists() {
            match std::fs::remove_file(&path) {
                Ok(()) => info!(
                    "credential store: 🗑️  removed stale bundle for {}/{}",
                    service,
                    account.unwrap_or(IMPLICIT_ACCOUNT)
                ),
                Err(e) => warn!(
                    "credential store: failed to remove {}: {}",
                    path.display(),
                    e
                ),
            }
        }
    }
}
