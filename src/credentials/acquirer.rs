//! Authenticated session acquisition.
//!
//! Produces a ready [`Session`] for a (service, account) pair.  Two paths:
//!
//! * **Silent** — load the stored bundle, prove it still works (probe the
//!   service's health endpoint, inspect JWT expiry, or exchange the OAuth
//!   refresh token), return a session without any human in the loop.
//! * **Interactive** — launch an isolated browser profile at the service's
//!   login URL, wait for the authenticated-URL predicate, extract the
//!   cookie jar (domain-filtered), persist, return a session.
//!
//! Strategy table:
//!
//! | strategy            | silent path                  | on silent failure |
//! |---------------------|------------------------------|-------------------|
//! | oauth               | refresh via refresh token    | interactive       |
//! | token-jwt           | inspect token expiry         | interactive       |
//! | interactive-browser | probe stored cookies         | interactive       |
//!
//! Each (service, account) owns a dedicated browser user-data directory;
//! sessions for different services never share a profile.  Concurrent
//! acquisitions for the same pair are serialized; distinct pairs are
//! independent (the visible login flow itself is additionally serialized
//! process-wide so two browser windows never fight for the operator).

use base64::Engine as _;
use chrono::{DateTime, Utc};
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::config::{AuthStrategy, ServicePolicy};
use crate::core::context::RuntimeContext;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::credentials::store::{CredentialBundle, CredentialStore, IMPLICIT_ACCOUNT};
use crate::zones::layout::ZoneLayout;

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// An acquired authenticated capability.  Extractors consume it as an opaque
/// value; the cookie header / bearer token inside is the only state.
#[derive(Debug, Clone)]
pub struct Session {
    pub service: String,
    pub account: Option<String>,
    pub strategy: AuthStrategy,
    pub acquired_at: DateTime<Utc>,
    cookie_header: String,
    bearer_token: Option<String>,
}

impl Session {
    pub fn cookie_header(&self) -> &str {
        &self.cookie_header
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    fn from_bundle(service: &str, account: Option<&str>, bundle: &CredentialBundle) -> Self {
        Self {
            service: service.to_string(),
            account: account.map(|a| a.to_string()),
            strategy: match bundle.strategy.as_str() {
                "oauth" => AuthStrategy::Oauth,
                "token-jwt" => AuthStrategy::TokenJwt,
                _ => AuthStrategy::InteractiveBrowser,
            },
            acquired_at: bundle.acquired_at,
            cookie_header: bundle.cookie_header(),
            bearer_token: bundle.refresh_token.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JWT expiry inspection
// ─────────────────────────────────────────────────────────────────────────────

/// Extract the `exp` claim (Unix seconds) from a JWT without verifying the
/// signature — expiry inspection only, never trust.
pub fn jwt_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_i64()
}

/// Whether a JWT is still valid with a 60-second clock-skew margin.
pub fn jwt_still_valid(token: &str) -> bool {
    match jwt_expiry(token) {
        Some(exp) => Utc::now().timestamp() < exp - 60,
        None => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Browser executable discovery
// ─────────────────────────────────────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var
/// 2. PATH scan
/// 3. OS-specific well-known install paths
pub fn find_chrome_executable() -> Option<String> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
            "brave-browser",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
            "/usr/bin/brave-browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Acquirer
// ─────────────────────────────────────────────────────────────────────────────

pub struct SessionAcquirer {
    ctx: RuntimeContext,
    store: CredentialStore,
    layout: ZoneLayout,
    /// Serializes acquisition per (service, account); see module docs.
    pair_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionAcquirer {
    pub fn new(ctx: RuntimeContext, layout: ZoneLayout) -> Self {
        Self {
            store: CredentialStore::new(layout.clone()),
            ctx,
            layout,
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    async fn pair_lock(&self, service: &str, account: Option<&str>) -> Arc<Mutex<()>> {
        let key = format!("{}/{}", service, account.unwrap_or(IMPLICIT_ACCOUNT));
        let mut map = self.pair_locks.lock().await;
        map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Acquire a session: silent first, interactive fallback when allowed.
    pub async fn acquire(
        &self,
        service: &str,
        account: Option<&str>,
    ) -> PipelineResult<Session> {
        let lock = self.pair_lock(service, account).await;
        let _pair_guard = lock.lock().await;

        let policy = self.ctx.config.policy(service);
        match self.acquire_silent_inner(service, account, &policy).await {
            Ok(session) => Ok(session),
            Err(silent_err) => {
                debug!(
                    "acquirer: silent path failed for {}/{}: {}",
                    service,
                    account.unwrap_or(IMPLICIT_ACCOUNT),
                    silent_err
                );
                match self
                    .acquire_interactive_inner(service, account, &policy)
                    .await
                {
                    Ok(session) => Ok(session),
                    // Second-factor refusal is more actionable than the
                    // silent failure it would otherwise be masked by.
                    Err(e @ PipelineError::SecondFactorRequired { .. }) => Err(e),
                    Err(_) if matches!(silent_err, PipelineError::UpstreamUnavailable { .. }) => {
                        Err(silent_err)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Silent-only acquisition; never launches a browser.
    pub async fn acquire_silent(
        &self,
        service: &str,
        account: Option<&str>,
    ) -> PipelineResult<Session> {
        let lock = self.pair_lock(service, account).await;
        let _pair_guard = lock.lock().await;
        let policy = self.ctx.config.policy(service);
        self.acquire_silent_inner(service, account, &policy).await
    }

    /// Force a fresh interactive login, ignoring any stored bundle.
    pub async fn refresh_interactive(
        &self,
        service: &str,
        account: Option<&str>,
    ) -> PipelineResult<Session> {
        let lock = self.pair_lock(service, account).await;
        let _pair_guard = lock.lock().await;
        let policy = self.ctx.config.policy(service);
        self.acquire_interactive_inner(service, account, &policy).await
    }

    // ── Silent path ─────────────────────────────────────────────────────────

    async fn acquire_silent_inner(
        &self,
        service: &str,
        account: Option<&str>,
        policy: &ServicePolicy,
    ) -> PipelineResult<Session> {
        let Some(bundle) = self.store.load(service, account)? else {
            return Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: "no stored credentials".into(),
            });
        };

        let age_days = (Utc::now() - bundle.acquired_at).num_seconds() as f64 / 86_400.0;
        if age_days >= policy.max_credential_age_days as f64 {
            return Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: format!(
                    "credentials expired ({:.1} days old, max {})",
                    age_days, policy.max_credential_age_days
                ),
            });
        }

        match policy.strategy {
            AuthStrategy::Oauth => self.silent_oauth(service, account, policy, bundle).await,
            AuthStrategy::TokenJwt => self.silent_jwt(service, account, policy, bundle).await,
            AuthStrategy::InteractiveBrowser => {
                self.silent_cookie_probe(service, account, policy, bundle).await
            }
        }
    }

    async fn silent_cookie_probe(
        &self,
        service: &str,
        account: Option<&str>,
        policy: &ServicePolicy,
        bundle: CredentialBundle,
    ) -> PipelineResult<Session> {
        if bundle.cookies.is_empty() {
            return Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: "stored bundle has no cookies".into(),
            });
        }
        let session = Session::from_bundle(service, account, &bundle);
        self.probe(service, policy, &session).await?;
        info!(
            "acquirer: silent cookie session ready for {}/{}",
            service,
            account.unwrap_or(IMPLICIT_ACCOUNT)
        );
        Ok(session)
    }

    async fn silent_jwt(
        &self,
        service: &str,
        account: Option<&str>,
        policy: &ServicePolicy,
        bundle: CredentialBundle,
    ) -> PipelineResult<Session> {
        let Some(token) = bundle.refresh_token.as_deref() else {
            return Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: "no stored token".into(),
            });
        };
        if !jwt_still_valid(token) {
            return Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: "stored token expired".into(),
            });
        }
        let session = Session::from_bundle(service, account, &bundle);
        // Expiry is the primary check; the probe catches server-side revocation.
        if policy.health_endpoint.is_some() {
            self.probe(service, policy, &session).await?;
        }
        Ok(session)
    }

    async fn silent_oauth(
        &self,
        service: &str,
        account: Option<&str>,
        policy: &ServicePolicy,
        bundle: CredentialBundle,
    ) -> PipelineResult<Session> {
        let Some(refresh_token) = bundle.refresh_token.clone() else {
            return Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: "no stored refresh token".into(),
            });
        };
        let Some(endpoint) = policy.token_endpoint.as_deref() else {
            return Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: "oauth strategy without token_endpoint".into(),
            });
        };

        let response = self
            .ctx
            .http_client
            .post(endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PipelineError::transient(format!("token refresh failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: format!("refresh token rejected ({})", status),
            });
        }
        if !status.is_success() {
            return Err(PipelineError::UpstreamUnavailable {
                service: service.to_string(),
                reason: format!("token endpoint returned {}", status),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::transient(format!("token response unreadable: {}", e)))?;
        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::AuthFailed {
                service: service.to_string(),
                reason: "token response missing access_token".into(),
            })?
            .to_string();
        let rotated_refresh = body
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or(refresh_token);

        // The successful exchange is the reachability check; only now does
        // the acquisition timestamp advance.
        let refreshed = CredentialBundle {
            cookies: bundle.cookies.clone(),
            acquired_at: Utc::now(),
            refresh_token: Some(rotated_refresh),
            strategy: bundle.strategy.clone(),
        };
        self.store
            .save(service, account, refreshed.clone(), &policy.domains)?;

        let mut session = Session::from_bundle(service, account, &refreshed);
        session.bearer_token = Some(access_token);
        info!(
            "acquirer: oauth refresh succeeded for {}/{}",
            service,
            account.unwrap_or(IMPLICIT_ACCOUNT)
        );
        Ok(session)
    }

    /// Cheap authenticated HEAD (GET fallback) against the health endpoint.
    async fn probe(
        &self,
        service: &str,
        policy: &ServicePolicy,
        session: &Session,
    ) -> PipelineResult<()> {
        let Some(endpoint) = policy.health_endpoint.as_deref() else {
            // No endpoint declared: bundle age is the only freshness signal.
            return Ok(());
        };

        let mut request = self.ctx.http_client.head(endpoint);
        if !session.cookie_header.is_empty() {
            request = request.header(reqwest::header::COOKIE, session.cookie_header.clone());
        }
        if let Some(token) = session.bearer_token() {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                return Err(PipelineError::transient(format!(
                    "health probe failed for {}: {}",
                    service, e
                )))
            }
        };

        match response.status().as_u16() {
            200..=399 => Ok(()),
            401 | 403 => Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: format!("health probe rejected ({})", response.status()),
            }),
            429 => Err(PipelineError::RateLimited {
                service: service.to_string(),
            }),
            code => Err(PipelineError::UpstreamUnavailable {
                service: service.to_string(),
                reason: format!("health probe returned {}", code),
            }),
        }
    }

    // ── Interactive path ────────────────────────────────────────────────────

    async fn acquire_interactive_inner(
        &self,
        service: &str,
        account: Option<&str>,
        policy: &ServicePolicy,
    ) -> PipelineResult<Session> {
        if !self.ctx.interactive_allowed {
            if policy.requires_interactive_second_factor {
                return Err(PipelineError::SecondFactorRequired {
                    service: service.to_string(),
                });
            }
            return Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: "interactive acquisition not permitted (INTERACTIVE_ALLOWED=false)".into(),
            });
        }
        let Some(login_url) = policy.login_url.clone() else {
            return Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: "no login_url declared".into(),
            });
        };

        // One visible login flow at a time, machine-wide.
        let _interactive_guard = self.ctx.interactive_lock.lock().await;

        let timeout = Duration::from_secs(
            self.ctx.config.timeouts.session_acquire_timeout_sec
                + if policy.requires_interactive_second_factor {
                    self.ctx.config.timeouts.second_factor_timeout_sec
                } else {
                    0
                },
        );

        info!(
            "acquirer: starting interactive login for {}/{} at {} (timeout {}s)",
            service,
            account.unwrap_or(IMPLICIT_ACCOUNT),
            login_url,
            timeout.as_secs()
        );

        let flow = self.interactive_flow(service, account, policy, &login_url, timeout);
        match tokio::time::timeout(timeout + Duration::from_secs(15), flow).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: format!("interactive login timed out after {}s", timeout.as_secs()),
            }),
        }
    }

    async fn interactive_flow(
        &self,
        service: &str,
        account: Option<&str>,
        policy: &ServicePolicy,
        login_url: &str,
        timeout: Duration,
    ) -> PipelineResult<Session> {
        let exe = find_chrome_executable().ok_or_else(|| PipelineError::AuthFailed {
            service: service.to_string(),
            reason: "no Chromium-family browser found (set CHROME_EXECUTABLE)".into(),
        })?;

        let profile_dir = self
            .layout
            .browser_profiles_dir(service, account.unwrap_or(IMPLICIT_ACCOUNT));
        std::fs::create_dir_all(&profile_dir)
            .map_err(|e| PipelineError::path(&profile_dir, format!("create failed: {}", e)))?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(&exe)
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-crash-reporter")
            .arg("--mute-audio");
        if !self.ctx.headless_browser {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(|e| PipelineError::AuthFailed {
            service: service.to_string(),
            reason: format!("browser config failed: {}", e),
        })?;

        let (mut browser, mut handler) =
            Browser::launch(config)
                .await
                .map_err(|e| PipelineError::AuthFailed {
                    service: service.to_string(),
                    reason: format!("browser launch failed ({}): {}", exe, e),
                })?;

        let _handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler event error: {}", e);
                }
            }
        });

        let result = self
            .drive_login(service, account, policy, &browser, login_url, timeout)
            .await;

        if let Err(e) = browser.close().await {
            warn!("acquirer: browser close error (non-fatal): {}", e);
        }
        result
    }

    async fn drive_login(
        &self,
        service: &str,
        account: Option<&str>,
        policy: &ServicePolicy,
        browser: &Browser,
        login_url: &str,
        timeout: Duration,
    ) -> PipelineResult<Session> {
        let page = browser
            .new_page(login_url)
            .await
            .map_err(|e| PipelineError::AuthFailed {
                service: service.to_string(),
                reason: format!("failed to open login page: {}", e),
            })?;

        // Wait for the authenticated predicate: the page URL contains the
        // declared hint (post-login redirect target).
        let hint = policy
            .authenticated_url_hint
            .clone()
            .unwrap_or_else(|| login_url.to_string());
        let deadline = tokio::time::Instant::now() + timeout;
        let authenticated = loop {
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(750)).await;
            match page.url().await {
                Ok(Some(current)) => {
                    if policy.authenticated_url_hint.is_some() && current.contains(&hint) {
                        break true;
                    }
                    // Without a hint, leaving the login URL counts as success.
                    if policy.authenticated_url_hint.is_none() && current != login_url {
                        break true;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(PipelineError::AuthFailed {
                        service: service.to_string(),
                        reason: format!("browser transport dropped during login: {}", e),
                    });
                }
            }
        };

        if !authenticated {
            return Err(PipelineError::AuthFailed {
                service: service.to_string(),
                reason: format!(
                    "authenticated predicate not reached within {}s",
                    timeout.as_secs()
                ),
            });
        }

        // The predicate match is the reachability check; extract and persist.
        use chromiumoxide::cdp::browser_protocol::network::GetCookiesParams;
        let cookies = page
            .execute(GetCookiesParams::default())
            .await
            .map_err(|e| PipelineError::AuthFailed {
                service: service.to_string(),
                reason: format!("cookie extraction failed: {}", e),
            })?
            .result
            .cookies;

        let raw: Vec<serde_json::Value> = cookies
            .iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .collect();

        // A service that declares no cookie domains gets the login URL's
        // host as its filter, so foreign cookies still never persist.
        let domains = if policy.domains.is_empty() {
            url::Url::parse(login_url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
                .map(|h| vec![h])
                .unwrap_or_default()
        } else {
            policy.domains.clone()
        };

        let bundle = CredentialBundle::new(&policy.strategy.to_string(), raw);
        self.store.save(service, account, bundle, &domains)?;
        let saved = self
            .store
            .load(service, account)?
            .ok_or_else(|| PipelineError::AuthFailed {
                service: service.to_string(),
                reason: "bundle vanished after save".into(),
            })?;

        info!(
            "acquirer: ✅ interactive login complete for {}/{} ({} cookies kept)",
            service,
            account.unwrap_or(IMPLICIT_ACCOUNT),
            saved.cookies.len()
        );
        Ok(Session::from_bundle(service, account, &saved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::LakewardConfig;
    use serde_json::json;

    fn jwt_with_exp(exp: i64) -> String {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&json!({ "exp": exp })).unwrap());
        format!("{}.{}.sig", header, payload)
    }

    #[test]
    fn jwt_expiry_reads_exp_claim() {
        let exp = Utc::now().timestamp() + 3_600;
        let token = jwt_with_exp(exp);
        assert_eq!(jwt_expiry(&token), Some(exp));
        assert!(jwt_still_valid(&token));
    }

    #[test]
    fn jwt_past_expiry_is_invalid() {
        let token = jwt_with_exp(Utc::now().timestamp() - 10);
        assert!(!jwt_still_valid(&token));
        assert!(!jwt_still_valid("not-a-jwt"));
        assert!(!jwt_still_valid(""));
    }

    fn acquirer_with_policy(policy: ServicePolicy) -> (tempfile::TempDir, SessionAcquirer) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = LakewardConfig::default();
        config.services.insert("svc".to_string(), policy);
        let ctx = RuntimeContext::for_root(tmp.path()).with_config(config);
        let layout = ZoneLayout::new(tmp.path());
        (tmp, SessionAcquirer::new(ctx, layout))
    }

    #[tokio::test]
    async fn silent_acquire_without_bundle_is_auth_failed() {
        let (_tmp, acquirer) = acquirer_with_policy(ServicePolicy::default());
        let err = acquirer.acquire_silent("svc", None).await.unwrap_err();
        assert_eq!(err.kind(), "auth_failed");
    }

    #[tokio::test]
    async fn silent_acquire_with_expired_bundle_is_refused() {
        let policy = ServicePolicy {
            max_credential_age_days: 14,
            domains: vec!["svc.example".to_string()],
            ..Default::default()
        };
        let (_tmp, acquirer) = acquirer_with_policy(policy.clone());

        let mut bundle = CredentialBundle::new(
            "interactive-browser",
            vec![json!({"name": "sid", "value": "x", "domain": ".svc.example"})],
        );
        bundle.acquired_at = Utc::now() - chrono::Duration::days(20);
        acquirer
            .store()
            .save("svc", None, bundle, &policy.domains)
            .unwrap();

        let err = acquirer.acquire_silent("svc", None).await.unwrap_err();
        assert_eq!(err.kind(), "auth_failed");
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn valid_jwt_bundle_acquires_without_network() {
        let policy = ServicePolicy {
            strategy: AuthStrategy::TokenJwt,
            // No health_endpoint: expiry inspection alone decides.
            ..Default::default()
        };
        let (_tmp, acquirer) = acquirer_with_policy(policy);

        let mut bundle = CredentialBundle::new("token-jwt", Vec::new());
        bundle.refresh_token = Some(jwt_with_exp(Utc::now().timestamp() + 7_200));
        acquirer.store().save("svc", None, bundle, &[]).unwrap();

        let session = acquirer.acquire_silent("svc", None).await.unwrap();
        assert_eq!(session.strategy, AuthStrategy::TokenJwt);
        assert!(session.bearer_token().is_some());
    }

    #[tokio::test]
    async fn interactive_disallowed_surfaces_second_factor() {
        let policy = ServicePolicy {
            requires_interactive_second_factor: true,
            login_url: Some("https://svc.example/login".to_string()),
            ..Default::default()
        };
        // RuntimeContext::for_root sets interactive_allowed = false.
        let (_tmp, acquirer) = acquirer_with_policy(policy);
        let err = acquirer.acquire("svc", None).await.unwrap_err();
        assert_eq!(err.kind(), "second_factor_required");
    }
}
