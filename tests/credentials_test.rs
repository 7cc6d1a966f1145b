//! Credential lifecycle: expiry refuses silent acquisition (S4), domain
//! isolation of persisted bundles (property 6), and the status → exit-code
//! mapping the CLI exposes.

use chrono::{Duration, Utc};
use serde_json::json;

use lakeward::core::config::{AuthStrategy, LakewardConfig, ServicePolicy};
use lakeward::core::types::CredentialStatus;
use lakeward::credentials::store::{domain_matches, CredentialBundle, CredentialStore};
use lakeward::credentials::SessionAcquirer;
use lakeward::zones::ZoneLayout;
use lakeward::RuntimeContext;

fn spotify_policy() -> ServicePolicy {
    ServicePolicy {
        max_credential_age_days: 14,
        refresh_threshold_days: 7,
        strategy: AuthStrategy::InteractiveBrowser,
        requires_auth: true,
        domains: vec!["spotify.com".to_string()],
        ..Default::default()
    }
}

fn acquirer_for(root: &std::path::Path, policy: ServicePolicy) -> SessionAcquirer {
    let mut config = LakewardConfig::default();
    config.services.insert("spotify".to_string(), policy);
    let ctx = RuntimeContext::for_root(root).with_config(config);
    SessionAcquirer::new(ctx, ZoneLayout::new(root))
}

fn bundle_aged(days: i64) -> CredentialBundle {
    let mut bundle = CredentialBundle::new(
        "interactive-browser",
        vec![json!({"name": "sp_dc", "value": "tok", "domain": ".spotify.com"})],
    );
    bundle.acquired_at = Utc::now() - Duration::days(days);
    bundle
}

/// S4 — a bundle older than `max_credential_age_days` refuses silent
/// acquisition, and `credentials check` maps the status to exit 7.
#[tokio::test]
async fn expired_bundle_refuses_silent_acquisition() {
    let tmp = tempfile::tempdir().unwrap();
    let policy = spotify_policy();
    let acquirer = acquirer_for(tmp.path(), policy.clone());

    acquirer
        .store()
        .save("spotify", None, bundle_aged(20), &policy.domains)
        .unwrap();

    let err = acquirer.acquire_silent("spotify", None).await.unwrap_err();
    assert_eq!(err.kind(), "auth_failed");
    assert!(err.to_string().contains("expired"));

    let status = acquirer
        .store()
        .status("spotify", None, &policy)
        .unwrap();
    assert_eq!(status, CredentialStatus::Expired);
    assert_eq!(status.exit_code(), 7);
}

#[test]
fn status_exit_codes_cover_the_cli_table() {
    assert_eq!(CredentialStatus::Valid.exit_code(), 0);
    assert_eq!(CredentialStatus::ExpiringSoon.exit_code(), 6);
    assert_eq!(CredentialStatus::Expired.exit_code(), 7);
    assert_eq!(CredentialStatus::Missing.exit_code(), 8);
}

/// Property 6 — credential domain isolation: a bundle persisted through the
/// store only ever contains cookies whose domain suffix-matches the
/// service's declared domains.
#[test]
fn persisted_bundles_contain_no_foreign_cookies() {
    let tmp = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(ZoneLayout::new(tmp.path()));

    let mixed_jar = CredentialBundle::new(
        "interactive-browser",
        vec![
            json!({"name": "sp_dc", "value": "a", "domain": ".spotify.com"}),
            json!({"name": "sp_key", "value": "b", "domain": "accounts.spotify.com"}),
            json!({"name": "ga", "value": "c", "domain": ".google-analytics.com"}),
            json!({"name": "tt_sid", "value": "d", "domain": ".tiktok.com"}),
        ],
    );
    store
        .save("spotify", None, mixed_jar, &["spotify.com".to_string()])
        .unwrap();

    let saved = store.load("spotify", None).unwrap().unwrap();
    assert_eq!(saved.cookies.len(), 2);
    for cookie in &saved.cookies {
        let domain = cookie["domain"].as_str().unwrap();
        assert!(
            domain_matches(domain, "spotify.com"),
            "foreign cookie persisted: {}",
            domain
        );
    }
}

/// The expiring-soon window sits between the refresh threshold and max age.
#[test]
fn refresh_threshold_marks_expiring_soon() {
    let tmp = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(ZoneLayout::new(tmp.path()));
    let policy = spotify_policy();

    store
        .save("spotify", None, bundle_aged(8), &policy.domains)
        .unwrap();
    assert_eq!(
        store.status("spotify", None, &policy).unwrap(),
        CredentialStatus::ExpiringSoon
    );

    store
        .save("spotify", None, bundle_aged(2), &policy.domains)
        .unwrap();
    assert_eq!(
        store.status("spotify", None, &policy).unwrap(),
        CredentialStatus::Valid
    );
}

/// Silent-only acquisition never launches a browser: with no bundle and
/// interactive disallowed, acquisition fails cleanly with `AuthFailed`.
#[tokio::test]
async fn acquire_without_credentials_and_without_interactive_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let acquirer = acquirer_for(tmp.path(), spotify_policy());
    let err = acquirer.acquire("spotify", None).await.unwrap_err();
    assert_eq!(err.kind(), "auth_failed");
}

/// A stale bundle is replaced wholesale on save; partial writes are never
/// visible (atomic temp + rename).
#[test]
fn save_replaces_atomically() {
    let tmp = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(ZoneLayout::new(tmp.path()));
    let domains = vec!["spotify.com".to_string()];

    store.save("spotify", None, bundle_aged(1), &domains).unwrap();
    let first = store.load("spotify", None).unwrap().unwrap();

    let mut newer = bundle_aged(0);
    newer.cookies = vec![json!({"name": "sp_dc", "value": "rotated", "domain": ".spotify.com"})];
    store.save("spotify", None, newer, &domains).unwrap();

    let second = store.load("spotify", None).unwrap().unwrap();
    assert!(second.acquired_at > first.acquired_at);
    assert_eq!(second.cookies[0]["value"], "rotated");

    // No temp droppings next to the bundle.
    let dir = tmp.path().join("credentials/spotify");
    let leftovers: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}
