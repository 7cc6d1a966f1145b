//! Health monitoring over a real tree: bottleneck detection (S5), snapshot
//! persistence, and health-status monotonicity under remediation
//! (property 8).

#![cfg(unix)]

use std::path::Path;

use chrono::{Duration, Utc};
use lakeward::core::config::{LakewardConfig, ServicePolicy};
use lakeward::core::types::{ActionKind, ActionPriority};
use lakeward::health::{HealthMonitor, Remediator};
use lakeward::zones::layout::data_stamp;
use lakeward::{Orchestrator, RuntimeContext};
use std::sync::Arc;

fn ctx_for(root: &Path) -> RuntimeContext {
    let mut config = LakewardConfig::default();
    config.services.insert(
        "gamma".to_string(),
        ServicePolicy {
            priority: 5,
            ..Default::default()
        },
    );
    RuntimeContext::for_root(root).with_config(config)
}

fn declare_service(root: &Path, service: &str) {
    std::fs::create_dir_all(root.join("src").join(service).join("cleaners")).unwrap();
}

fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, format!("#!/bin/sh\nset -e\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn seed(root: &Path, zone: &str, service: &str, stem: &str, age_days: i64) {
    let dir = root.join(zone).join(service);
    std::fs::create_dir_all(&dir).unwrap();
    let stamp = data_stamp(Utc::now() - Duration::days(age_days));
    std::fs::write(dir.join(format!("{}_{}.json", stem, stamp)), b"{}\n").unwrap();
}

/// S5 — bottleneck detection: landing dated today, raw dated 10 days ago →
/// the snapshot reports `landing_newer_than_raw` and plans `run_cleaners`
/// for gamma at medium priority.
#[test]
fn landing_newer_than_raw_is_a_bottleneck() {
    let tmp = tempfile::tempdir().unwrap();
    declare_service(tmp.path(), "gamma");
    seed(tmp.path(), "landing", "gamma", "feed", 0);
    seed(tmp.path(), "raw", "gamma", "feed", 10);

    let monitor = HealthMonitor::new(ctx_for(tmp.path()));
    let snapshot = monitor.snapshot().unwrap();

    let gamma = snapshot
        .services
        .iter()
        .find(|s| s.service == "gamma")
        .unwrap();
    assert!(
        gamma
            .bottlenecks
            .iter()
            .any(|b| b.kind == "landing_newer_than_raw"),
        "expected the landing-newer-than-raw bottleneck, got {:?}",
        gamma.bottlenecks
    );
    assert!(!gamma.recommendations.is_empty());

    let action = snapshot
        .auto_actions
        .iter()
        .find(|a| a.kind == ActionKind::RunCleaners && a.service == "gamma")
        .expect("expected a run_cleaners action for gamma");
    assert_eq!(action.priority, ActionPriority::Medium);
}

/// Snapshots are persisted under state/health_snapshots/ and reloadable;
/// a second snapshot never overwrites the first.
#[test]
fn snapshots_accumulate_and_reload() {
    let tmp = tempfile::tempdir().unwrap();
    declare_service(tmp.path(), "gamma");
    seed(tmp.path(), "landing", "gamma", "feed", 0);

    let monitor = HealthMonitor::new(ctx_for(tmp.path()));
    let first = monitor.snapshot().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let second = monitor.snapshot().unwrap();
    assert!(second.generated_at > first.generated_at);

    let dir = tmp.path().join("state/health_snapshots");
    let count = std::fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()).count();
    assert_eq!(count, 2, "prior snapshots are archived, not replaced");

    let latest = monitor.latest_snapshot().unwrap();
    assert_eq!(latest.generated_at, second.generated_at);
}

/// Property 8 — running the recommended `run_cleaners` action on a service
/// whose bottleneck was "staging fresh, curated missing" resolves that
/// bottleneck in the next snapshot.
#[tokio::test]
async fn remediation_resolves_curated_missing() {
    let tmp = tempfile::tempdir().unwrap();
    write_script(
        &tmp.path()
            .join("src/gamma/cleaners/gamma_staging2curated.sh"),
        r#"cat "$PROJECT_ROOT"/staging/gamma/[!_]*.json > "$LAKEWARD_CANDIDATE_DIR/feed.json""#,
    );
    seed(tmp.path(), "staging", "gamma", "feed", 0);

    let ctx = ctx_for(tmp.path());
    let monitor = HealthMonitor::new(ctx.clone());
    let before = monitor.snapshot().unwrap();
    let gamma = before
        .services
        .iter()
        .find(|s| s.service == "gamma")
        .unwrap();
    assert!(
        gamma.bottlenecks.iter().any(|b| b.kind == "curated_missing"),
        "precondition: curated must be missing, got {:?}",
        gamma.bottlenecks
    );
    assert!(before
        .auto_actions
        .iter()
        .any(|a| a.kind == ActionKind::RunCleaners && a.service == "gamma"));

    let orchestrator = Arc::new(Orchestrator::new(ctx.clone()));
    let remediator = Remediator::new(ctx, orchestrator);
    let report = remediator.sweep(&before).await.unwrap().unwrap();
    assert!(report.failures.is_empty(), "sweep failed: {:?}", report.failures);

    assert!(tmp.path().join("curated/gamma/feed.json").exists());

    let after = monitor.snapshot().unwrap();
    let gamma_after = after
        .services
        .iter()
        .find(|s| s.service == "gamma")
        .unwrap();
    assert!(
        !gamma_after
            .bottlenecks
            .iter()
            .any(|b| b.kind == "curated_missing"),
        "bottleneck must be resolved, got {:?}",
        gamma_after.bottlenecks
    );
    assert!(gamma_after.health_score >= gamma.health_score);
}

/// Credential problems surface per account and feed cookie_refresh actions.
#[test]
fn missing_credentials_plan_a_cookie_refresh() {
    let tmp = tempfile::tempdir().unwrap();
    declare_service(tmp.path(), "tiktok");
    seed(tmp.path(), "landing", "tiktok", "feed", 0);

    let mut config = LakewardConfig::default();
    config.services.insert(
        "tiktok".to_string(),
        ServicePolicy {
            requires_auth: true,
            accounts: vec!["zonea0".to_string(), "pig1987".to_string()],
            domains: vec!["tiktok.com".to_string()],
            ..Default::default()
        },
    );
    let ctx = RuntimeContext::for_root(tmp.path()).with_config(config);

    let monitor = HealthMonitor::new(ctx);
    let snapshot = monitor.snapshot().unwrap();
    let tiktok = snapshot
        .services
        .iter()
        .find(|s| s.service == "tiktok")
        .unwrap();

    assert_eq!(tiktok.credentials.len(), 2);
    assert!(tiktok
        .credentials
        .iter()
        .all(|c| c.status == lakeward::core::types::CredentialStatus::Missing));

    let refreshes: Vec<_> = snapshot
        .auto_actions
        .iter()
        .filter(|a| a.kind == ActionKind::CookieRefresh && a.service == "tiktok")
        .collect();
    assert_eq!(refreshes.len(), 2, "one refresh per account");
    assert!(refreshes.iter().all(|a| a.priority == ActionPriority::High));
}
