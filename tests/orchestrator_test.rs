//! Orchestration over real on-disk services: discovery, cleaner ordering,
//! cross-service failure isolation, and the at-most-one-run lock.
//!
//! Services are genuine executable units (shell scripts) discovered under
//! `<root>/src/<service>/`, exactly as production lays them out.

#![cfg(unix)]

use std::path::Path;

use lakeward::core::config::{LakewardConfig, ServicePolicy};
use lakeward::core::types::{RunClassification, RunOutcome, RunStage};
use lakeward::orchestrator::{Orchestrator, RunOptions, RunSummary};
use lakeward::RuntimeContext;

fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, format!("#!/bin/sh\nset -e\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn ctx_for(root: &Path, policies: &[(&str, ServicePolicy)]) -> RuntimeContext {
    let mut config = LakewardConfig::default();
    for (name, policy) in policies {
        config.services.insert(name.to_string(), policy.clone());
    }
    // Fast retry budget so transient-classified failures don't stall tests.
    config.retry.initial_interval_ms = 1;
    config.retry.max_interval_ms = 2;
    config.retry.max_elapsed_ms = 20;
    RuntimeContext::for_root(root).with_config(config)
}

/// A complete happy-path service: extractor lands a file, the three cleaner
/// stages carry it to curated.
fn build_epsilon(root: &Path) {
    let base = root.join("src").join("epsilon");
    write_script(
        &base.join("extractors").join("epsilon_pull.sh"),
        r#"mkdir -p "$PROJECT_ROOT/landing/epsilon"
printf '{"streams": 42}\n' > "$PROJECT_ROOT/landing/epsilon/streams_20250101_010000.json""#,
    );
    write_script(
        &base.join("cleaners").join("epsilon_raw2staging.sh"),
        r#"mkdir -p "$PROJECT_ROOT/staging/epsilon"
for f in "$PROJECT_ROOT"/raw/epsilon/[!_]*.json; do
  [ -f "$f" ] || continue
  cp "$f" "$PROJECT_ROOT/staging/epsilon/$(basename "$f")"
done"#,
    );
    write_script(
        &base.join("cleaners").join("epsilon_staging2curated.sh"),
        r#"cat "$PROJECT_ROOT"/staging/epsilon/[!_]*.json > "$LAKEWARD_CANDIDATE_DIR/streams.json""#,
    );
}

#[tokio::test]
async fn full_pass_reaches_curated() {
    let tmp = tempfile::tempdir().unwrap();
    build_epsilon(tmp.path());

    let orchestrator = Orchestrator::new(ctx_for(tmp.path(), &[]));
    let summary = orchestrator.run(&RunOptions::default()).await.unwrap();
    let RunSummary::Completed(report) = summary else {
        panic!("expected a completed run");
    };

    assert_eq!(report.classification, RunClassification::Success);
    let epsilon = &report.services[0];
    assert!(!epsilon.failed);
    assert!(epsilon.reached_curated);

    // Data flowed through every zone.
    let curated = tmp.path().join("curated/epsilon/streams.json");
    assert_eq!(std::fs::read(&curated).unwrap(), b"{\"streams\": 42}\n");
    assert!(tmp.path().join("raw/epsilon/_hashes.json").exists());
    assert!(tmp
        .path()
        .join("landing/epsilon/streams_20250101_010000.json")
        .exists());
}

/// S6 — cross-service failure isolation: delta's extractor reports upstream
/// down; epsilon is untouched and the pass is partial (exit code 2).
#[tokio::test]
async fn failing_service_never_blocks_its_siblings() {
    let tmp = tempfile::tempdir().unwrap();
    build_epsilon(tmp.path());
    write_script(
        &tmp.path().join("src/delta/extractors/delta_pull.sh"),
        "exit 22",
    );

    let orchestrator = Orchestrator::new(ctx_for(tmp.path(), &[]));
    let RunSummary::Completed(report) = orchestrator.run(&RunOptions::default()).await.unwrap()
    else {
        panic!("expected a completed run");
    };

    assert_eq!(report.classification, RunClassification::Partial);
    assert_eq!(report.classification.exit_code(), 2);

    let delta = report.services.iter().find(|s| s.service == "delta").unwrap();
    assert!(delta.failed);
    assert!(!delta.reached_curated);
    let failure = delta
        .units
        .iter()
        .find(|u| u.outcome == RunOutcome::Failed)
        .expect("delta must carry a structured failure record");
    assert_eq!(failure.error_kind.as_deref(), Some("upstream_unavailable"));

    let epsilon = report
        .services
        .iter()
        .find(|s| s.service == "epsilon")
        .unwrap();
    assert!(!epsilon.failed);
    assert!(epsilon.reached_curated);
}

/// Property 5 — cleaner order: within one pass the three stages run in
/// strictly increasing order, observable from the stages' own side effects.
#[tokio::test]
async fn cleaner_stages_run_in_fixed_order() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("src").join("mu");
    // Each stage appends its token; landing2raw runs as the validator for
    // the seeded landing file.
    write_script(
        &base.join("cleaners").join("mu_landing2raw.sh"),
        r#"echo "landing2raw" >> "$PROJECT_ROOT/order.log""#,
    );
    write_script(
        &base.join("cleaners").join("mu_raw2staging.sh"),
        r#"echo "raw2staging" >> "$PROJECT_ROOT/order.log"
mkdir -p "$PROJECT_ROOT/staging/mu"
cp "$PROJECT_ROOT"/raw/mu/[!_]*.json "$PROJECT_ROOT/staging/mu/" 2>/dev/null || true"#,
    );
    write_script(
        &base.join("cleaners").join("mu_staging2curated.sh"),
        r#"echo "staging2curated" >> "$PROJECT_ROOT/order.log"
cat "$PROJECT_ROOT"/staging/mu/[!_]*.json > "$LAKEWARD_CANDIDATE_DIR/out.json""#,
    );

    std::fs::create_dir_all(tmp.path().join("landing/mu")).unwrap();
    std::fs::write(
        tmp.path().join("landing/mu/data_20250101_010000.json"),
        b"{}\n",
    )
    .unwrap();

    let orchestrator = Orchestrator::new(ctx_for(tmp.path(), &[]));
    let RunSummary::Completed(report) = orchestrator.run(&RunOptions::default()).await.unwrap()
    else {
        panic!("expected a completed run");
    };
    assert!(!report.services[0].failed);

    let log = std::fs::read_to_string(tmp.path().join("order.log")).unwrap();
    let stages: Vec<&str> = log.lines().collect();
    assert_eq!(stages, vec!["landing2raw", "raw2staging", "staging2curated"]);
}

/// Property 7 — at-most-one orchestration: with a deliberately slow service,
/// a concurrent second run observes the lock and backs off.
#[tokio::test]
async fn concurrent_runs_are_mutually_exclusive() {
    let tmp = tempfile::tempdir().unwrap();
    build_epsilon(tmp.path());
    // Slow the pass down enough for genuine overlap.
    write_script(
        &tmp.path().join("src/epsilon/extractors/slow_pull.sh"),
        "sleep 2",
    );

    let ctx = ctx_for(tmp.path(), &[]);
    let first = Orchestrator::new(ctx.clone());
    let second = Orchestrator::new(ctx);

    let opts = RunOptions::default();
    let (a, b) = tokio::join!(
        first.run(&opts),
        async {
            // Give the first run a head start on the lock.
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            second.run(&opts).await
        }
    );

    let a = a.unwrap();
    let b = b.unwrap();
    let completed = [&a, &b]
        .iter()
        .filter(|s| matches!(s, RunSummary::Completed(_)))
        .count();
    let refused = [&a, &b]
        .iter()
        .filter(|s| matches!(s, RunSummary::AlreadyRunning))
        .count();
    assert_eq!(completed, 1, "exactly one run may proceed");
    assert_eq!(refused, 1, "the other must observe the lock");
}

/// `--no-extractors` leaves landing untouched and still promotes what is
/// already there.
#[tokio::test]
async fn cleaners_only_run_skips_extraction() {
    let tmp = tempfile::tempdir().unwrap();
    build_epsilon(tmp.path());
    // Pre-seed landing by hand; the extractor must NOT run.
    std::fs::create_dir_all(tmp.path().join("landing/epsilon")).unwrap();
    std::fs::write(
        tmp.path().join("landing/epsilon/manual_20250101_020000.json"),
        b"{\"manual\": true}\n",
    )
    .unwrap();

    let orchestrator = Orchestrator::new(ctx_for(tmp.path(), &[]));
    let RunSummary::Completed(report) = orchestrator
        .run(&RunOptions {
            services: None,
            no_extractors: true,
            no_cleaners: false,
        })
        .await
        .unwrap()
    else {
        panic!("expected a completed run");
    };

    let epsilon = &report.services[0];
    assert!(epsilon
        .units
        .iter()
        .all(|u| u.stage != RunStage::Extract && u.stage != RunStage::SessionAcquire));
    // The manually seeded file was promoted.
    assert!(tmp
        .path()
        .join("raw/epsilon/manual_20250101_020000.json")
        .exists());
}

/// A cleaner exiting with the schema-change code quarantines its inputs
/// without wiping the raw zone.
#[tokio::test]
async fn schema_change_quarantines_raw_inputs() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("src").join("nu");
    write_script(&base.join("cleaners").join("nu_raw2staging.sh"), "exit 23");

    std::fs::create_dir_all(tmp.path().join("raw/nu")).unwrap();
    std::fs::write(
        tmp.path().join("raw/nu/feed_20250101_010000.json"),
        b"{\"old_schema\": 1}\n",
    )
    .unwrap();

    let orchestrator = Orchestrator::new(ctx_for(tmp.path(), &[]));
    let RunSummary::Completed(report) = orchestrator.run(&RunOptions::default()).await.unwrap()
    else {
        panic!("expected a completed run");
    };

    let nu = &report.services[0];
    let failed = nu
        .units
        .iter()
        .find(|u| u.stage == RunStage::Raw2Staging)
        .unwrap();
    assert_eq!(failed.error_kind.as_deref(), Some("schema_changed"));

    // Raw input preserved, quarantine copy created.
    assert!(tmp.path().join("raw/nu/feed_20250101_010000.json").exists());
    assert!(tmp
        .path()
        .join("quarantine/nu/feed_20250101_010000.json")
        .exists());
}

/// Run records are persisted as NDJSON under state/run_records/.
#[tokio::test]
async fn run_records_are_persisted() {
    let tmp = tempfile::tempdir().unwrap();
    build_epsilon(tmp.path());

    let orchestrator = Orchestrator::new(ctx_for(tmp.path(), &[]));
    orchestrator.run(&RunOptions::default()).await.unwrap();

    let dir = tmp.path().join("state/run_records");
    let files: Vec<_> = std::fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()).collect();
    assert_eq!(files.len(), 1);
    let contents = std::fs::read_to_string(files[0].path()).unwrap();
    let records: Vec<serde_json::Value> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(!records.is_empty());
    assert!(records.iter().any(|r| r["stage"] == "extract"));
    assert!(records.iter().any(|r| r["stage"] == "staging2curated"));
    assert!(records.iter().all(|r| r["service"] == "epsilon"));
}

/// Zone discovery honors the service filter.
#[tokio::test]
async fn service_filter_restricts_the_pass() {
    let tmp = tempfile::tempdir().unwrap();
    build_epsilon(tmp.path());
    write_script(
        &tmp.path().join("src/delta/extractors/delta_pull.sh"),
        "exit 22",
    );

    let orchestrator = Orchestrator::new(ctx_for(tmp.path(), &[]));
    let RunSummary::Completed(report) = orchestrator
        .run(&RunOptions {
            services: Some(vec!["epsilon".to_string()]),
            ..Default::default()
        })
        .await
        .unwrap()
    else {
        panic!("expected a completed run");
    };

    assert_eq!(report.services.len(), 1);
    assert_eq!(report.services[0].service, "epsilon");
    assert_eq!(report.classification, RunClassification::Success);
    assert!(!tmp.path().join("landing/delta").exists());
}
