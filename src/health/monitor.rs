//! Cross-zone pipeline health.
//!
//! For every discovered service the monitor computes per-zone freshness,
//! credential status (each account individually), an ordered bottleneck
//! list, a composite health score, and the structured remediation plan the
//! Remediator consumes.  Snapshots are persisted to
//! `state/health_snapshots/<yyyymmddThhmmss>.json` and never overwritten.
//!
//! Score composition (100 points):
//! * 50 — freshness: landing recency decayed against one promotion cycle
//! * 30 — credentials: worst account status
//! * 20 — completeness: data present in every zone it should have reached

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::core::context::RuntimeContext;
use crate::core::errors::PipelineResult;
use crate::core::types::{
    AccountCredentialStatus, ActionKind, ActionPriority, AutoAction, Bottleneck, CredentialStatus,
    HealthSnapshot, HealthStatus, ServiceHealth, ZoneFreshness,
};
use crate::credentials::store::CredentialStore;
use crate::services::registry::discover_services;
use crate::zones::layout::{archive_stamp, Zone, ZoneLayout};

pub struct HealthMonitor {
    ctx: RuntimeContext,
    layout: ZoneLayout,
    store: CredentialStore,
}

impl HealthMonitor {
    pub fn new(ctx: RuntimeContext) -> Self {
        let layout = ZoneLayout::new(ctx.project_root.clone());
        Self {
            store: CredentialStore::new(layout.clone()),
            layout,
            ctx,
        }
    }

    /// Compute a fresh snapshot, persist it, and return it.
    pub fn snapshot(&self) -> PipelineResult<HealthSnapshot> {
        let now = Utc::now();
        let services = discover_services(&self.ctx.project_root, &self.ctx.config)?;

        let mut service_reports = Vec::new();
        let mut auto_actions = Vec::new();
        for spec in &services {
            let (health, mut actions) = self.service_health(&spec.name, now)?;
            service_reports.push(health);
            auto_actions.append(&mut actions);
        }

        // High-priority actions first, stable by service name.
        auto_actions.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.service.cmp(&b.service)));

        let overall = overall_status(
            service_reports
                .iter()
                .map(|s| (s.status, self.ctx.config.policy(&s.service).priority)),
        );

        let snapshot = HealthSnapshot {
            generated_at: now,
            overall,
            services: service_reports,
            auto_actions,
        };
        self.persist(&snapshot);
        self.prune_snapshots();
        Ok(snapshot)
    }

    /// Load the most recently persisted snapshot, if any.
    pub fn latest_snapshot(&self) -> Option<HealthSnapshot> {
        let dir = self.layout.snapshots_dir();
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .ok()?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .filter(|n| n.ends_with(".json"))
            .collect();
        names.sort();
        let newest = names.pop()?;
        let contents = std::fs::read_to_string(dir.join(&newest)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    // ── Per-service computation ─────────────────────────────────────────────

    fn service_health(
        &self,
        service: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<(ServiceHealth, Vec<AutoAction>)> {
        let policy = self.ctx.config.policy(service);
        let cycle_hours = self.ctx.config.scheduler.promotion_cycle_hours as f64;

        let mut freshness = Vec::new();
        let mut newest: std::collections::HashMap<Zone, Option<DateTime<Utc>>> =
            std::collections::HashMap::new();
        for zone in Zone::ALL {
            let files = self.layout.list_files(zone, service, "**/*")?;
            let newest_ts = files
                .iter()
                .filter_map(|f| f.logical_ts.or(Some(f.modified)))
                .max();
            newest.insert(zone, newest_ts);
            freshness.push(ZoneFreshness {
                zone: zone.dir_name().to_string(),
                newest: newest_ts,
                age_days: newest_ts.map(|ts| (now - ts).num_seconds() as f64 / 86_400.0),
                file_count: files.len(),
            });
        }

        // Credential status, each account individually.
        let mut credentials = Vec::new();
        let mut worst_credential = CredentialStatus::Valid;
        let track_credentials = policy.requires_auth;
        if track_credentials {
            for account in policy.effective_accounts() {
                let status = self
                    .store
                    .status(service, account.as_deref(), &policy)
                    .unwrap_or(CredentialStatus::Missing);
                let age_days = self
                    .store
                    .age(service, account.as_deref())
                    .ok()
                    .flatten()
                    .map(|d| d.num_seconds() as f64 / 86_400.0);
                if credential_rank(status) > credential_rank(worst_credential) {
                    worst_credential = status;
                }
                credentials.push(AccountCredentialStatus {
                    account: account.unwrap_or_else(|| "default".to_string()),
                    status,
                    age_days,
                });
            }
        }

        let bottlenecks = self.bottlenecks(service, &newest, cycle_hours)?;
        let (score, recommendations, actions) = self.evaluate(
            service,
            &policy.accounts,
            &newest,
            &bottlenecks,
            worst_credential,
            track_credentials,
            cycle_hours,
            now,
        );

        let status = status_from_score(score);
        Ok((
            ServiceHealth {
                service: service.to_string(),
                status,
                health_score: score,
                freshness,
                credentials,
                bottlenecks,
                recommendations,
            },
            actions,
        ))
    }

    /// Ordered reasons data is not reaching Curated.
    fn bottlenecks(
        &self,
        service: &str,
        newest: &std::collections::HashMap<Zone, Option<DateTime<Utc>>>,
        cycle_hours: f64,
    ) -> PipelineResult<Vec<Bottleneck>> {
        let mut out = Vec::new();
        let get = |z: Zone| newest.get(&z).copied().flatten();

        if let Some(landing) = get(Zone::Landing) {
            let raw = get(Zone::Raw);
            let lag_hours = raw
                .map(|r| (landing - r).num_seconds() as f64 / 3_600.0)
                .unwrap_or(f64::INFINITY);
            if lag_hours > cycle_hours {
                out.push(Bottleneck {
                    kind: "landing_newer_than_raw".into(),
                    detail: match raw {
                        Some(r) => format!(
                            "landing {} vs raw {} — more than one promotion cycle behind",
                            landing.format("%Y-%m-%d"),
                            r.format("%Y-%m-%d")
                        ),
                        None => "landing has data but raw is empty".into(),
                    },
                });
            }
        }

        if let (Some(raw), staging) = (get(Zone::Raw), get(Zone::Staging)) {
            if staging.map(|s| raw > s).unwrap_or(true) {
                out.push(Bottleneck {
                    kind: "raw_newer_than_staging".into(),
                    detail: match staging {
                        Some(s) => format!(
                            "raw {} vs staging {}",
                            raw.format("%Y-%m-%d"),
                            s.format("%Y-%m-%d")
                        ),
                        None => "raw has data but staging is empty".into(),
                    },
                });
            }
        }

        if get(Zone::Staging).is_some() && get(Zone::Curated).is_none() {
            out.push(Bottleneck {
                kind: "curated_missing".into(),
                detail: "staging has data but curated is empty".into(),
            });
        }

        // Path-mismatch detection: newer files in an alternate raw subpath
        // that staging is not picking up.
        let raw_files = self.layout.list_files(Zone::Raw, service, "**/*")?;
        if let Some(staging_ts) = get(Zone::Staging) {
            let stale_subpaths: std::collections::BTreeSet<String> = raw_files
                .iter()
                .filter(|f| f.rel_path.parent().map(|p| !p.as_os_str().is_empty()).unwrap_or(false))
                .filter(|f| f.logical_ts.map(|ts| ts > staging_ts).unwrap_or(false))
                .filter_map(|f| {
                    f.rel_path
                        .parent()
                        .map(|p| p.to_string_lossy().to_string())
                })
                .collect();
            if !stale_subpaths.is_empty() {
                out.push(Bottleneck {
                    kind: "raw_subpath_not_picked_up".into(),
                    detail: format!(
                        "newer raw files under {:?} postdate staging",
                        stale_subpaths
                    ),
                });
            }
        }

        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &self,
        service: &str,
        accounts: &[String],
        newest: &std::collections::HashMap<Zone, Option<DateTime<Utc>>>,
        bottlenecks: &[Bottleneck],
        worst_credential: CredentialStatus,
        track_credentials: bool,
        cycle_hours: f64,
        now: DateTime<Utc>,
    ) -> (u8, Vec<String>, Vec<AutoAction>) {
        let get = |z: Zone| newest.get(&z).copied().flatten();
        let mut recommendations = Vec::new();
        let mut actions = Vec::new();

        // Freshness: full marks within one promotion cycle, linear decay to
        // zero at four cycles.
        let freshness_points = match get(Zone::Landing) {
            Some(ts) => {
                let age_hours = (now - ts).num_seconds() as f64 / 3_600.0;
                let cycles = age_hours / cycle_hours.max(1.0);
                if cycles <= 1.0 {
                    50.0
                } else {
                    (50.0 * (1.0 - (cycles - 1.0) / 3.0)).max(0.0)
                }
            }
            None => 0.0,
        };
        if freshness_points < 25.0 {
            recommendations.push(format!(
                "{}: landing data is stale — run the extractor",
                service
            ));
            actions.push(AutoAction {
                kind: ActionKind::RunExtractor,
                service: service.to_string(),
                account: None,
                priority: if freshness_points == 0.0 {
                    ActionPriority::High
                } else {
                    ActionPriority::Medium
                },
                reason: "landing zone stale or empty".into(),
            });
        }

        // Credentials.
        let credential_points = if !track_credentials {
            30.0
        } else {
            match worst_credential {
                CredentialStatus::Valid => 30.0,
                CredentialStatus::ExpiringSoon => 20.0,
                CredentialStatus::Expired => 5.0,
                CredentialStatus::Missing => 0.0,
            }
        };
        if track_credentials
            && matches!(
                worst_credential,
                CredentialStatus::Expired | CredentialStatus::Missing | CredentialStatus::ExpiringSoon
            )
        {
            let priority = match worst_credential {
                CredentialStatus::ExpiringSoon => ActionPriority::Low,
                _ => ActionPriority::High,
            };
            recommendations.push(format!(
                "{}: credentials are {:?} — refresh the session",
                service, worst_credential
            ));
            for account in accounts.iter().map(|a| Some(a.clone())).chain(
                if accounts.is_empty() { vec![None] } else { vec![] },
            ) {
                actions.push(AutoAction {
                    kind: ActionKind::CookieRefresh,
                    service: service.to_string(),
                    account,
                    priority,
                    reason: format!("credential status {:?}", worst_credential),
                });
            }
        }

        // Completeness: every zone that should have data does.
        let reached = [Zone::Raw, Zone::Staging, Zone::Curated]
            .into_iter()
            .filter(|z| get(*z).is_some())
            .count();
        let completeness_points = match get(Zone::Landing) {
            Some(_) => (reached as f64 / 3.0) * 20.0,
            None => 0.0,
        };
        if !bottlenecks.is_empty() {
            recommendations.push(format!(
                "{}: promotion is lagging ({}) — run the cleaners",
                service,
                bottlenecks
                    .iter()
                    .map(|b| b.kind.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            actions.push(AutoAction {
                kind: ActionKind::RunCleaners,
                service: service.to_string(),
                account: None,
                priority: ActionPriority::Medium,
                reason: bottlenecks[0].kind.clone(),
            });
        }

        let score = (freshness_points + credential_points + completeness_points).round() as u8;
        (score.min(100), recommendations, actions)
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    fn persist(&self, snapshot: &HealthSnapshot) {
        let dir = self.layout.snapshots_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("snapshot dir create failed at {}: {}", dir.display(), e);
            return;
        }
        let path = dir.join(format!("{}.json", archive_stamp(snapshot.generated_at)));
        let Ok(json) = serde_json::to_string_pretty(snapshot) else {
            warn!("snapshot serialize failed");
            return;
        };
        let tmp = path.with_extension("json.tmp");
        let result = std::fs::write(&tmp, &json).and_then(|_| std::fs::rename(&tmp, &path));
        match result {
            Ok(()) => info!("health snapshot written to {}", path.display()),
            Err(e) => warn!("snapshot write failed at {}: {}", path.display(), e),
        }
    }

    fn prune_snapshots(&self) {
        let retention = self.ctx.config.retention.snapshot_retention_days as i64;
        let cutoff = format!(
            "{}.json",
            archive_stamp(Utc::now() - chrono::Duration::days(retention))
        );
        let dir = self.layout.snapshots_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .filter(|n| n.ends_with(".json"))
            .collect();
        names.sort();
        // The newest snapshot always survives, whatever its age.
        names.pop();
        for name in names {
            if name < cutoff {
                let _ = std::fs::remove_file(dir.join(&name));
            }
        }
    }
}

fn credential_rank(status: CredentialStatus) -> u8 {
    match status {
        CredentialStatus::Valid => 0,
        CredentialStatus::ExpiringSoon => 1,
        CredentialStatus::Expired => 2,
        CredentialStatus::Missing => 3,
    }
}

fn status_from_score(score: u8) -> HealthStatus {
    match score {
        80..=100 => HealthStatus::Healthy,
        50..=79 => HealthStatus::Warning,
        25..=49 => HealthStatus::Critical,
        _ => HealthStatus::Failed,
    }
}

/// Worst per-service status wins, weighted by priority: a failing
/// high-priority service (priority ≤ 10) drags the fleet to its own status;
/// low-priority services can only degrade the fleet one level.
fn overall_status<I>(statuses: I) -> HealthStatus
where
    I: IntoIterator<Item = (HealthStatus, i32)>,
{
    let mut overall = HealthStatus::Healthy;
    for (status, priority) in statuses {
        let effective = if priority <= 10 {
            status
        } else {
            match status {
                HealthStatus::Failed | HealthStatus::Critical => HealthStatus::Warning,
                other => other,
            }
        };
        if effective > overall {
            overall = effective;
        }
    }
    overall
}
