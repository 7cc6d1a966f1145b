//! Filesystem-driven service discovery.
//!
//! A service is declared by a directory `<root>/src/<service>/` that
//! contains an `extractors/` or `cleaners/` subdirectory.  Discovery stays
//! filesystem-driven but produces strongly-typed descriptors: the cleaner
//! order is the [`CleanerStage`] enumeration, never a lexical accident of
//! the surrounding file name.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::config::{LakewardConfig, ServicePolicy};
use crate::core::errors::{PipelineError, PipelineResult};

/// The three promotion transitions, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CleanerStage {
    Landing2Raw,
    Raw2Staging,
    Staging2Curated,
}

impl CleanerStage {
    pub const ALL: [CleanerStage; 3] = [
        CleanerStage::Landing2Raw,
        CleanerStage::Raw2Staging,
        CleanerStage::Staging2Curated,
    ];

    pub fn token(self) -> &'static str {
        match self {
            CleanerStage::Landing2Raw => "landing2raw",
            CleanerStage::Raw2Staging => "raw2staging",
            CleanerStage::Staging2Curated => "staging2curated",
        }
    }

    /// Recognize the stage token anywhere in a unit file name, regardless of
    /// surrounding tokens (`spotify_landing2raw_v2.sh` → `Landing2Raw`).
    pub fn from_unit_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        Self::ALL.into_iter().find(|s| lower.contains(s.token()))
    }
}

impl std::fmt::Display for CleanerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// One executable unit discovered under a service directory.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    /// File stem, used for logs and run records.
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CleanerSpec {
    pub unit: UnitSpec,
    pub stage: CleanerStage,
}

/// A discovered service with its policy and enumerated units.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub dir: PathBuf,
    pub policy: ServicePolicy,
    /// Lexical order; execution order within the service is policy-driven.
    pub extractors: Vec<UnitSpec>,
    /// Sorted by stage; at most one unit per stage (first lexical wins).
    pub cleaners: Vec<CleanerSpec>,
}

impl ServiceSpec {
    pub fn cleaner_for(&self, stage: CleanerStage) -> Option<&CleanerSpec> {
        self.cleaners.iter().find(|c| c.stage == stage)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

fn qualifies_as_unit(path: &Path, extensions: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    if is_executable(path) {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn enumerate_units(dir: &Path, extensions: &[String]) -> Vec<UnitSpec> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut units: Vec<UnitSpec> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| qualifies_as_unit(e.path(), extensions))
        .filter_map(|e| {
            let stem = e.path().file_stem()?.to_str()?.to_string();
            Some(UnitSpec {
                name: stem,
                path: e.path().to_path_buf(),
            })
        })
        .collect();
    units.sort_by(|a, b| a.name.cmp(&b.name));
    units
}

/// Whether a name is a valid service identifier: lowercase, filesystem-safe.
pub fn valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Discover every service under `<root>/src/`.
///
/// Hidden directories are excluded; a directory qualifies when it contains
/// `extractors/` or `cleaners/`.  Services come back sorted by policy
/// priority (lower first), name as tiebreaker.
pub fn discover_services(
    project_root: &Path,
    config: &LakewardConfig,
) -> PipelineResult<Vec<ServiceSpec>> {
    let src = project_root.join("src");
    if !src.is_dir() {
        return Ok(Vec::new());
    }

    let mut services = Vec::new();
    let entries = std::fs::read_dir(&src)
        .map_err(|e| PipelineError::path(&src, format!("read_dir failed: {}", e)))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if !valid_service_name(name) {
            warn!("discovery: skipping invalid service directory name '{}'", name);
            continue;
        }

        let extractors_dir = path.join("extractors");
        let cleaners_dir = path.join("cleaners");
        if !extractors_dir.is_dir() && !cleaners_dir.is_dir() {
            debug!("discovery: {} has no extractors/ or cleaners/ — skipping", name);
            continue;
        }

        let extractors = enumerate_units(&extractors_dir, &config.unit_extensions);

        let mut cleaners: Vec<CleanerSpec> = Vec::new();
        for unit in enumerate_units(&cleaners_dir, &config.unit_extensions) {
            match CleanerStage::from_unit_name(&unit.name) {
                Some(stage) => {
                    if cleaners.iter().any(|c: &CleanerSpec| c.stage == stage) {
                        warn!(
                            "discovery: {} declares multiple {} cleaners; keeping the first",
                            name, stage
                        );
                        continue;
                    }
                    cleaners.push(CleanerSpec { unit, stage });
                }
                None => warn!(
                    "discovery: {} cleaner '{}' names no promotion stage — ignored",
                    name, unit.name
                ),
            }
        }
        cleaners.sort_by_key(|c| c.stage);

        services.push(ServiceSpec {
            policy: config.policy(name),
            name: name.to_string(),
            dir: path,
            extractors,
            cleaners,
        });
    }

    services.sort_by(|a, b| {
        (a.policy.priority, &a.name).cmp(&(b.policy.priority, &b.name))
    });
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch_exec(path: &Path) {
        std::fs::write(path, b"#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn stage_tokens_are_recognized_amid_noise() {
        assert_eq!(
            CleanerStage::from_unit_name("spotify_landing2raw_v2"),
            Some(CleanerStage::Landing2Raw)
        );
        assert_eq!(
            CleanerStage::from_unit_name("99_RAW2STAGING_final"),
            Some(CleanerStage::Raw2Staging)
        );
        assert_eq!(
            CleanerStage::from_unit_name("staging2curated"),
            Some(CleanerStage::Staging2Curated)
        );
        assert_eq!(CleanerStage::from_unit_name("cleanup_logs"), None);
    }

    #[test]
    fn stage_order_is_fixed() {
        let mut stages = vec![
            CleanerStage::Staging2Curated,
            CleanerStage::Landing2Raw,
            CleanerStage::Raw2Staging,
        ];
        stages.sort();
        assert_eq!(stages, CleanerStage::ALL.to_vec());
    }

    #[test]
    fn discovers_qualifying_services_only() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");

        // Qualifies: has cleaners/.
        let alpha = src.join("alpha").join("cleaners");
        std::fs::create_dir_all(&alpha).unwrap();
        touch_exec(&alpha.join("alpha_landing2raw.sh"));
        touch_exec(&alpha.join("alpha_raw2staging.sh"));

        // Does not qualify: no unit subdirectories.
        std::fs::create_dir_all(src.join("docs")).unwrap();

        // Hidden: excluded.
        std::fs::create_dir_all(src.join(".git").join("cleaners")).unwrap();

        let config = LakewardConfig::default();
        let services = discover_services(tmp.path(), &config).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "alpha");
        assert_eq!(services[0].cleaners.len(), 2);
        assert_eq!(services[0].cleaners[0].stage, CleanerStage::Landing2Raw);
        assert_eq!(services[0].cleaners[1].stage, CleanerStage::Raw2Staging);
    }

    #[test]
    fn priority_orders_discovery() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        for name in ["zeta", "alpha"] {
            let d = src.join(name).join("extractors");
            std::fs::create_dir_all(&d).unwrap();
            touch_exec(&d.join(format!("{}_pull.sh", name)));
        }

        let mut config = LakewardConfig::default();
        config.services.insert(
            "zeta".to_string(),
            ServicePolicy {
                priority: 1,
                ..Default::default()
            },
        );

        let services = discover_services(tmp.path(), &config).unwrap();
        assert_eq!(services[0].name, "zeta");
        assert_eq!(services[1].name, "alpha");
    }

    #[test]
    fn extension_set_extends_exec_bit() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("src").join("svc").join("extractors");
        std::fs::create_dir_all(&dir).unwrap();
        // Not executable, but matches a declared extension.
        std::fs::write(dir.join("pull_data.py"), b"print('hi')").unwrap();
        std::fs::write(dir.join("README.md"), b"docs").unwrap();

        let config = LakewardConfig {
            unit_extensions: vec!["py".to_string()],
            ..Default::default()
        };
        let services = discover_services(tmp.path(), &config).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].extractors.len(), 1);
        assert_eq!(services[0].extractors[0].name, "pull_data");
    }
}
