//! Canonical directory scheme and path resolution.
//!
//! Everything under one configured project root:
//!
//! ```text
//! <root>/
//!   landing/<service>[/<subpath>]/<name>_<yyyymmdd_hhmmss>.<ext>
//!   raw/<service>[/<subpath>]/...          + raw/<service>/_hashes.json
//!   staging/<service>[/<subpath>]/...
//!   curated/<service>/<name>.<ext>         (stable name; no timestamp)
//!   archive/<service>/<name>_<yyyymmddThhmmss>.<ext>  + _manifest
//!   quarantine/<service>/...
//!   credentials/<service>/<account>.json
//!   logs/<yyyymmdd>/<service>/<unit>.log
//!   state/orchestrator.lock
//!   state/health_snapshots/<yyyymmddThhmmss>.json
//!   state/run_records/<yyyymmdd>.ndjson
//! ```
//!
//! Zone subtrees are created lazily on first write; creation is idempotent
//! and callers treat existence as success.

use chrono::{DateTime, NaiveDateTime, Utc};
use globset::Glob;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::core::errors::{PipelineError, PipelineResult};

/// A named stage of the pipeline with fixed immutability rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Zone {
    Landing,
    Raw,
    Staging,
    Curated,
    Archive,
}

impl Zone {
    pub const ALL: [Zone; 5] = [
        Zone::Landing,
        Zone::Raw,
        Zone::Staging,
        Zone::Curated,
        Zone::Archive,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Zone::Landing => "landing",
            Zone::Raw => "raw",
            Zone::Staging => "staging",
            Zone::Curated => "curated",
            Zone::Archive => "archive",
        }
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// On-disk artifact observed in a zone.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: PathBuf,
    pub service: String,
    pub zone: Zone,
    /// Filename without any directory components.
    pub basename: String,
    /// Path relative to `<zone>/<service>/`, including the basename.
    pub rel_path: PathBuf,
    /// Timestamp parsed from the filename, when present.
    pub logical_ts: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Filenames the engine owns; never promoted, never listed as data.
pub const HASH_INDEX_NAME: &str = "_hashes.json";
pub const ARCHIVE_MANIFEST_NAME: &str = "_manifest";

fn is_internal_name(name: &str) -> bool {
    name == HASH_INDEX_NAME
        || name == ARCHIVE_MANIFEST_NAME
        || name.starts_with('.')
        || name.ends_with(".tmp")
        || name.ends_with(".lock")
}

/// Parse the trailing `_yyyymmdd_hhmmss` (data zones) or `_yyyymmddThhmmss`
/// (archive) timestamp out of a file stem.
pub fn parse_logical_timestamp(basename: &str) -> Option<DateTime<Utc>> {
    static STAMP: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = STAMP.get_or_init(|| {
        regex::Regex::new(r"_(\d{8})[_T](\d{6})$").expect("stamp pattern is valid")
    });

    let stem = basename.rsplit_once('.').map(|(s, _)| s).unwrap_or(basename);
    let captures = re.captures(stem)?;
    let compact = format!("{}{}", &captures[1], &captures[2]);
    NaiveDateTime::parse_from_str(&compact, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| dt.and_utc())
}

/// Timestamp suffix for data-zone filenames (`yyyymmdd_hhmmss`).
pub fn data_stamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d_%H%M%S").to_string()
}

/// Timestamp suffix for archive filenames and conflict markers
/// (`yyyymmddThhmmss`).
pub fn archive_stamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S").to_string()
}

#[derive(Debug, Clone)]
pub struct ZoneLayout {
    root: PathBuf,
}

impl ZoneLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path inside a zone.  `subpath` may be a directory or a file
    /// path relative to `<zone>/<service>/`.
    pub fn path_for(&self, zone: Zone, service: &str, subpath: Option<&str>) -> PathBuf {
        let mut p = self.root.join(zone.dir_name()).join(service);
        if let Some(sub) = subpath {
            if !sub.is_empty() {
                p = p.join(sub);
            }
        }
        p
    }

    /// Create the zone directory for a service if missing.  Idempotent.
    pub fn ensure_zone(&self, zone: Zone, service: &str) -> PipelineResult<PathBuf> {
        let dir = self.path_for(zone, service, None);
        std::fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::path(&dir, format!("create failed: {}", e)))?;
        Ok(dir)
    }

    /// Enumerate data files under `<zone>/<service>/` matching `glob`
    /// (matched against the service-relative path, e.g. `**/*.json`).
    /// Engine-internal files, hidden entries, temp files, and lock files are
    /// never returned.
    pub fn list_files(
        &self,
        zone: Zone,
        service: &str,
        glob: &str,
    ) -> PipelineResult<Vec<FileRecord>> {
        let dir = self.path_for(zone, service, None);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let matcher = Glob::new(glob)
            .map_err(|e| PipelineError::path(&dir, format!("bad glob '{}': {}", glob, e)))?
            .compile_matcher();

        let mut records = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| !n.starts_with('.'))
                    .unwrap_or(false)
            })
        {
            let entry =
                entry.map_err(|e| PipelineError::path(&dir, format!("walk failed: {}", e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if is_internal_name(name) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&dir)
                .unwrap_or(entry.path())
                .to_path_buf();
            if !matcher.is_match(&rel) {
                continue;
            }

            let meta = entry
                .metadata()
                .map_err(|e| PipelineError::path(entry.path(), format!("stat failed: {}", e)))?;
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            records.push(FileRecord {
                path: entry.path().to_path_buf(),
                service: service.to_string(),
                zone,
                basename: name.to_string(),
                rel_path: rel,
                logical_ts: parse_logical_timestamp(name),
                modified,
                size_bytes: meta.len(),
            });
        }

        // Stable order: oldest logical timestamp first, name as tiebreaker.
        records.sort_by(|a, b| {
            (a.logical_ts, &a.basename).cmp(&(b.logical_ts, &b.basename))
        });
        Ok(records)
    }

    // ── Non-zone subtrees ────────────────────────────────────────────────────

    pub fn quarantine_dir(&self, service: &str) -> PathBuf {
        self.root.join("quarantine").join(service)
    }

    pub fn credentials_dir(&self, service: &str) -> PathBuf {
        self.root.join("credentials").join(service)
    }

    pub fn browser_profiles_dir(&self, service: &str, account: &str) -> PathBuf {
        self.root
            .join("state")
            .join("browser_profiles")
            .join(service)
            .join(account)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("orchestrator.lock")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.state_dir().join("health_snapshots")
    }

    pub fn run_records_dir(&self) -> PathBuf {
        self.state_dir().join("run_records")
    }

    pub fn unit_log_path(&self, date: DateTime<Utc>, service: &str, unit: &str) -> PathBuf {
        self.root
            .join("logs")
            .join(date.format("%Y%m%d").to_string())
            .join(service)
            .join(format!("{}.log", unit))
    }
}
