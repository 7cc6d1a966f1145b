//! Append-only archive manifest.
//!
//! `archive/<service>/_manifest` records one NDJSON line per archived
//! curated artifact: original basename, content digest, archive timestamp,
//! and the name it was archived under.  The engine only ever appends;
//! pruning and verification tooling read it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

use crate::core::errors::{PipelineError, PipelineResult};
use crate::zones::layout::{Zone, ZoneLayout, ARCHIVE_MANIFEST_NAME};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Stable curated basename the artifact was archived from.
    pub basename: String,
    /// Name of the archive copy (`<name>_<yyyymmddThhmmss>.<ext>`).
    pub archived_as: String,
    /// SHA-256 hex of the archived bytes.
    pub digest: String,
    pub archived_at: DateTime<Utc>,
}

fn manifest_path(layout: &ZoneLayout, service: &str) -> PathBuf {
    layout
        .path_for(Zone::Archive, service, None)
        .join(ARCHIVE_MANIFEST_NAME)
}

/// Append one entry.  The archive directory is created if needed.
pub fn append_entry(layout: &ZoneLayout, service: &str, entry: &ManifestEntry) -> PipelineResult<()> {
    layout.ensure_zone(Zone::Archive, service)?;
    let path = manifest_path(layout, service);
    let line = serde_json::to_string(entry)
        .map_err(|e| PipelineError::path(&path, format!("serialize failed: {}", e)))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| PipelineError::path(&path, format!("open failed: {}", e)))?;
    writeln!(file, "{}", line)
        .map_err(|e| PipelineError::path(&path, format!("append failed: {}", e)))?;
    Ok(())
}

/// Read all entries, oldest first.  Unparseable lines are skipped — the log
/// is advisory for pruning/verification, never a promotion input.
pub fn read_entries(layout: &ZoneLayout, service: &str) -> Vec<ManifestEntry> {
    let path = manifest_path(layout, service);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_reads_back_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ZoneLayout::new(tmp.path());

        for i in 0..3 {
            append_entry(
                &layout,
                "beta",
                &ManifestEntry {
                    basename: "summary.csv".into(),
                    archived_as: format!("summary_2025010{}T120000.csv", i + 1),
                    digest: format!("{:064x}", i),
                    archived_at: Utc::now(),
                },
            )
            .unwrap();
        }

        let entries = read_entries(&layout, "beta");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].archived_as, "summary_20250101T120000.csv");
        assert_eq!(entries[2].archived_as, "summary_20250103T120000.csv");
    }

    #[test]
    fn missing_manifest_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ZoneLayout::new(tmp.path());
        assert!(read_entries(&layout, "ghost").is_empty());
    }
}
