//! Content digests and the per-(zone, service) `_hashes.json` index.
//!
//! The index maps zone-relative path → SHA-256 hex string and is the dedup
//! source of truth for Landing→Raw and the change detector for
//! Staging→Curated.  Keys carry any subpath (`analytics/daily_....tsv`), so
//! equal basenames under different subpaths occupy distinct slots.  Writes
//! are atomic (write-to-temp then rename) so concurrent readers never
//! observe a partial index.  The index is loaded fresh on every promotion
//! pass; there is no in-memory cache to go stale.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::core::errors::{PipelineError, PipelineResult};
use crate::zones::layout::{Zone, ZoneLayout, HASH_INDEX_NAME};

/// SHA-256 of a file's raw bytes.
pub fn digest_file(path: &Path) -> PipelineResult<[u8; 32]> {
    let mut file = std::fs::File::open(path).map_err(|e| PipelineError::Hash {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| PipelineError::Hash {
            path: path.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Like [`digest_file`] but retried once on I/O failure, per the hash-error
/// recovery policy.
pub fn digest_file_with_retry(path: &Path) -> PipelineResult<[u8; 32]> {
    match digest_file(path) {
        Ok(d) => Ok(d),
        Err(first) => {
            warn!("hash failed for {}, retrying once: {}", path.display(), first);
            digest_file(path)
        }
    }
}

pub fn digest_hex(digest: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in digest {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// SHA-256 hex of a file, convenience for callers that only compare strings.
pub fn digest_file_hex(path: &Path) -> PipelineResult<String> {
    Ok(digest_hex(&digest_file_with_retry(path)?))
}

// ─────────────────────────────────────────────────────────────────────────────
// Hash index
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashIndex {
    #[serde(flatten)]
    entries: BTreeMap<String, String>,
    #[serde(skip)]
    path: PathBuf,
}

impl HashIndex {
    /// Load `<zone>/<service>/_hashes.json`.  A missing file is an empty
    /// index; a corrupt file is treated as empty with a warning (the next
    /// successful promotion rewrites it from observed state).
    pub fn load(layout: &ZoneLayout, zone: Zone, service: &str) -> Self {
        Self::load_at(layout.path_for(zone, service, None).join(HASH_INDEX_NAME))
    }

    /// Load an index from an explicit path (quarantine ledger, tests).
    pub fn load_at(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<BTreeMap<String, String>>(&contents) {
                Ok(m) => m,
                Err(e) => {
                    warn!(
                        "hash index corrupt at {}: {} — starting empty",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { entries, path }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, rel_path: &str) -> Option<&str> {
        self.entries.get(rel_path).map(String::as_str)
    }

    /// Whether any indexed entry carries this digest, regardless of name.
    /// This is the Landing→Raw dedup predicate: the same bytes landed under
    /// a different timestamped name still count as already promoted.
    pub fn contains_digest(&self, hex: &str) -> bool {
        self.entries.values().any(|v| v == hex)
    }

    pub fn upsert(&mut self, rel_path: &str, hex: String) {
        self.entries.insert(rel_path.to_string(), hex);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Persist atomically: serialize to `{path}.tmp`, then rename over the
    /// final path.  The parent directory is created if needed.
    pub fn save(&self) -> PipelineResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::path(parent, format!("create failed: {}", e)))?;
        }
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| PipelineError::path(&self.path, format!("serialize failed: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .map_err(|e| PipelineError::path(&tmp, format!("write failed: {}", e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| PipelineError::path(&self.path, format!("rename failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::layout::ZoneLayout;

    #[test]
    fn digest_is_stable_across_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        std::fs::write(&path, b"the same 128 bytes of payload").unwrap();
        let a = digest_file(&path).unwrap();
        let b = digest_file(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(digest_hex(&a).len(), 64);
    }

    #[test]
    fn known_vector_sha256_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            digest_file_hex(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn index_round_trips_and_replaces_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ZoneLayout::new(tmp.path());
        layout.ensure_zone(Zone::Raw, "alpha").unwrap();

        let mut idx = HashIndex::load(&layout, Zone::Raw, "alpha");
        assert!(idx.is_empty());
        idx.upsert("data_20250101_010000.json", "ab".repeat(32));
        idx.save().unwrap();

        let reloaded = HashIndex::load(&layout, Zone::Raw, "alpha");
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.contains_digest(&"ab".repeat(32)));
        assert_eq!(
            reloaded.get("data_20250101_010000.json"),
            Some("ab".repeat(32).as_str())
        );

        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(layout.path_for(Zone::Raw, "alpha", None))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupt_index_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ZoneLayout::new(tmp.path());
        let dir = layout.ensure_zone(Zone::Curated, "beta").unwrap();
        std::fs::write(dir.join(HASH_INDEX_NAME), b"not json at all").unwrap();
        let idx = HashIndex::load(&layout, Zone::Curated, "beta");
        assert!(idx.is_empty());
    }
}
