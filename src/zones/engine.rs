//! Zone promotion engine.
//!
//! Owns every file that moves between zones.  Cleaners transform bytes; the
//! engine enforces the invariants around them:
//!
//! * Landing→Raw is deduplicated by content digest and never mutates Landing.
//! * Staging→Curated archives the prior artifact, then replaces atomically.
//! * Every committed write is temp-file + rename on the same filesystem, so
//!   readers see either the old state intact or the new state complete.
//! * A single file's failure never aborts its batch.
//!
//! Per-file life cycle inside one Landing→Raw batch:
//!
//! ```text
//! NEW --(digest computed)--> SEEN
//! SEEN --(absent in raw index)--> PROMOTED
//! SEEN --(present in raw index)--> SKIPPED
//! NEW --(I/O error)--> ERRORED (retryable next cycle)
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{CuratedOutcome, FileDisposition, PromotionReport};
use crate::zones::archive::{self, ManifestEntry};
use crate::zones::hashes::{digest_file_hex, digest_file_with_retry, digest_hex, HashIndex};
use crate::zones::layout::{archive_stamp, FileRecord, Zone, ZoneLayout};

// ─────────────────────────────────────────────────────────────────────────────
// Per-(zone, service) write serialization
// ─────────────────────────────────────────────────────────────────────────────

/// Advisory exclusive lock over one (zone, service) subtree.  Writers block
/// each other; readers never take it.  Released on drop.
struct ZoneWriteLock {
    file: File,
    path: PathBuf,
}

impl ZoneWriteLock {
    fn acquire(layout: &ZoneLayout, zone: Zone, service: &str) -> PipelineResult<Self> {
        let dir = layout.ensure_zone(zone, service)?;
        let path = dir.join(".writer.lock");
        let file = File::create(&path)
            .map_err(|e| PipelineError::path(&path, format!("lock create failed: {}", e)))?;
        fs2::FileExt::lock_exclusive(&file)
            .map_err(|e| PipelineError::path(&path, format!("lock failed: {}", e)))?;
        Ok(Self { file, path })
    }
}

impl Drop for ZoneWriteLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!("zone lock unlock failed at {}: {}", self.path.display(), e);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation hook
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of validating one Landing file before promotion.  Produced by the
/// service's landing2raw cleaner when one exists; the engine promotes
/// unconditionally otherwise.
#[derive(Debug, Clone)]
pub enum ValidationVerdict {
    Ok,
    /// Incompatible input — copied to quarantine, original left in Landing.
    SchemaChanged(String),
    /// Any other validation failure — recorded, siblings continue.
    Rejected(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PromotionEngine {
    layout: ZoneLayout,
}

impl PromotionEngine {
    pub fn new(layout: ZoneLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ZoneLayout {
        &self.layout
    }

    // ── Landing → Raw ────────────────────────────────────────────────────────

    /// Promote every Landing file of `service` into Raw.
    ///
    /// `validate` is called once per candidate before any copy; pass
    /// `|_| ValidationVerdict::Ok` when the service has no landing2raw
    /// cleaner.  The Landing copy is always left untouched — promoted files
    /// are retained for audit, quarantined files are *copied* out.
    pub fn promote_landing_to_raw<F>(
        &self,
        service: &str,
        mut validate: F,
    ) -> PipelineResult<PromotionReport>
    where
        F: FnMut(&FileRecord) -> ValidationVerdict,
    {
        let _write_lock = ZoneWriteLock::acquire(&self.layout, Zone::Raw, service)?;

        let candidates = self.layout.list_files(Zone::Landing, service, "**/*")?;
        let mut index = HashIndex::load(&self.layout, Zone::Raw, service);
        let quarantined = self.quarantine_ledger(service);
        let mut report = PromotionReport::default();

        for file in &candidates {
            match self.promote_one(service, file, &mut index, &quarantined, &mut validate) {
                Ok((disposition, detail)) => report.record(&file.basename, disposition, detail),
                Err(e) => {
                    warn!(
                        "landing2raw: {} errored for {}: {}",
                        service, file.basename, e
                    );
                    report.record(&file.basename, FileDisposition::Errored, Some(e.to_string()));
                }
            }
        }

        index.save()?;
        info!(
            "landing2raw: {} — {} promoted, {} skipped, {} quarantined, {} errored",
            service, report.promoted, report.skipped, report.quarantined, report.errored
        );
        Ok(report)
    }

    fn promote_one<F>(
        &self,
        service: &str,
        file: &FileRecord,
        index: &mut HashIndex,
        quarantined: &HashIndex,
        validate: &mut F,
    ) -> PipelineResult<(FileDisposition, Option<String>)>
    where
        F: FnMut(&FileRecord) -> ValidationVerdict,
    {
        // NEW → SEEN: the digest is the dedup key.
        let digest = digest_file_with_retry(&file.path)?;
        let hex = digest_hex(&digest);

        // SEEN → SKIPPED: already promoted (any name) or already quarantined.
        if index.contains_digest(&hex) {
            debug!("landing2raw: {} already promoted: {}", service, file.basename);
            return Ok((FileDisposition::Skipped, Some("already promoted".into())));
        }
        if quarantined.contains_digest(&hex) {
            return Ok((FileDisposition::Skipped, Some("previously quarantined".into())));
        }

        match validate(file) {
            ValidationVerdict::Ok => {}
            ValidationVerdict::SchemaChanged(reason) => {
                self.copy_to_quarantine(service, file, &hex)?;
                return Ok((FileDisposition::Quarantined, Some(reason)));
            }
            ValidationVerdict::Rejected(reason) => {
                return Ok((FileDisposition::Errored, Some(reason)));
            }
        }

        // SEEN → PROMOTED: copy under the same relative path, conflict-suffix
        // a basename that exists with different bytes.
        let raw_root = self.layout.path_for(Zone::Raw, service, None);
        let mut dest = raw_root.join(&file.rel_path);
        if dest.exists() {
            let dest_hex = digest_file_hex(&dest)?;
            if dest_hex != hex {
                dest = conflict_path(&dest, chrono::Utc::now());
            }
        }
        atomic_copy(&file.path, &dest)?;

        // Index by zone-relative path: subpaths are first-class, and two
        // subpaths may carry the same basename without evicting each other.
        let indexed_key = dest
            .strip_prefix(&raw_root)
            .unwrap_or(&file.rel_path)
            .to_string_lossy()
            .to_string();
        index.upsert(&indexed_key, hex);
        Ok((FileDisposition::Promoted, None))
    }

    /// Landing files whose digests are not yet in the Raw index or the
    /// quarantine ledger — the candidates the next promotion pass will touch.
    /// Callers use this to avoid re-validating files already settled.
    pub fn pending_landing_files(&self, service: &str) -> PipelineResult<Vec<FileRecord>> {
        let index = HashIndex::load(&self.layout, Zone::Raw, service);
        let quarantined = self.quarantine_ledger(service);
        let mut pending = Vec::new();
        for file in self.layout.list_files(Zone::Landing, service, "**/*")? {
            let hex = digest_hex(&digest_file_with_retry(&file.path)?);
            if !index.contains_digest(&hex) && !quarantined.contains_digest(&hex) {
                pending.push(file);
            }
        }
        Ok(pending)
    }

    /// Copy a set of zone files into quarantine and record their digests so
    /// later passes skip them.  Originals are never removed — upstream zones
    /// stay immutable.
    pub fn quarantine_files(
        &self,
        service: &str,
        files: &[FileRecord],
        reason: &str,
    ) -> PipelineResult<usize> {
        let mut count = 0;
        for file in files {
            let hex = digest_hex(&digest_file_with_retry(&file.path)?);
            self.copy_to_quarantine(service, file, &hex)?;
            count += 1;
        }
        if count > 0 {
            warn!("quarantined {} file(s) for {}: {}", count, service, reason);
        }
        Ok(count)
    }

    fn quarantine_ledger(&self, service: &str) -> HashIndex {
        HashIndex::load_at(self.layout.quarantine_dir(service).join("_hashes.json"))
    }

    fn copy_to_quarantine(&self, service: &str, file: &FileRecord, hex: &str) -> PipelineResult<()> {
        let dir = self.layout.quarantine_dir(service);
        let dest = dir.join(&file.rel_path);
        atomic_copy(&file.path, &dest)?;
        let mut ledger = self.quarantine_ledger(service);
        ledger.upsert(&file.rel_path.to_string_lossy(), hex.to_string());
        ledger.save()?;
        warn!(
            "landing2raw: {} quarantined {} → {}",
            service,
            file.basename,
            dest.display()
        );
        Ok(())
    }

    // ── Staging → Curated ────────────────────────────────────────────────────

    /// Refresh one curated artifact from a cleaner-produced candidate.
    ///
    /// The candidate is consumed: renamed into place on replacement, deleted
    /// on no-op.  On replacement the prior artifact is archived first, so a
    /// crash between the two steps leaves the prior curated file intact (the
    /// archive copy is redundant, never missing).
    pub fn refresh_curated(
        &self,
        service: &str,
        candidate: &Path,
        final_name: &str,
    ) -> PipelineResult<CuratedOutcome> {
        let _write_lock = ZoneWriteLock::acquire(&self.layout, Zone::Curated, service)?;

        let candidate_hex = digest_file_hex(candidate)?;
        let mut index = HashIndex::load(&self.layout, Zone::Curated, service);
        let dest = self
            .layout
            .path_for(Zone::Curated, service, None)
            .join(final_name);

        let current_hex = if dest.exists() {
            // Trust the bytes over the index; the index may lag a crash.
            Some(digest_file_hex(&dest)?)
        } else {
            None
        };

        if current_hex.as_deref() == Some(candidate_hex.as_str()) {
            std::fs::remove_file(candidate).map_err(|e| {
                PipelineError::path(candidate, format!("candidate cleanup failed: {}", e))
            })?;
            info!("staging2curated: {} — {} unchanged (no-op)", service, final_name);
            return Ok(CuratedOutcome::NoOp);
        }

        let created = current_hex.is_none();
        if let Some(prior_hex) = current_hex {
            let archived_as = self.archive_prior(service, &dest, final_name, &prior_hex)?;
            debug!(
                "staging2curated: {} archived prior {} as {}",
                service, final_name, archived_as
            );
        }

        // Stage the candidate inside the curated directory so the final
        // rename happens on one filesystem.
        atomic_copy(candidate, &dest)?;
        std::fs::remove_file(candidate).map_err(|e| {
            PipelineError::path(candidate, format!("candidate cleanup failed: {}", e))
        })?;

        index.upsert(final_name, candidate_hex);
        index.save()?;
        info!(
            "staging2curated: {} — {} {}",
            service,
            final_name,
            if created { "created" } else { "replaced" }
        );
        Ok(if created {
            CuratedOutcome::Created
        } else {
            CuratedOutcome::Replaced
        })
    }

    fn archive_prior(
        &self,
        service: &str,
        current: &Path,
        final_name: &str,
        prior_hex: &str,
    ) -> PipelineResult<String> {
        let archive_dir = self.layout.path_for(Zone::Archive, service, None);
        let stamp = archive_stamp(chrono::Utc::now());

        // The stamp is second-resolution; two replacements of the same
        // artifact inside one second must not overwrite each other's
        // archive copy.  Suffix a sequence number until the name is free.
        let mut archived_as = stamped_name(final_name, &stamp);
        let mut seq = 1u32;
        while archive_dir.join(&archived_as).exists() {
            seq += 1;
            archived_as = stamped_name(final_name, &format!("{}-{}", stamp, seq));
        }

        let dest = archive_dir.join(&archived_as);
        atomic_copy(current, &dest)?;
        archive::append_entry(
            &self.layout,
            service,
            &ManifestEntry {
                basename: final_name.to_string(),
                archived_as: archived_as.clone(),
                digest: prior_hex.to_string(),
                archived_at: chrono::Utc::now(),
            },
        )?;
        Ok(archived_as)
    }

    // ── Verification ─────────────────────────────────────────────────────────

    /// Recompute digests for every indexed file in Raw and Curated and
    /// compare against the stored index.  Used by `pipeline verify`.
    ///
    /// Index keys are zone-relative paths, so entries resolve correctly for
    /// files stored under a subpath.
    pub fn verify(&self, service: &str) -> PipelineResult<Vec<VerifyMismatch>> {
        let mut mismatches = Vec::new();
        for zone in [Zone::Raw, Zone::Curated] {
            let index = HashIndex::load(&self.layout, zone, service);
            let dir = self.layout.path_for(zone, service, None);
            for (rel_path, expected) in index.iter() {
                let path = dir.join(rel_path);
                if !path.exists() {
                    mismatches.push(VerifyMismatch {
                        zone,
                        rel_path: rel_path.to_string(),
                        expected: expected.to_string(),
                        actual: None,
                    });
                    continue;
                }
                let actual = digest_file_hex(&path)?;
                if actual != expected {
                    mismatches.push(VerifyMismatch {
                        zone,
                        rel_path: rel_path.to_string(),
                        expected: expected.to_string(),
                        actual: Some(actual),
                    });
                }
            }
        }
        Ok(mismatches)
    }
}

#[derive(Debug, Clone)]
pub struct VerifyMismatch {
    pub zone: Zone,
    /// Zone-relative path of the indexed entry.
    pub rel_path: String,
    pub expected: String,
    /// `None` when the indexed file is missing from the zone.
    pub actual: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Atomic file plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// `<stem>_<stamp>.<ext>` for archive copies (`<name>_<stamp>` when there
/// is no extension).
fn stamped_name(final_name: &str, stamp: &str) -> String {
    match final_name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}_{}.{}", stem, stamp, ext),
        None => format!("{}_{}", final_name, stamp),
    }
}

/// Conflict name for a basename that already exists with different bytes:
/// `name__<yyyymmddThhmmss>` inserted before the extension.
fn conflict_path(dest: &Path, now: chrono::DateTime<chrono::Utc>) -> PathBuf {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stamp = archive_stamp(now);
    let renamed = match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}__{}.{}", stem, stamp, ext),
        None => format!("{}__{}", name, stamp),
    };
    dest.with_file_name(renamed)
}

/// Copy `src` to `dest` via a dot-prefixed temp sibling + rename, creating
/// parent directories as needed.  Readers of `dest` never observe partial
/// bytes; an interrupted copy leaves only an invisible temp file.
fn atomic_copy(src: &Path, dest: &Path) -> PipelineResult<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| PipelineError::path(dest, "destination has no parent"))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| PipelineError::path(parent, format!("create failed: {}", e)))?;

    let tmp_name = format!(
        ".{}.tmp",
        dest.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("candidate")
    );
    let tmp = parent.join(tmp_name);
    std::fs::copy(src, &tmp)
        .map_err(|e| PipelineError::path(&tmp, format!("copy failed: {}", e)))?;
    std::fs::rename(&tmp, dest)
        .map_err(|e| PipelineError::path(dest, format!("rename failed: {}", e)))?;
    Ok(())
}
