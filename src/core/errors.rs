//! Pipeline error taxonomy.
//!
//! Every failure a unit or engine stage can produce maps onto one of these
//! kinds.  Retryability is a property of the *kind*, not of the call site:
//! `Transient` and `RateLimited` may be retried with backoff inside the same
//! run, everything else surfaces immediately and is handled by policy
//! (quarantine, skip-service, remediation plan).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Zone/file path invalid or unwritable. Fatal for the affected unit.
    #[error("path error at {path}: {reason}")]
    Path { path: PathBuf, reason: String },

    /// Digest I/O failed. The engine retries once, then skips the file.
    #[error("hash error at {path}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No valid credentials and interactive acquisition unavailable or failed.
    #[error("authentication failed for {service}: {reason}")]
    AuthFailed { service: String, reason: String },

    /// Interactive second factor needed but the caller cannot provide one.
    #[error("second factor required for {service}")]
    SecondFactorRequired { service: String },

    /// Upstream quota exceeded. Retried with backoff.
    #[error("rate limited by {service}")]
    RateLimited { service: String },

    /// External system down. The service is skipped for this cycle.
    #[error("upstream unavailable for {service}: {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    /// Cleaner detected an incompatible input. Inputs are quarantined.
    #[error("schema changed in {service}: {reason}")]
    SchemaChanged { service: String, reason: String },

    /// Network / I/O blip. Retried a bounded number of times.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Any other cleaner failure. Aborts the service's remaining stages.
    #[error("cleaner {unit} failed: {reason}")]
    Cleaner { unit: String, reason: String },
}

impl PipelineError {
    /// Whether this kind may be retried with backoff inside the same run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Transient(_) | PipelineError::RateLimited { .. }
        )
    }

    /// Short machine-readable tag used in run records and unit logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Path { .. } => "path_error",
            PipelineError::Hash { .. } => "hash_error",
            PipelineError::AuthFailed { .. } => "auth_failed",
            PipelineError::SecondFactorRequired { .. } => "second_factor_required",
            PipelineError::RateLimited { .. } => "rate_limited",
            PipelineError::UpstreamUnavailable { .. } => "upstream_unavailable",
            PipelineError::SchemaChanged { .. } => "schema_changed",
            PipelineError::Transient(_) => "transient",
            PipelineError::Cleaner { .. } => "cleaner_error",
        }
    }

    pub fn path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::Path {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        PipelineError::Transient(reason.into())
    }
}

/// Convenience alias used throughout the engine and orchestrator.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_policy() {
        assert!(PipelineError::transient("socket reset").is_retryable());
        assert!(PipelineError::RateLimited {
            service: "spotify".into()
        }
        .is_retryable());
        assert!(!PipelineError::AuthFailed {
            service: "tiktok".into(),
            reason: "cookies expired".into()
        }
        .is_retryable());
        assert!(!PipelineError::SchemaChanged {
            service: "linktree".into(),
            reason: "missing column".into()
        }
        .is_retryable());
    }

    #[test]
    fn kinds_are_stable_tags() {
        assert_eq!(
            PipelineError::path("/tmp/x", "unwritable").kind(),
            "path_error"
        );
        assert_eq!(PipelineError::transient("blip").kind(), "transient");
    }
}
