//! Retry discipline for unit invocations.
//!
//! `Transient` and `RateLimited` failures retry with jittered exponential
//! backoff until the configured elapsed budget runs out.  Everything else is
//! permanent for the current run and surfaces on the first attempt.

use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::core::config::RetryConfig;
use crate::core::errors::{PipelineError, PipelineResult};

fn build_backoff(cfg: &RetryConfig) -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(cfg.initial_interval_ms))
        .with_max_interval(Duration::from_millis(cfg.max_interval_ms))
        .with_randomization_factor(cfg.jitter.clamp(0.0, 1.0))
        .with_max_elapsed_time(Some(Duration::from_millis(cfg.max_elapsed_ms)))
        .build()
}

/// Run `op`, retrying retryable failures per `cfg`.
pub async fn with_retries<T, F, Fut>(cfg: &RetryConfig, label: &str, mut op: F) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let backoff = build_backoff(cfg);
    backoff::future::retry(backoff, || {
        let fut = op();
        async {
            match fut.await {
                Ok(v) => Ok(v),
                Err(e) if e.is_retryable() => {
                    debug!("{}: retryable failure, backing off: {}", label, e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}
