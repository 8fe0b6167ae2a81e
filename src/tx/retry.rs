//! Retry wrapper for RPC calls with classified errors
//!
//! Every call site passes a classification function deciding, per error,
//! whether to retry with jittered exponential backoff, abort, or treat the
//! error as success.

use crate::config::RetryConfig;
use crate::error::{RpcErrorKind, RpcFailure};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back off and try again, while attempts remain
    Retry,
    /// Give up and hand the error to the caller
    Abort,
    /// Swallow the error; the call is treated as done
    Ignore,
}

/// Bounded or unbounded jittered exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// `None` retries until success or a non-retryable error
    pub max_attempts: Option<u32>,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl RetryPolicy {
    pub fn bounded(config: &RetryConfig) -> Self {
        Self {
            max_attempts: Some(config.max_attempts.max(1)),
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
            multiplier: config.multiplier,
            randomization_factor: config.randomization_factor,
        }
    }

    pub fn unbounded(config: &RetryConfig) -> Self {
        Self {
            max_attempts: None,
            ..Self::bounded(config)
        }
    }

    #[cfg(test)]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            randomization_factor: self.randomization_factor,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Run `op` under `policy`.
///
/// Returns `Ok(Some(value))` on success, `Ok(None)` when an error was
/// classified as [`Disposition::Ignore`], and `Err` when the error was
/// aborted or attempts ran out.
pub async fn retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    operation: &str,
    mut classify: C,
    mut op: F,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> Disposition,
    E: Display,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let err = match op().await {
            Ok(value) => return Ok(Some(value)),
            Err(err) => err,
        };

        match classify(&err) {
            Disposition::Ignore => {
                debug!("{} ignored error: {}", operation, err);
                return Ok(None);
            }
            Disposition::Abort => {
                debug!("{} aborted: {}", operation, err);
                return Err(err);
            }
            Disposition::Retry if policy.exhausted(attempt) => {
                warn!("{} failed after {} attempts: {}", operation, attempt, err);
                return Err(err);
            }
            Disposition::Retry => {
                let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
                debug!(
                    "{} failed (attempt {}), retrying in {:?}: {}",
                    operation, attempt, delay, err
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// [`retry`] for call sites whose classification never ignores errors
pub async fn retry_call<T, F, Fut, C>(
    policy: &RetryPolicy,
    operation: &str,
    classify: C,
    op: F,
) -> Result<T, RpcFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcFailure>>,
    C: FnMut(&RpcFailure) -> Disposition,
{
    retry(policy, operation, classify, op)
        .await?
        .ok_or_else(|| RpcFailure::transport(format!("{} returned no result", operation)))
}

/// Retry transient failures, abort on anything the node has classified
pub fn transient_only(err: &RpcFailure) -> Disposition {
    match err.kind() {
        RpcErrorKind::Transient => Disposition::Retry,
        RpcErrorKind::KnownTransaction | RpcErrorKind::Unsupported => Disposition::Abort,
    }
}

/// Retry everything
pub fn always(_: &RpcFailure) -> Disposition {
    Disposition::Retry
}

/// Fee-market probing: "not supported" is final
pub fn classify_fee_market(err: &RpcFailure) -> Disposition {
    match err.kind() {
        RpcErrorKind::Unsupported => Disposition::Abort,
        _ => Disposition::Retry,
    }
}

/// Broadcasting: a known transaction means a variant is already accepted
pub fn broadcast(err: &RpcFailure) -> Disposition {
    match err.kind() {
        RpcErrorKind::KnownTransaction => Disposition::Ignore,
        _ => Disposition::Retry,
    }
}
