//! Transient error retry
//!
//! Adapter calls that fail for reasons that usually go away on their own
//! (timeouts, resets, throttling, 5xx) are retried with exponential backoff.
//! Everything else is returned on the first failure.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use treesync_core::config::RetryConfig;
use treesync_transfer::TransferError;

/// Backoff schedule for [`with_retry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Determines if an error is transient and should be retried
///
/// Typed causes decide first: transfer errors other than I/O are permanent,
/// I/O errors are classified by kind. Otherwise only the root cause's message
/// is inspected, never the context added on top of it (which carries paths).
///
/// Transient errors include:
/// - Network errors (connection refused or reset, timeout, DNS)
/// - Throttling (HTTP 429, "rate limit", "temporarily unavailable")
/// - Server errors (HTTP 5xx)
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(transfer) = cause.downcast_ref::<TransferError>() {
            return match transfer {
                TransferError::Io(io) => is_transient_io(io),
                _ => false,
            };
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return is_transient_io(io);
        }
    }

    let root = err.root_cause().to_string().to_lowercase();

    // Network errors
    if root.contains("network")
        || root.contains("connection")
        || root.contains("timed out")
        || root.contains("timeout")
        || root.contains("dns")
        || root.contains("reset by peer")
        || root.contains("broken pipe")
    {
        return true;
    }

    // Throttling
    if root.contains("too many requests")
        || root.contains("rate limit")
        || root.contains("temporarily unavailable")
        || root.contains("server error")
    {
        return true;
    }

    // HTTP status codes, as whole words only
    root.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| matches!(word, "429" | "500" | "502" | "503" | "504"))
}

fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::TimedOut
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

/// Executes an async operation with exponential backoff retry
///
/// Only retries on transient errors. Non-transient errors are returned
/// immediately, as is the last error once `policy.max_attempts` is spent or
/// `cancel` fires during a backoff.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt + 1 < policy.max_attempts && is_transient_error(&err) {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient error, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(err.context("cancelled while waiting to retry"));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                } else {
                    return Err(err);
                }
            }
        }
    }
}
