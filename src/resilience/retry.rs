//! Retry logic with exponential backoff and jitter.
//!
//! Two entry points:
//! - [`retry`] keeps retrying every failure (used for local backend
//!   connections where any error is worth another attempt);
//! - [`retry_classified`] consults a predicate so terminal failures
//!   short-circuit immediately, and races every sleep against a
//!   cancellation token.
//!
//! # Example
//!
//! ```
//! use transcript_sync::RetryConfig;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Dispatch: bounded retries for quota/server errors
//! let dispatch = RetryConfig::dispatch();
//! assert_eq!(dispatch.max_retries, Some(4));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configuration for retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - fast-fail for initial connections
/// - [`RetryConfig::dispatch()`] - bounded backoff for quota/server errors
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Random extra delay fraction (0.25 = up to +25% per sleep)
    pub jitter: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::dispatch()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial local-store connections.
    /// Attempts 5 times with exponential backoff; a bad path or URL
    /// surfaces within a few seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Bounded backoff for outbound dispatch (quota and server errors).
    /// Exhaustion re-queues the batch rather than dropping it, so this
    /// stays short enough not to stall the run loop.
    #[must_use]
    pub fn dispatch() -> Self {
        Self {
            max_retries: Some(4),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.25,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let backed_off = delay.mul_f64(self.factor).min(self.max_delay);
        if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(0.0..self.jitter);
            backed_off.mul_f64(1.0 + spread)
        } else {
            backed_off
        }
    }
}

/// Why a classified retry loop gave up.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("retries exhausted: {0}")]
    Exhausted(E),
    #[error("terminal failure: {0}")]
    Terminal(E),
    #[error("cancelled while waiting to retry")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying error, if the loop wasn't cancelled.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted(e) | Self::Terminal(e) => Some(e),
            Self::Cancelled => None,
        }
    }
}

/// Retry every failure with exponential backoff.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }

                warn!(
                    "Operation '{}' failed (attempt {}): {}. Retrying in {:?}...",
                    operation_name, attempts, err, delay
                );

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Retry only failures the predicate classifies as transient; terminal
/// failures return immediately. Every backoff sleep is raced against the
/// cancellation token so a session stop aborts an in-flight wait.
pub async fn retry_classified<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                if !retryable(&err) {
                    return Err(RetryError::Terminal(err));
                }

                attempts += 1;
                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        warn!(
                            "Operation '{}' exhausted {} retries: {}",
                            operation_name, max, err
                        );
                        return Err(RetryError::Exhausted(err));
                    }
                }

                warn!(
                    "Operation '{}' failed (attempt {}): {}. Retrying in {:?}...",
                    operation_name, attempts, err, delay
                );
                crate::metrics::record_dispatch_retry(operation_name);

                tokio::select! {
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = sleep(delay) => {}
                }
                delay = config.next_delay(delay);
            }
        }
    }
}
