//! Bounded store calls.
//!
//! Every store call runs under a timeout. Timeouts and transient failures
//! are retried with exponential backoff; conflicts and other errors are
//! returned at once so the caller can rescan.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{Context, Error, Result};

/// Timeout and backoff settings for store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.store_timeout(),
            max_retries: config.max_transient_retries,
            backoff: config.backoff(0),
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Run a store call, retrying timeouts and transient failures.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, context: Context, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = canopy_store::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(source)) if source.is_transient() && attempt < policy.max_retries => {
                warn!("{}: store call failed ({}), retry {}", context, source, attempt + 1);
            }
            Ok(Err(source)) => return Err(Error::Store { context, source }),
            Err(_) if attempt < policy.max_retries => {
                warn!(
                    "{}: store call timed out after {:?}, retry {}",
                    context,
                    policy.timeout,
                    attempt + 1
                );
            }
            Err(_) => {
                return Err(Error::Timeout {
                    context,
                    after: policy.timeout,
                })
            }
        }
        tokio::time::sleep(policy.delay(attempt)).await;
        attempt += 1;
    }
}
