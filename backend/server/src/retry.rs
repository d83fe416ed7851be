//! # Retry Orchestrator
//!
//! Bounded retries around one [`SubmissionClient`] attempt.
//!
//! - Only `TransientFailure` is retried; success, duplicate and terminal return at once
//! - Wait before attempt `n + 1` is `base * 2^(n - 1)`: 1s, 2s, 4s with the defaults
//! - Every attempt is capped by `attempt_timeout`, a timeout counts as transient
//! - Cancellation is checked before each attempt and raced against each wait
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use records::SubmissionRecord;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::{SubmissionClient, SubmissionContext, SubmissionOutcome};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor)
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Submission cancelled")]
pub struct Cancelled;

/// Bookkeeping for one submission's loop, dropped once it resolves.
#[derive(Debug)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

pub struct Retrier {
    client: Arc<dyn SubmissionClient>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Retrier {
    pub fn new(client: Arc<dyn SubmissionClient>, policy: RetryPolicy) -> Self {
        Self::with_sleeper(client, policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        client: Arc<dyn SubmissionClient>,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            client,
            policy,
            sleeper,
        }
    }

    async fn attempt(&self, record: &SubmissionRecord, ctx: &SubmissionContext) -> SubmissionOutcome {
        let timeout = self.policy.attempt_timeout;

        match tokio::time::timeout(timeout, self.client.submit(record, ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => SubmissionOutcome::TransientFailure {
                cause: format!("attempt timed out after {}ms", timeout.as_millis()),
            },
        }
    }

    pub async fn submit_with_retry(
        &self,
        record: &SubmissionRecord,
        ctx: &SubmissionContext,
        cancel: &CancellationToken,
    ) -> Result<SubmissionOutcome, Cancelled> {
        let mut state = RetryState {
            attempt: 1,
            max_attempts: self.policy.max_attempts.max(1),
            last_error: None,
        };

        loop {
            if cancel.is_cancelled() {
                info!(
                    client_id = %record.client_id,
                    attempt = state.attempt,
                    "Submission cancelled before attempt"
                );
                return Err(Cancelled);
            }

            let cause = match self.attempt(record, ctx).await {
                SubmissionOutcome::TransientFailure { cause } => cause,
                resolved => return Ok(resolved),
            };

            if state.attempt >= state.max_attempts {
                error!(
                    client_id = %record.client_id,
                    attempts = state.attempt,
                    previous = ?state.last_error,
                    "Submission failed after all attempts: {cause}"
                );
                return Ok(SubmissionOutcome::TransientFailure { cause });
            }

            let delay = backoff_delay(state.attempt, self.policy.base_delay);
            warn!(
                client_id = %record.client_id,
                attempt = state.attempt,
                max_attempts = state.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying: {cause}"
            );
            state.last_error = Some(cause);

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(client_id = %record.client_id, "Submission cancelled during backoff");
                    return Err(Cancelled);
                }
                _ = self.sleeper.sleep(delay) => {}
            }

            state.attempt += 1;
        }
    }
}
