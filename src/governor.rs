//! Retry/timeout governor: per-phase deadlines and bounded retries.
//!
//! One `Governor` is created per poll cycle. It owns the cycle's overall
//! deadline and cancellation token; every network or repository step of the
//! cycle runs through [`Governor::bounded`], and retryable steps are wrapped in
//! [`Governor::retry`].
//!
//! Cancellation is cooperative: a step that exceeds its deadline is abandoned at
//! its next `.await`, and blocking socket calls return at their own socket
//! timeout, which the transport sets to the same phase deadline.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Backoff, RetryPolicy, TimeoutConfig};
use crate::error::{IngestError, Phase};

/// Deadline + retry budget for a single poll cycle.
#[derive(Debug)]
pub struct Governor {
    timeouts: TimeoutConfig,
    retry: RetryPolicy,
    cancel: CancellationToken,
    started: Instant,
    retries: AtomicU32,
}

impl Governor {
    /// Start a new cycle budget. The overall deadline starts counting now.
    pub fn new(timeouts: TimeoutConfig, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            timeouts,
            retry,
            cancel,
            started: Instant::now(),
            retries: AtomicU32::new(0),
        }
    }

    /// Token cancelled on shutdown or when the overall deadline elapses.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Deadline configured for a phase.
    pub fn limit(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Connect => self.timeouts.connect,
            Phase::Login => self.timeouts.login,
            Phase::Fetch => self.timeouts.fetch,
            Phase::Operation => self.timeouts.operation,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left in the overall cycle budget.
    pub fn remaining(&self) -> Duration {
        self.timeouts.operation.saturating_sub(self.elapsed())
    }

    /// Total retries performed so far in this cycle.
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    fn overall_expired(&self) -> IngestError {
        self.cancel.cancel();
        IngestError::Timeout {
            phase: Phase::Operation,
            elapsed: self.elapsed(),
        }
    }

    /// Run one step under the deadline of `phase`, clipped to what is left of
    /// the overall budget.
    ///
    /// A timeout caused by the clipped overall budget is reported as
    /// `Phase::Operation` and cancels the whole cycle.
    pub async fn bounded<T, Fut>(&self, phase: Phase, fut: Fut) -> Result<T, IngestError>
    where
        Fut: Future<Output = Result<T, IngestError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(self.overall_expired());
        }

        let limit = self.limit(phase);
        let clipped = limit > remaining;
        let budget = if clipped { remaining } else { limit };
        let step_started = Instant::now();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            res = tokio::time::timeout(budget, fut) => match res {
                Ok(inner) => inner,
                Err(_) if clipped => Err(self.overall_expired()),
                Err(_) => {
                    debug!(phase = %phase, ?budget, "Step deadline elapsed");
                    Err(IngestError::Timeout {
                        phase,
                        elapsed: step_started.elapsed(),
                    })
                }
            },
        }
    }

    /// Retry `op` on retryable failures, at most `max_retries` extra times.
    ///
    /// Non-retryable errors are returned as-is on first sight. When the budget
    /// is exhausted the last error is returned wrapped in
    /// `IngestError::RetriesExhausted` with the attempt count. When the next
    /// delay would overrun the cycle budget the last error is wrapped in
    /// `IngestError::BudgetExhausted` and the cycle is cancelled.
    pub async fn retry<T, F, Fut>(&self, phase: Phase, mut op: F) -> Result<T, IngestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        let mut delays = RetryDelays::new(&self.retry);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt > self.retry.max_retries {
                warn!(phase = %phase, attempts = attempt, error = %err, "Retry budget exhausted");
                return Err(IngestError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = delays.next_delay();
            if delay >= self.remaining() {
                warn!(
                    phase = %phase,
                    attempts = attempt,
                    ?delay,
                    error = %err,
                    "Retry delay overruns cycle budget"
                );
                self.cancel.cancel();
                return Err(IngestError::BudgetExhausted {
                    attempts: attempt,
                    elapsed: self.elapsed(),
                    source: Box::new(err),
                });
            }
            warn!(
                phase = %phase,
                attempt,
                max_retries = self.retry.max_retries,
                ?delay,
                error = %err,
                "Retrying after failure"
            );
            self.retries.fetch_add(1, Ordering::Relaxed);
            self.pause(delay).await?;
        }
    }

    /// Sleep between attempts unless the cycle is cancelled first.
    async fn pause(&self, delay: Duration) -> Result<(), IngestError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(IngestError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Delay sequence derived from a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryDelays {
    base: Duration,
    backoff: Backoff,
    jitter: bool,
    attempt: u32,
}

impl RetryDelays {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            base: policy.retry_delay,
            backoff: policy.backoff,
            jitter: policy.jitter,
            attempt: 0,
        }
    }

    /// Next delay in the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let capped_ms = match self.backoff {
            Backoff::Fixed => self.base.as_millis(),
            Backoff::Exponential { max_delay } => {
                // min(base * 2^attempt, max_delay)
                let shift = self.attempt.min(63);
                let multiplier = 1u128.checked_shl(shift).unwrap_or(u128::MAX);
                let exp_ms = self.base.as_millis().saturating_mul(multiplier);
                exp_ms.min(max_delay.as_millis())
            }
        };
        self.attempt = self.attempt.saturating_add(1);

        let capped_ms = capped_ms.min(u64::MAX as u128) as u64;
        let ms = if self.jitter && capped_ms > 0 {
            rand::thread_rng().gen_range(0..=capped_ms)
        } else {
            capped_ms
        };
        Duration::from_millis(ms)
    }
}
