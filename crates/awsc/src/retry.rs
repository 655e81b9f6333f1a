// ai
//! 🔄 Retry — exponential backoff with jitter, and a timeout wrapper to go with it.
//!
//! 🎬 *[503 SlowDown. the chunk sits in the corner, counts to two hundred milliseconds,
//! then four hundred, then eight. on the fourth knock S3 opens the door.]*
//!
//! Shared by the identity refresher (SSO calls), the uploader (per-chunk puts) and the
//! connector's manifest writes. Each caller decides what counts as transient; this
//! module only decides how long to sulk between attempts and how many attempts the
//! budget allows.
//!
//! 🧠 Knowledge graph:
//! - `BackoffPolicy`: base delay, doubling, capped, ±jitter, `max_retries` retries ⇒ `max_retries + 1` attempts.
//! - `Retryable`: "should I try again?" — implemented by each caller's error type.
//! - `retry_transient`: the loop. Returns the final result AND how many attempts it burned.
//! - `with_timeout`: per-call timeout; callers map `TimedOut` into their own transient flavour.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// 🎲 Backoff knobs. Cloned into every job — it's a handful of numbers, not a database.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Multiplier per retry. 2.0 is "doubling", which is what everyone means by exponential.
    pub factor: f64,
    /// Fraction of the delay to randomize (0.25 ⇒ ±25%).
    pub jitter: f64,
    /// Retries after the first attempt. 0 ⇒ exactly one attempt.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.25,
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// 🧪 No waiting, just the budget. Tests love it. Production should not.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 2.0,
            jitter: 0.0,
            max_retries,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Total attempts the budget allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// ⏱️ Delay before retry number `retry` (1-based): `base * factor^(retry-1)`, capped, then jittered.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let the_exponent = retry.saturating_sub(1).min(63) as i32;
        let the_raw_secs = self.base_delay.as_secs_f64() * self.factor.powi(the_exponent);
        let the_capped_secs = the_raw_secs.min(self.max_delay.as_secs_f64());
        if the_capped_secs <= 0.0 {
            return Duration::ZERO;
        }
        let the_spread = the_capped_secs * self.jitter.clamp(0.0, 1.0);
        let the_offset = if the_spread > 0.0 {
            rand::thread_rng().gen_range(-the_spread..=the_spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((the_capped_secs + the_offset).max(0.0))
    }
}

/// 🤔 "Is this worth another try?" — answered by the error itself.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for crate::error::StorageError {
    fn is_transient(&self) -> bool {
        crate::error::StorageError::is_transient(self)
    }
}

/// 📦 What a retry loop hands back: the final result plus the attempt count that produced it.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// 🔄 Run `op` until it succeeds, fails permanently, or the budget runs dry.
///
/// `op` receives the 1-based attempt number. Permanent errors return immediately.
/// The last transient error is returned once `policy.max_attempts()` is reached.
pub async fn retry_transient<T, E, Op, Fut>(policy: &BackoffPolicy, what: &str, mut op: Op) -> Retried<T, E>
where
    E: Retryable + std::fmt::Display,
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let the_budget = policy.max_attempts();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(err) if err.is_transient() && attempt < the_budget => {
                let the_delay = policy.delay_for_retry(attempt);
                warn!(
                    attempt,
                    max_attempts = the_budget,
                    delay_ms = the_delay.as_millis() as u64,
                    "🔄 {what} hit a transient failure, backing off: {err}"
                );
                if !the_delay.is_zero() {
                    tokio::time::sleep(the_delay).await;
                }
            }
            Err(err) => {
                return Retried {
                    result: Err(err),
                    attempts: attempt,
                };
            }
        }
    }
}

/// ⏰ The call took longer than its per-call timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut(pub Duration);

impl std::fmt::Display for TimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timed out after {:?}", self.0)
    }
}

/// ⏰ Run `fut` with a deadline. A zero timeout means "no deadline".
pub async fn with_timeout<F: Future>(timeout: Duration, fut: F) -> Result<F::Output, TimedOut> {
    if timeout.is_zero() {
        return Ok(fut.await);
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TimedOut(timeout))
}
