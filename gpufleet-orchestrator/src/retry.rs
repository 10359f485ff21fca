//! Retry executors.
//!
//! `retry` is the generic exponential-backoff loop used around every
//! marketplace and storage call. `run_with_oom_backoff` wraps a bounded task
//! that takes a batch-size knob and halves it whenever the failure looks like
//! resource exhaustion.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential: bool,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            exponential: true,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential: false,
            jitter: false,
        }
    }

    /// Delay before retry number `failed_attempts` (1 = after the first failure).
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        let raw = if self.exponential {
            self.base_delay.saturating_mul(1u32 << exp)
        } else {
            self.base_delay
        };
        let capped = if self.max_delay.is_zero() {
            raw
        } else {
            raw.min(self.max_delay)
        };
        if self.jitter && !capped.is_zero() {
            // Equal jitter: keep at least half the delay so retries still back off.
            let half = capped / 2;
            let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
            half + Duration::from_millis(spread)
        } else {
            capped
        }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached; returns the
/// last error. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(policy, label, |_| true, op).await
}

/// Like [`retry`], but stops early when `should_retry` rejects the error.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= max || !should_retry(&e) {
                    if attempt > 1 {
                        warn!("[retry] {} gave up after {} attempt(s): {}", label, attempt, e);
                    }
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    "[retry] {} attempt {}/{} failed: {} (retrying in {:?})",
                    label, attempt, max, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Bound one network call with a wall-clock timeout, folding the elapsed
/// timeout into the call's own error type.
pub async fn with_timeout<T, Fut>(limit: Duration, label: &str, fut: Fut) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(anyhow::anyhow!("{} timed out after {:?}", label, limit)),
    }
}

// -----------------------------------------------------------------------------
// OOM-aware executor
// -----------------------------------------------------------------------------

pub const DEFAULT_OOM_SIGNATURES: &[&str] = &[
    "out of memory",
    "cuda error",
    "resource exhausted",
    "cuda_error_out_of_memory",
    "cudnn_status_alloc_failed",
    "vk_error_out_of_device_memory",
    "std::bad_alloc",
    "failed to allocate",
    "oom-kill",
    "oom killer",
];

/// Failures that no batch size will fix.
pub const DEFAULT_UNRELATED_SIGNATURES: &[&str] = &[
    "no such file or directory",
    "permission denied",
    "invalid argument",
    "unrecognized arguments",
    "modulenotfounderror",
    "importerror",
    "syntaxerror",
    "invalid data found when processing input",
    "unsupported codec",
    "timed out after",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    ResourceExhausted,
    /// Nothing conclusive in the output (e.g. killed by signal, empty stderr).
    Ambiguous,
    Unrelated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OomPolicy {
    pub max_attempts: u32,
    pub min_batch_size: u32,
    pub signatures: Vec<String>,
    pub unrelated_signatures: Vec<String>,
}

impl Default for OomPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            min_batch_size: 1,
            signatures: DEFAULT_OOM_SIGNATURES.iter().map(|s| s.to_string()).collect(),
            unrelated_signatures: DEFAULT_UNRELATED_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl OomPolicy {
    pub fn classify(&self, output: &str) -> FailureClass {
        let lower = output.to_ascii_lowercase();
        if self.signatures.iter().any(|s| lower.contains(&s.to_ascii_lowercase())) {
            return FailureClass::ResourceExhausted;
        }
        if self
            .unrelated_signatures
            .iter()
            .any(|s| lower.contains(&s.to_ascii_lowercase()))
        {
            return FailureClass::Unrelated;
        }
        FailureClass::Ambiguous
    }
}

/// What a failed attempt left behind for classification.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub message: String,
    /// Captured stdout/stderr tail.
    pub output: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OomSuccess<T> {
    pub value: T,
    pub batch_size: u32,
    pub attempted: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OomFailure {
    pub attempted: Vec<u32>,
    pub class: FailureClass,
    pub last: AttemptFailure,
}

impl OomFailure {
    pub fn final_batch_size(&self) -> u32 {
        self.attempted.last().copied().unwrap_or(0)
    }
}

/// Run `op(batch_size)`, halving the batch size after every resource-looking
/// failure. Stops once the floor size has been tried, the attempt budget is
/// spent, or the failure is clearly unrelated to resources.
pub async fn run_with_oom_backoff<T, F, Fut>(
    policy: &OomPolicy,
    label: &str,
    initial_batch_size: u32,
    mut op: F,
) -> Result<OomSuccess<T>, OomFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptFailure>>,
{
    let floor = policy.min_batch_size.max(1);
    let mut size = initial_batch_size.max(floor);
    let mut attempted = Vec::new();

    loop {
        attempted.push(size);
        let failure = match op(size).await {
            Ok(value) => {
                return Ok(OomSuccess {
                    value,
                    batch_size: size,
                    attempted,
                })
            }
            Err(f) => f,
        };

        let class = policy.classify(&format!("{}\n{}", failure.message, failure.output));
        let budget_spent = attempted.len() as u32 >= policy.max_attempts.max(1);
        if class == FailureClass::Unrelated || size <= floor || budget_spent {
            warn!(
                "[oom] {} failed at batch size {} ({:?}), giving up after {:?}",
                label, size, class, attempted
            );
            return Err(OomFailure {
                attempted,
                class,
                last: failure,
            });
        }

        let next = (size / 2).max(floor);
        info!(
            "[oom] {} failed at batch size {} ({:?}); retrying with {}",
            label, size, class, next
        );
        size = next;
    }
}
