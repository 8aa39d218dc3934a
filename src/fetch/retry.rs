use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::rate_limiter::RateLimiter;
use crate::shared::{ErrorClass, FetchError};

/// Retry budget and delays for one call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// First transport backoff; doubles on every further attempt.
    pub initial_backoff: Duration,

    /// Wait used when a rate-limited response carries no `Retry-After`.
    pub rate_limit_fallback: Duration,

    interrupt: Option<Arc<AtomicBool>>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_secs(2),
            rate_limit_fallback: Duration::from_secs(60),
            interrupt: None,
        }
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_rate_limit_fallback(mut self, wait: Duration) -> Self {
        self.rate_limit_fallback = wait;
        self
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Backoff before retry number `attempt + 1`: 2s, 4s, 8s, ... with the default start.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3)
    }
}

/// Runs `op` until it succeeds, fails permanently, or the retry budget is spent.
///
/// Every attempt first takes a token from `limiter`. `classify` decides whether
/// an error is worth another attempt and which delay applies.
pub fn with_retry<T, Op, C>(
    policy: &RetryPolicy,
    limiter: &RateLimiter,
    label: &str,
    classify: C,
    mut op: Op,
) -> Result<T, FetchError>
where
    Op: FnMut() -> Result<T, FetchError>,
    C: Fn(&FetchError) -> ErrorClass,
{
    let attempts = policy.max_retries + 1;
    let mut attempt = 0;
    loop {
        if policy.interrupted() {
            return Err(FetchError::Interrupted);
        }
        limiter.acquire();

        let error = match op() {
            Ok(value) => {
                if attempt > 0 {
                    debug!(unit = label, attempts = attempt + 1, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let class = classify(&error);
        if class == ErrorClass::Permanent {
            warn!(unit = label, error = %error, "permanent failure");
            return Err(error);
        }
        if attempt >= policy.max_retries {
            warn!(unit = label, attempts, error = %error, "giving up");
            return Err(FetchError::Exhausted {
                attempts,
                last: Box::new(error),
            });
        }

        let wait = match (&error, class) {
            (FetchError::RateLimited { retry_after }, _) => {
                retry_after.unwrap_or(policy.rate_limit_fallback)
            }
            (_, ErrorClass::RateLimited) => policy.rate_limit_fallback,
            _ => policy.backoff_for(attempt),
        };
        warn!(
            unit = label,
            class = %class,
            wait_ms = wait.as_millis() as u64,
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            "retrying"
        );
        if !sleep_unless_interrupted(policy, wait) {
            return Err(FetchError::Interrupted);
        }
        attempt += 1;
    }
}

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Sleeps for `wait` in short slices. Returns false as soon as the interrupt flag is set.
fn sleep_unless_interrupted(policy: &RetryPolicy, wait: Duration) -> bool {
    let start = Instant::now();
    loop {
        if policy.interrupted() {
            return false;
        }
        let elapsed = start.elapsed();
        if elapsed >= wait {
            return true;
        }
        thread::sleep((wait - elapsed).min(SLEEP_SLICE));
    }
}
