use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

/// Slowest supported rate: one request every 1000 seconds.
pub const MIN_RATE: f64 = 0.001;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every worker that talks to one service.
///
/// The bucket refills continuously at `rate` tokens per second and holds at most
/// `rate` tokens (one token for sub-1/s rates). The lock is held while a caller
/// sleeps off its deficit, so waiting callers queue behind it in order.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
    waits: AtomicU64,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        let rate = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second.max(MIN_RATE)
        } else {
            1.0
        };
        let capacity = rate.max(1.0);
        RateLimiter {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            waits: AtomicU64::new(0),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Blocks until a token is available, then consumes it.
    pub fn acquire(&self) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate);
            trace!(wait_ms = wait.as_millis() as u64, "rate limiter waiting");
            self.waits.fetch_add(1, Ordering::Relaxed);
            thread::sleep(wait);
            bucket.tokens = 0.0;
            bucket.last_refill = Instant::now();
        } else {
            bucket.tokens -= 1.0;
        }
    }

    /// Number of acquisitions that had to sleep.
    pub fn wait_count(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(4.0)
    }
}
