use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bordergraph::rate_limiter::MIN_RATE;
use bordergraph::RateLimiter;

#[test]
fn test_burst_within_capacity_is_immediate() {
    let limiter = RateLimiter::new(10.0);
    let start = Instant::now();
    for _ in 0..10 {
        limiter.acquire();
    }
    assert!(start.elapsed() < Duration::from_millis(200));
    assert_eq!(limiter.wait_count(), 0);
}

#[test]
fn test_many_requests_respect_rate() {
    // 30 requests at 20/s cannot finish in under (30 - 20) / 20 seconds
    let limiter = RateLimiter::new(20.0);
    let start = Instant::now();
    for _ in 0..30 {
        limiter.acquire();
    }
    assert!(start.elapsed() >= Duration::from_millis(490));
    assert!(limiter.wait_count() >= 9);
}

#[test]
fn test_shared_between_threads() {
    let limiter = Arc::new(RateLimiter::new(20.0));
    let start = Instant::now();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                for _ in 0..10 {
                    limiter.acquire();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // 40 acquisitions at 20/s with a 20-token bucket
    assert!(start.elapsed() >= Duration::from_millis(990));
}

#[test]
fn test_sub_one_rate_has_single_token() {
    let limiter = RateLimiter::new(0.25);
    assert!((limiter.rate() - 0.25).abs() < 1e-12);

    let start = Instant::now();
    limiter.acquire();
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_invalid_rate_falls_back() {
    assert_eq!(RateLimiter::new(0.0).rate(), 1.0);
    assert_eq!(RateLimiter::new(f64::NAN).rate(), 1.0);
    assert_eq!(RateLimiter::default().rate(), 4.0);
}

#[test]
fn test_tiny_rate_is_clamped() {
    assert_eq!(RateLimiter::new(1e-300).rate(), MIN_RATE);
}
