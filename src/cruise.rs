// src/cruise.rs
//! Cruise-control: the unified rate / concurrency / timeout policy.
//!
//! One `CruiseControl` is built from the scan options and shared by every
//! protocol executer. It carries two profiles (standard and headless) and a
//! single process-wide token-bucket rate limiter; every network call must
//! acquire a token before going out, regardless of which protocol path
//! originated it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::TemplarError;

/// Per-profile concurrency ceilings
#[derive(Debug, Clone, Copy)]
pub struct Concurrency {
    pub hosts: usize,
    pub templates: usize,
    pub payloads: usize,
}

/// Per-profile duration policy
#[derive(Debug, Clone, Copy)]
pub struct Durations {
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

/// Requests-per-second cap with burst allowance
#[derive(Debug, Clone, Copy)]
pub struct Rate {
    pub requests_per_second: u32,
    pub burst: u32,
}

/// One scheduling profile: standard or headless
#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub concurrency: Concurrency,
    pub durations: Durations,
    pub rate: Rate,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            concurrency: Concurrency {
                hosts: 25,
                templates: 25,
                payloads: 25,
            },
            durations: Durations {
                timeout: Duration::from_secs(10),
                retry_backoff: Duration::from_millis(100),
            },
            rate: Rate {
                requests_per_second: 150,
                burst: 150,
            },
        }
    }
}

/// Process-wide rate/concurrency/timeout policy, immutable after construction
pub struct CruiseControl {
    standard: Profile,
    headless: Profile,
    limiter: Arc<RateLimiter>,
}

impl CruiseControl {
    pub fn new(standard: Profile, headless: Profile) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            standard.rate.requests_per_second,
            standard.rate.burst,
        ));
        Self {
            standard,
            headless,
            limiter,
        }
    }

    pub fn standard(&self) -> &Profile {
        &self.standard
    }

    pub fn headless(&self) -> &Profile {
        &self.headless
    }

    /// The shared limiter every executer must go through
    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    /// Release limiter resources; acquisitions after this fail `Cancelled`
    pub fn close(&self) {
        self.limiter.close();
    }
}

impl Default for CruiseControl {
    fn default() -> Self {
        let headless = Profile {
            concurrency: Concurrency {
                hosts: 10,
                templates: 10,
                payloads: 10,
            },
            ..Profile::default()
        };
        Self::new(Profile::default(), headless)
    }
}

/// Token bucket: capacity `burst`, one token refilled every `1s / rate`.
///
/// Tokens are refilled lazily from elapsed time on each acquire, so there
/// is no background task; `close()` only flips the gate.
pub struct RateLimiter {
    rate: u32,
    burst: u32,
    state: Mutex<BucketState>,
    closed: AtomicBool,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// A `rate` of 0 disables limiting entirely.
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            rate,
            burst: burst.max(1),
            state: Mutex::new(BucketState {
                tokens: burst.max(1) as f64,
                last_refill: Instant::now(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Take one token, sleeping until one is available.
    ///
    /// This is a cancellation point: returns `Cancelled` once the limiter
    /// is closed.
    pub async fn acquire(&self) -> Result<(), TemplarError> {
        if self.rate == 0 {
            return Ok(());
        }

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TemplarError::Cancelled);
            }

            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens =
                    (state.tokens + elapsed * self.rate as f64).min(self.burst as f64);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }

                // Time until the next whole token exists
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate as f64)
            };

            tokio::time::sleep(wait).await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_acquires_without_waiting() {
        let limiter = RateLimiter::new(10, 5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_rate_is_enforced_after_burst() {
        // burst 2, then 2 more tokens at 20/s needs ~100ms
        let limiter = RateLimiter::new(20, 2);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_zero_rate_is_unlimited() {
        let limiter = RateLimiter::new(0, 1);
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.acquire().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_closed_limiter_rejects() {
        let limiter = RateLimiter::new(10, 1);
        limiter.acquire().await.unwrap();
        limiter.close();
        let result = limiter.acquire().await;
        assert!(matches!(result, Err(TemplarError::Cancelled)));
    }

    #[test]
    fn test_default_profiles() {
        let cruise = CruiseControl::default();
        assert_eq!(cruise.standard().concurrency.hosts, 25);
        assert_eq!(cruise.headless().concurrency.hosts, 10);
        assert_eq!(cruise.standard().rate.requests_per_second, 150);
    }
}
