//! Token bucket for loader publication.
//!
//! The refill rate is read from a [`DynamicCell`] on every refill. Waits are
//! sliced so a rate change also reaches an acquisition that is already
//! sleeping.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::dynamic::DynamicCell;

/// Longest single sleep between refills.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Shared token bucket. Burst capacity is one second's worth of tokens.
pub struct RateLimiter {
    rate: Arc<DynamicCell<f64>>,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate: Arc<DynamicCell<f64>>) -> Self {
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Current rate in permits per second.
    pub fn rate(&self) -> f64 {
        self.rate.read()
    }

    /// Wait for one permit.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self
                    .bucket
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let rate = self.rate.read();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * rate).min(rate.max(1.0));
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / rate).min(WAIT_SLICE)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::keys;

    fn limiter(rate: f64) -> (Arc<DynamicCell<f64>>, RateLimiter) {
        let cell = Arc::new(DynamicCell::new(keys::RATE_LIMIT, rate));
        let limiter = RateLimiter::new(Arc::clone(&cell));
        (cell, limiter)
    }

    #[tokio::test]
    async fn test_first_permit_is_immediate() {
        let (_, limiter) = limiter(0.5);
        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_throttles_to_rate() {
        let (_, limiter) = limiter(20.0);
        let start = std::time::Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // One initial token, then four refills at 50ms each.
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_rate_change_applies_to_next_acquire() {
        let (cell, limiter) = limiter(0.5);
        limiter.acquire().await;

        assert!(cell.on_external_change("1000"));
        assert_eq!(limiter.rate(), 1000.0);
        let start = std::time::Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_rate_change_wakes_a_sleeping_acquire() {
        let (cell, limiter) = limiter(0.01);
        let limiter = Arc::new(limiter);
        limiter.acquire().await;

        let waiter = tokio::spawn({
            let limiter = Arc::clone(&limiter);
            async move { limiter.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        assert!(cell.on_external_change("1000"));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire kept sleeping on the old rate")
            .unwrap();
    }
}
