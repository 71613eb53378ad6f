//! Token bucket limiting the request rate towards one backend.

use std::sync::Mutex;
use tokio::time::Instant;

/// Token bucket refilled continuously at `capacity` tokens per minute.
///
/// The bucket starts full. The lock is held only for arithmetic.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Limiter admitting `requests` per minute with bursts up to `requests`.
    pub fn per_minute(requests: u32) -> Self {
        let capacity = f64::from(requests);
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently in the bucket (fractional).
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        bucket.tokens
    }
}
