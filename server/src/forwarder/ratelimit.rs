//! # Token-Bucket Rate Limiter
//!
//! Simplified byte-rate limiter: burst equals the configured rate, refill
//! is linear in elapsed time, and callers await until their debit fits.
//! A rate of zero (or below) disables the bucket entirely.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

struct BucketState {
    tokens: i64,
    last_fill: Instant,
}

/// Concurrency-safe token bucket. The lock is only held to account
/// tokens, never across a sleep.
pub struct TokenBucket {
    rate: i64,
    burst: i64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `bytes_per_sec <= 0` builds a disabled bucket whose [`wait`]
    /// returns immediately.
    ///
    /// [`wait`]: TokenBucket::wait
    pub fn new(bytes_per_sec: i64) -> Self {
        let rate = bytes_per_sec.max(0);
        Self {
            rate,
            burst: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_fill: Instant::now(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.rate > 0
    }

    /// Debits `n` bytes, sleeping until the bucket can cover them.
    /// Sleeps are at least one millisecond to avoid busy spinning. A
    /// debit larger than the burst can never fit in the bucket, so it
    /// is taken as debt up front and slept off once.
    pub async fn wait(&self, n: usize) {
        if self.rate <= 0 || n == 0 {
            return;
        }
        let need = n as i64;
        loop {
            let (wait, done) = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_fill).as_secs_f64();
                if elapsed > 0.0 {
                    state.tokens = (state.tokens + (self.rate as f64 * elapsed) as i64)
                        .min(self.burst);
                    state.last_fill = now;
                }
                if state.tokens >= need {
                    state.tokens -= need;
                    return;
                }
                let missing = need - state.tokens;
                let wait = Duration::from_secs_f64(missing as f64 / self.rate as f64);
                let oversized = need > self.burst;
                if oversized {
                    state.tokens -= need;
                }
                (wait, oversized)
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
            if done {
                return;
            }
        }
    }
}
