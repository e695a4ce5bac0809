// packages/engine/src/analysis/rate_limiter.rs
//! Token bucket gate in front of external dispatch
//!
//! One bucket per coordinator, initialized full when the coordinator is built
//! and never reset afterwards. Callers wait for a token instead of failing.

use crate::utils::config::RateLimitConfig;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Longest single wait handed back to callers; `acquire` re-checks after it
const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Process-wide token bucket
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.capacity.max(1));
        Self {
            capacity,
            refill_per_sec: config.refill_per_sec.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, or report how long until one is available
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            let wait = Duration::try_from_secs_f64(missing / self.refill_per_sec).unwrap_or(MAX_WAIT);
            Err(wait.min(MAX_WAIT))
        }
    }

    /// Wait until a token is available and take it
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}
