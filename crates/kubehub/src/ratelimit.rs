//! Token bucket shared by every request a `KubeSource` makes.

use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;

/// Tokens are stored scaled by 1000 for sub-token precision.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<BucketState>,
    /// Scaled tokens gained per millisecond (== requests per second).
    milli_rate: u64,
    /// Capacity in scaled tokens.
    capacity: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `qps` refill rate, `burst` capacity. The bucket starts full.
    pub fn new(qps: f64, burst: u32) -> Self {
        let capacity = u64::from(burst.max(1)) * 1000;
        Self {
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
            milli_rate: ((qps.max(0.001)) * 1000.0).round().max(1.0) as u64,
            capacity,
        }
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed_ms = now.duration_since(st.last_refill).as_millis() as u64;
        if elapsed_ms > 0 {
            // scaled tokens per ms == milli_rate / 1000 * 1000
            st.tokens = (st.tokens + elapsed_ms.saturating_mul(self.milli_rate) / 1000).min(self.capacity);
            st.last_refill = now;
        }
        if st.tokens >= 1000 {
            st.tokens -= 1000;
            return Ok(());
        }
        let missing = 1000 - st.tokens;
        let wait_ms = (missing * 1000).div_ceil(self.milli_rate).max(1);
        Err(Duration::from_millis(wait_ms))
    }

    /// Wait for a token.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    counter!("kube_rate_limited_waits_total", 1u64);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
