/// Per-account token bucket over order requests
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// One bucket per account, refilled to capacity once per minute
pub struct OrderRateLimiter {
    capacity: u32,
    refill_period: Duration,
    buckets: Mutex<HashMap<u64, Bucket>>,
}

impl OrderRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        OrderRateLimiter {
            capacity: requests_per_minute.max(1),
            refill_period: Duration::from_secs(60),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token, returns false when the account is over budget
    pub async fn try_acquire(&self, account_id: u64) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(account_id).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: Instant::now(),
        });

        let elapsed = bucket.last_refill.elapsed();
        if elapsed >= self.refill_period {
            bucket.tokens = self.capacity;
            bucket.last_refill = Instant::now();
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }
}
