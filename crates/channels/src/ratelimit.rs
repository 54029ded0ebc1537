//! Token buckets, one per remote identity.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket counters keyed by remote identity. Capacity equals the
/// per-minute limit; refill is continuous.
pub struct TokenBuckets {
    per_minute: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBuckets {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute: per_minute.max(1) as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_minute / 60.0).min(self.per_minute);
        bucket.last_refill = now;
    }

    /// Take one token if available (inbound: over-limit is refused).
    pub fn try_take(&self, identity: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(identity.to_owned()).or_insert(Bucket {
            tokens: self.per_minute,
            last_refill: now,
        });
        self.refill(bucket, now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available (outbound: over-limit is delayed).
    pub async fn take(&self, identity: &str) {
        loop {
            let wait = {
                let now = Instant::now();
                let mut buckets = self.buckets.lock();
                let bucket = buckets.entry(identity.to_owned()).or_insert(Bucket {
                    tokens: self.per_minute,
                    last_refill: now,
                });
                self.refill(bucket, now);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                // Seconds until one token refills.
                Duration::from_secs_f64((1.0 - bucket.tokens) * 60.0 / self.per_minute)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_capped_then_refills() {
        let buckets = TokenBuckets::new(60); // 1/sec refill
        for _ in 0..60 {
            assert!(buckets.try_take("peer"));
        }
        assert!(!buckets.try_take("peer"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(buckets.try_take("peer"));
        assert!(buckets.try_take("peer"));
        assert!(!buckets.try_take("peer"));
    }

    #[tokio::test(start_paused = true)]
    async fn identities_are_independent() {
        let buckets = TokenBuckets::new(1);
        assert!(buckets.try_take("a"));
        assert!(!buckets.try_take("a"));
        assert!(buckets.try_take("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn take_waits_for_refill() {
        let buckets = TokenBuckets::new(60);
        for _ in 0..60 {
            buckets.take("peer").await;
        }
        let start = Instant::now();
        buckets.take("peer").await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
