//! Per-principal token bucket rate limiting.
//!
//! Shared in-process state guarded by fine-grained locks, following the
//! teacher's `RwLock<HashMap<..>>` pattern in `auth.rs` for its token table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::RegistryError;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub rate_per_sec: f64,
    pub burst: f64,
    pub publish_cost: f64,
    pub read_cost: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<String, Bucket>>,
}

#[derive(Debug, Clone, Copy)]
pub enum Operation {
    Read,
    Publish,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter { config, buckets: RwLock::new(HashMap::new()) }
    }

    /// Check and consume tokens for `key` (a principal key or source
    /// address). Returns `rate-limited` with the fields the HTTP surface
    /// needs to report back to the client.
    pub fn check(&self, key: &str, op: Operation) -> Result<(), RegistryError> {
        let cost = match op {
            Operation::Read => self.config.read_cost,
            Operation::Publish => self.config.publish_cost,
        };

        let mut buckets = self.buckets.write();
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket { tokens: self.config.burst, last_refill: now });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.rate_per_sec).min(self.config.burst);
        bucket.last_refill = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Ok(())
        } else {
            let remaining = bucket.tokens.floor().max(0.0) as u32;
            let deficit = cost - bucket.tokens;
            let wait = Duration::from_secs_f64(deficit / self.config.rate_per_sec);
            let reset_epoch_seconds = chrono::Utc::now().timestamp() + wait.as_secs() as i64;
            Err(RegistryError::RateLimited {
                limit: self.config.burst as u32,
                remaining,
                reset_epoch_seconds,
            })
        }
    }
}
