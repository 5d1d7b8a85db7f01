//! Per-client token buckets.
//!
//! Each client identity owns a bucket holding up to `capacity` tokens that
//! refills continuously at `refill_per_sec`. An admission costs one token.
//! Buckets are created on first sight of a client. A bucket that has been
//! idle long enough to refill completely is indistinguishable from a new one,
//! so such buckets are swept once per full-refill period.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::RateLimitExceeded;

/// Token bucket state for one client.
#[derive(Debug, Clone, Copy)]
struct RateBucket {
    last_refill: Instant,
    tokens: f64,
}

#[derive(Debug, Default)]
struct Buckets {
    clients: HashMap<String, RateBucket>,
    last_sweep: Option<Instant>,
}

/// Token-bucket admission control keyed by client identity.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    /// Create a limiter refilling `refill_per_sec` tokens per second with
    /// bursts up to `capacity`. Both are raised to at least 1.
    pub fn new(refill_per_sec: f64, capacity: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(1.0),
            buckets: Mutex::new(Buckets::default()),
        }
    }

    /// Admit one request from `client` now.
    pub fn check(&self, client: &str) -> Result<(), RateLimitExceeded> {
        self.check_at(client, Instant::now())
    }

    /// Admit one request from `client` at the given instant.
    ///
    /// Refills the bucket for the time elapsed since its last check, then
    /// takes one token if available. A rejection leaves the bucket as refilled.
    pub fn check_at(&self, client: &str, now: Instant) -> Result<(), RateLimitExceeded> {
        let mut buckets = self.buckets.lock();
        self.sweep(&mut buckets, now);

        let capacity = self.capacity;
        let bucket = buckets
            .clients
            .entry(client.to_string())
            .or_insert_with(|| {
                tracing::debug!(client = client, "Creating rate limit bucket");
                RateBucket {
                    last_refill: now,
                    tokens: capacity,
                }
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.last_refill = bucket.last_refill.max(now);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(RateLimitExceeded {
                retry_after: Duration::from_secs_f64(missing / self.refill_per_sec),
            })
        }
    }

    /// Drop buckets that would be full by `now`, at most once per
    /// full-refill period.
    fn sweep(&self, buckets: &mut Buckets, now: Instant) {
        let period = Duration::from_secs_f64((self.capacity / self.refill_per_sec).max(1.0));
        let last = *buckets.last_sweep.get_or_insert(now);
        if now.saturating_duration_since(last) < period {
            return;
        }
        buckets.last_sweep = Some(now);

        let before = buckets.clients.len();
        let (capacity, rate) = (self.capacity, self.refill_per_sec);
        buckets.clients.retain(|_, b| {
            let idle = now.saturating_duration_since(b.last_refill).as_secs_f64();
            b.tokens + idle * rate < capacity
        });
        let evicted = before - buckets.clients.len();
        if evicted > 0 {
            tracing::debug!(evicted = evicted, remaining = buckets.clients.len(), "Swept idle rate buckets");
        }
    }

    /// Number of client identities holding a bucket.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().clients.len()
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }
}
