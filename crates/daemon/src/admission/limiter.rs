//! Per-client rate limiting.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bucket::TokenBucket;

/// Token bucket rate limiter keyed by client identity.
///
/// Buckets are created lazily, full. The map is sharded so different clients
/// rarely contend, and each bucket has its own lock so requests from one
/// client serialize.
pub struct RateLimiter {
    buckets: DashMap<String, Mutex<TokenBucket>>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    /// Creates a limiter refilling `rate` tokens per second up to `burst`.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            rate,
            burst: f64::from(burst),
        }
    }

    /// Decides whether `identity` may open a session now.
    pub fn allow(&self, identity: &str) -> bool {
        self.allow_at(identity, Instant::now())
    }

    /// Decides whether `identity` may open a session at `now`.
    pub fn allow_at(&self, identity: &str, now: Instant) -> bool {
        // The map guard stays alive while the bucket is locked so eviction
        // cannot remove a bucket that is being spent from.
        if let Some(bucket) = self.buckets.get(identity) {
            let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            return bucket.try_acquire_at(now);
        }

        let entry = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(self.burst, self.rate, now)));
        let mut bucket = entry.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.try_acquire_at(now)
    }

    /// Number of clients with a bucket.
    pub fn client_count(&self) -> usize {
        self.buckets.len()
    }

    /// Forgets buckets idle for at least `max_idle` that have fully refilled.
    ///
    /// Returns how many were removed.
    pub fn evict_idle(&self, max_idle: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            !(bucket.idle_for(now) >= max_idle && bucket.is_full_at(now))
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Runs [`RateLimiter::evict_idle`] every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        max_idle: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Rate limiter sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = self.evict_idle(max_idle, Instant::now());
                        if evicted > 0 {
                            tracing::debug!(
                                evicted,
                                remaining = self.client_count(),
                                "Evicted idle rate limit buckets"
                            );
                        }
                    }
                }
            }
        })
    }
}
