//! Token bucket arithmetic.

use std::time::{Duration, Instant};

/// A token bucket for one client.
///
/// Tokens refill continuously at `refill_rate` per second up to `capacity`.
/// Each admitted request spends one token.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: now,
        }
    }

    /// Tokens available at `now`, never more than the capacity.
    pub fn available_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    /// Spends one token if one is available at `now`.
    ///
    /// A rejected request leaves the bucket exactly as it was.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        let available = self.available_at(now);
        if available < 1.0 {
            return false;
        }

        self.tokens = available - 1.0;
        self.last_refill = now.max(self.last_refill);
        true
    }

    /// Time since the bucket last admitted a request.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_refill)
    }

    /// Whether the bucket has refilled completely by `now`.
    ///
    /// A full bucket behaves exactly like a freshly created one, so it can
    /// be forgotten without any client noticing.
    pub fn is_full_at(&self, now: Instant) -> bool {
        self.available_at(now) >= self.capacity
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bucket_is_full() {
        let now = Instant::now();
        let bucket = TokenBucket::new(20.0, 10.0, now);

        assert_eq!(bucket.available_at(now), 20.0);
        assert!(bucket.is_full_at(now));
    }

    #[test]
    fn test_burst_then_reject() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(20.0, 10.0, now);

        for i in 0..20 {
            assert!(bucket.try_acquire_at(now), "request {} should be admitted", i);
        }
        assert!(!bucket.try_acquire_at(now));
    }

    #[test]
    fn test_refill_after_one_interval() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 10.0, start);

        assert!(bucket.try_acquire_at(start));
        assert!(bucket.try_acquire_at(start));
        assert!(!bucket.try_acquire_at(start));

        // 1 / refill_rate seconds later one token is back
        let later = start + Duration::from_millis(100);
        assert!(bucket.try_acquire_at(later));
        assert!(!bucket.try_acquire_at(later));
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3.0, 10.0, start);

        assert!(bucket.try_acquire_at(start));
        let much_later = start + Duration::from_secs(3600);
        assert_eq!(bucket.available_at(much_later), 3.0);
    }

    #[test]
    fn test_rejection_does_not_mutate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1.0, 1.0, start);
        assert!(bucket.try_acquire_at(start));

        let before = bucket.clone();
        assert!(!bucket.try_acquire_at(start + Duration::from_millis(500)));

        assert_eq!(bucket.tokens, before.tokens);
        assert_eq!(bucket.last_refill, before.last_refill);
    }

    #[test]
    fn test_idle_and_full() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(20.0, 10.0, start);
        assert!(bucket.try_acquire_at(start));

        assert!(!bucket.is_full_at(start));
        let later = start + Duration::from_secs(1);
        assert!(bucket.is_full_at(later));
        assert_eq!(bucket.idle_for(later), Duration::from_secs(1));
    }

    #[test]
    fn test_clock_going_backwards_is_ignored() {
        let start = Instant::now() + Duration::from_secs(10);
        let mut bucket = TokenBucket::new(1.0, 1.0, start);

        assert!(bucket.try_acquire_at(start - Duration::from_secs(5)));
        assert!(!bucket.try_acquire_at(start));
    }
}
