//! Token bucket rate limiter for run admission.
//!
//! Refill is lazy: tokens are topped up from elapsed time on every
//! [`TokenBucket::acquire`] call, there is no background timer.

use std::time::{Duration, Instant};

/// Local admission throttle, independent of resource state.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: u32,
    /// Tokens added per elapsed `refill_interval`.
    refill_rate: u32,
    refill_interval: Duration,
    last_refill: Instant,
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(4, 1, Duration::from_secs(60))
    }
}

impl TokenBucket {
    /// Create a full bucket.
    #[must_use]
    pub fn new(capacity: u32, refill_rate: u32, refill_interval: Duration) -> Self {
        Self::new_at(capacity, refill_rate, refill_interval, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    #[must_use]
    pub fn new_at(
        capacity: u32,
        refill_rate: u32,
        refill_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            // A zero interval would divide by zero below.
            refill_interval: refill_interval.max(Duration::from_millis(1)),
            last_refill: now,
        }
    }

    /// Try to take `cost` tokens. Returns `false` and leaves the bucket
    /// untouched if not enough tokens are available.
    pub fn acquire(&mut self, cost: u32) -> bool {
        self.acquire_at(cost, Instant::now())
    }

    /// Same as [`acquire`](Self::acquire) with an explicit clock reading.
    pub fn acquire_at(&mut self, cost: u32, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after refilling up to `now`.
    pub fn available_at(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos();
        if intervals == 0 {
            return;
        }

        let added = intervals.saturating_mul(u128::from(self.refill_rate));
        let topped = (u128::from(self.tokens) + added).min(u128::from(self.capacity));
        self.tokens = u32::try_from(topped).unwrap_or(self.capacity);

        if self.tokens == self.capacity {
            self.last_refill = now;
        } else {
            // Keep the partial interval so frequent polling still refills.
            // `intervals * refill_interval` is at most `elapsed`, so it fits.
            let consumed = self.refill_interval.as_nanos() * intervals;
            self.last_refill += Duration::from_nanos(u64::try_from(consumed).unwrap_or(u64::MAX));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_zero_cost_always_succeeds() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(2, 1, MINUTE, t0);
        assert!(bucket.acquire_at(2, t0));
        assert_eq!(bucket.available_at(t0), 0);
        assert!(bucket.acquire_at(0, t0));
        assert!(bucket.acquire_at(0, t0));
    }

    #[test]
    fn test_acquisitions_within_capacity_succeed() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(4, 1, MINUTE, t0);
        assert!(bucket.acquire_at(1, t0));
        assert!(bucket.acquire_at(2, t0));
        assert!(bucket.acquire_at(1, t0));
        assert!(!bucket.acquire_at(1, t0));
    }

    #[test]
    fn test_rejected_acquire_leaves_tokens_unchanged() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(4, 1, MINUTE, t0);
        assert!(bucket.acquire_at(3, t0));
        assert!(!bucket.acquire_at(2, t0));
        assert_eq!(bucket.available_at(t0), 1);
        assert!(bucket.acquire_at(1, t0));
    }

    #[test]
    fn test_refill_after_interval() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(4, 1, MINUTE, t0);
        assert!(bucket.acquire_at(4, t0));
        assert!(!bucket.acquire_at(1, t0 + Duration::from_secs(59)));
        assert!(bucket.acquire_at(1, t0 + MINUTE));
    }

    #[test]
    fn test_refill_clamped_to_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(4, 2, MINUTE, t0);
        assert!(bucket.acquire_at(1, t0));
        assert_eq!(bucket.available_at(t0 + MINUTE * 100), 4);
        assert!(!bucket.acquire_at(5, t0 + MINUTE * 200));
        assert_eq!(bucket.available_at(t0 + MINUTE * 300), 4);
    }

    #[test]
    fn test_frequent_polling_keeps_partial_progress() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(1, 1, MINUTE, t0);
        assert!(bucket.acquire_at(1, t0));

        // Polling every 20s must not reset the interval clock.
        assert!(!bucket.acquire_at(1, t0 + Duration::from_secs(20)));
        assert!(!bucket.acquire_at(1, t0 + Duration::from_secs(40)));
        assert!(bucket.acquire_at(1, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_refill_is_monotone() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(10, 1, Duration::from_secs(1), t0);
        assert!(bucket.acquire_at(10, t0));

        let mut last = 0;
        for secs in 0..20 {
            let now = bucket.available_at(t0 + Duration::from_secs(secs));
            assert!(now >= last);
            assert!(now <= 10);
            last = now;
        }
        assert_eq!(last, 10);
    }
}
