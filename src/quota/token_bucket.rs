use std::time::{Duration, Instant};

/// Token bucket with lazy refill.
///
/// No timer drives refill: every call first credits
/// `elapsed_seconds * refill_per_sec` tokens, capped at `capacity`.
/// The bucket is not internally synchronised; callers that share one hold
/// it behind the same lock that guards the rest of the client's state.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self::starting_at(capacity, refill_per_sec, Instant::now())
    }

    pub fn starting_at(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    fn refill(&mut self, now: Instant) {
        // Instants older than the last refill add nothing.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub fn try_consume(&mut self, n: f64) -> bool {
        self.try_consume_at(n, Instant::now())
    }

    /// Take `n` tokens if available. Never drives the balance negative.
    pub fn try_consume_at(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        if n < 0.0 || self.tokens < n {
            return false;
        }
        self.tokens -= n;
        true
    }

    pub fn available_at(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Time until `n` tokens will be available, or `None` if `n` exceeds
    /// capacity or the bucket never refills.
    pub fn time_until_available_at(&mut self, n: f64, now: Instant) -> Option<Duration> {
        self.refill(now);
        if n > self.capacity {
            return None;
        }
        let missing = n - self.tokens;
        if missing <= 0.0 {
            return Some(Duration::ZERO);
        }
        if self.refill_per_sec <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(missing / self.refill_per_sec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_drains() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::starting_at(3.0, 1.0, t0);
        assert!(bucket.try_consume_at(1.0, t0));
        assert!(bucket.try_consume_at(2.0, t0));
        assert!(!bucket.try_consume_at(1.0, t0));
        assert_eq!(bucket.available_at(t0), 0.0);
    }

    #[test]
    fn refill_is_lazy_and_capped() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::starting_at(5.0, 2.0, t0);
        assert!(bucket.try_consume_at(5.0, t0));
        assert!((bucket.available_at(t0 + Duration::from_millis(500)) - 1.0).abs() < 1e-9);
        assert_eq!(bucket.available_at(t0 + Duration::from_secs(60)), 5.0);
    }

    #[test]
    fn failed_consume_leaves_tokens_untouched() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::starting_at(4.0, 1.0, t0);
        assert!(bucket.try_consume_at(3.0, t0));
        assert!(!bucket.try_consume_at(2.0, t0));
        assert_eq!(bucket.available_at(t0), 1.0);
    }

    #[test]
    fn wait_hint_is_sufficient() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::starting_at(10.0, 0.5, t0);
        assert!(bucket.try_consume_at(10.0, t0));

        let wait = bucket.time_until_available_at(3.0, t0).unwrap();
        assert_eq!(wait, Duration::from_secs(6));
        let mut early = bucket.clone();
        assert!(!early.try_consume_at(3.0, t0 + wait - Duration::from_millis(10)));
        assert!(bucket.try_consume_at(3.0, t0 + wait));
    }

    #[test]
    fn requests_above_capacity_never_succeed() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::starting_at(2.0, 1.0, t0);
        assert_eq!(bucket.time_until_available_at(3.0, t0), None);
        assert!(!bucket.try_consume_at(3.0, t0 + Duration::from_secs(3600)));
    }

    #[test]
    fn clock_going_backwards_adds_nothing() {
        let t0 = Instant::now() + Duration::from_secs(10);
        let mut bucket = TokenBucket::starting_at(2.0, 1.0, t0);
        assert!(bucket.try_consume_at(2.0, t0));
        assert_eq!(bucket.available_at(t0 - Duration::from_secs(5)), 0.0);
    }
}
