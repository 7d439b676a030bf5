use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Counts events in a trailing window.
///
/// Expired timestamps are evicted from the front on each call, so the cost
/// of eviction is spread over normal traffic.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: usize,
    events: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            events: VecDeque::with_capacity(max_requests.min(1024)),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&front) = self.events.front() {
            if now.saturating_duration_since(front) >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn allow_request(&mut self) -> bool {
        self.allow_request_at(Instant::now())
    }

    /// Record the request and return true if fewer than `max_requests`
    /// fall inside the window ending at `now`.
    pub fn allow_request_at(&mut self, now: Instant) -> bool {
        self.evict(now);
        if self.events.len() < self.max_requests {
            self.events.push_back(now);
            true
        } else {
            false
        }
    }

    /// Check without recording.
    pub fn would_allow_at(&mut self, now: Instant) -> bool {
        self.evict(now);
        self.events.len() < self.max_requests
    }

    pub fn current_count_at(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.events.len()
    }

    /// Zero when a slot is free, otherwise the time until the oldest entry
    /// leaves the window.
    pub fn time_to_next_slot_at(&mut self, now: Instant) -> Duration {
        self.evict(now);
        if self.events.len() < self.max_requests {
            return Duration::ZERO;
        }
        match self.events.front() {
            Some(&oldest) => (oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn is_idle_at(&mut self, now: Instant) -> bool {
        self.current_count_at(now) == 0
    }
}

/// Sum of weighted samples in a trailing window.
///
/// Used for CPU-seconds: each finished job adds its CPU time, and the
/// amount ages out `window` after it was recorded.
#[derive(Debug, Clone)]
pub struct UsageWindow {
    window: Duration,
    samples: VecDeque<(Instant, f64)>,
    total: f64,
}

impl UsageWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total: 0.0,
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, amount)) = self.samples.front() {
            if now.saturating_duration_since(at) >= self.window {
                self.samples.pop_front();
                self.total -= amount;
            } else {
                break;
            }
        }
        if self.samples.is_empty() || self.total < 0.0 {
            self.total = self.samples.iter().map(|(_, a)| a).sum();
        }
    }

    pub fn record_at(&mut self, amount: f64, now: Instant) {
        if amount <= 0.0 || !amount.is_finite() {
            return;
        }
        self.evict(now);
        self.samples.push_back((now, amount));
        self.total += amount;
    }

    pub fn total_at(&mut self, now: Instant) -> f64 {
        self.evict(now);
        self.total
    }

    /// When the window next shrinks, i.e. the oldest sample expires.
    pub fn reset_at(&mut self, now: Instant) -> Option<Instant> {
        self.evict(now);
        self.samples.front().map(|&(at, _)| at + self.window)
    }

    /// Time until the total drops strictly below `limit`.
    pub fn time_until_below_at(&mut self, limit: f64, now: Instant) -> Duration {
        self.evict(now);
        let mut remaining = self.total;
        for &(at, amount) in &self.samples {
            if remaining < limit {
                break;
            }
            remaining -= amount;
            if remaining < limit {
                return (at + self.window).saturating_duration_since(now);
            }
        }
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_then_blocks() {
        let t0 = Instant::now();
        let mut limiter = SlidingWindowLimiter::new(Duration::from_secs(10), 3);
        for i in 0..3 {
            assert!(limiter.allow_request_at(t0 + Duration::from_secs(i)));
        }
        assert!(!limiter.allow_request_at(t0 + Duration::from_secs(5)));
        assert_eq!(limiter.current_count_at(t0 + Duration::from_secs(5)), 3);
    }

    #[test]
    fn oldest_entry_expires_first() {
        let t0 = Instant::now();
        let mut limiter = SlidingWindowLimiter::new(Duration::from_secs(10), 2);
        assert!(limiter.allow_request_at(t0));
        assert!(limiter.allow_request_at(t0 + Duration::from_secs(4)));

        let now = t0 + Duration::from_secs(6);
        assert_eq!(limiter.time_to_next_slot_at(now), Duration::from_secs(4));
        assert!(!limiter.allow_request_at(now));
        assert!(limiter.allow_request_at(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn rejected_requests_are_not_recorded() {
        let t0 = Instant::now();
        let mut limiter = SlidingWindowLimiter::new(Duration::from_secs(1), 1);
        assert!(limiter.allow_request_at(t0));
        for ms in 1..10 {
            assert!(!limiter.allow_request_at(t0 + Duration::from_millis(ms * 10)));
        }
        assert!(limiter.allow_request_at(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn usage_window_ages_out_samples() {
        let t0 = Instant::now();
        let mut usage = UsageWindow::new(Duration::from_secs(60));
        usage.record_at(4.0, t0);
        usage.record_at(5.0, t0 + Duration::from_secs(30));
        assert_eq!(usage.total_at(t0 + Duration::from_secs(59)), 9.0);
        assert_eq!(usage.total_at(t0 + Duration::from_secs(60)), 5.0);
        assert_eq!(usage.total_at(t0 + Duration::from_secs(90)), 0.0);
    }

    #[test]
    fn usage_window_time_until_below() {
        let t0 = Instant::now();
        let mut usage = UsageWindow::new(Duration::from_secs(60));
        usage.record_at(6.0, t0);
        usage.record_at(6.0, t0 + Duration::from_secs(20));
        let now = t0 + Duration::from_secs(30);

        assert_eq!(usage.time_until_below_at(10.0, now), Duration::from_secs(30));
        assert_eq!(usage.time_until_below_at(5.0, now), Duration::from_secs(50));
        assert_eq!(usage.time_until_below_at(20.0, now), Duration::ZERO);
        assert_eq!(usage.reset_at(now), Some(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn usage_window_ignores_non_positive_samples() {
        let t0 = Instant::now();
        let mut usage = UsageWindow::new(Duration::from_secs(60));
        usage.record_at(0.0, t0);
        usage.record_at(-1.0, t0);
        usage.record_at(f64::NAN, t0);
        assert_eq!(usage.total_at(t0), 0.0);
        assert_eq!(usage.reset_at(t0), None);
    }
}
