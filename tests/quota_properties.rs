//! Property tests for the rate primitives and the quota table.

use proptest::prelude::*;
use sandrun::config::settings::QuotaConfig;
use sandrun::quota::{QuotaEngine, SlidingWindowLimiter, TokenBucket, UsageWindow};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const EPS: f64 = 1e-6;

proptest! {
    #[test]
    fn bucket_never_grants_more_than_capacity_plus_refill(
        capacity in 1u32..50,
        refill in 0.0f64..20.0,
        ops in prop::collection::vec((0u64..2_000, 0.0f64..5.0), 1..200),
    ) {
        let start = Instant::now();
        let mut bucket = TokenBucket::starting_at(capacity as f64, refill, start);
        let mut now = start;
        let mut granted = 0.0;
        for (advance_ms, n) in ops {
            now += Duration::from_millis(advance_ms);
            if bucket.try_consume_at(n, now) {
                granted += n;
            }
            let available = bucket.available_at(now);
            prop_assert!(available >= -EPS);
            prop_assert!(available <= capacity as f64 + EPS);
        }
        let elapsed = now.duration_since(start).as_secs_f64();
        prop_assert!(granted <= capacity as f64 + refill * elapsed + EPS);
    }

    #[test]
    fn bucket_wait_hint_is_sufficient(
        capacity in 1u32..20,
        refill in 0.1f64..10.0,
        drain in 0u32..20,
        want in 0.0f64..20.0,
    ) {
        let start = Instant::now();
        let mut bucket = TokenBucket::starting_at(capacity as f64, refill, start);
        for _ in 0..drain {
            bucket.try_consume_at(1.0, start);
        }
        match bucket.time_until_available_at(want, start) {
            Some(wait) => {
                let later = start + wait + Duration::from_millis(1);
                prop_assert!(bucket.try_consume_at(want, later));
            }
            None => prop_assert!(want > capacity as f64),
        }
    }

    #[test]
    fn sliding_window_admits_at_most_max_per_window(
        max in 1usize..10,
        window_ms in 10u64..1_000,
        gaps in prop::collection::vec(0u64..200, 1..300),
    ) {
        let start = Instant::now();
        let window = Duration::from_millis(window_ms);
        let mut limiter = SlidingWindowLimiter::new(window, max);
        let mut now = start;
        let mut admitted: Vec<Instant> = Vec::new();
        for gap in gaps {
            now += Duration::from_millis(gap);
            if limiter.allow_request_at(now) {
                admitted.push(now);
            }
            let in_window = admitted
                .iter()
                .filter(|&&t| now.duration_since(t) < window)
                .count();
            prop_assert!(in_window <= max);
            prop_assert_eq!(limiter.current_count_at(now), in_window);
        }
    }

    #[test]
    fn usage_window_total_matches_live_samples(
        window_ms in 10u64..1_000,
        samples in prop::collection::vec((0u64..300, 0.0f64..10.0), 1..100),
    ) {
        let start = Instant::now();
        let window = Duration::from_millis(window_ms);
        let mut usage = UsageWindow::new(window);
        let mut now = start;
        let mut recorded: Vec<(Instant, f64)> = Vec::new();
        for (gap, amount) in samples {
            now += Duration::from_millis(gap);
            usage.record_at(amount, now);
            if amount > 0.0 {
                recorded.push((now, amount));
            }
            let expected: f64 = recorded
                .iter()
                .filter(|(t, _)| now.duration_since(*t) < window)
                .map(|(_, a)| a)
                .sum();
            prop_assert!((usage.total_at(now) - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn running_jobs_never_exceed_the_concurrency_ceiling(
        max in 1u32..4,
        ops in prop::collection::vec((0u8..3, 0usize..6), 1..120),
    ) {
        let engine = QuotaEngine::new(QuotaConfig {
            max_concurrent_jobs: max,
            max_jobs_per_hour: 10_000,
            request_burst: 10_000,
            request_refill_per_sec: 10_000.0,
            cpu_seconds_per_window: 1e9,
            ..QuotaConfig::default()
        });
        let client = "10.0.0.1";
        let mut charged = 0.0;
        for (op, job) in ops {
            let job_id = format!("job-{job}");
            match op {
                0 => {
                    let _ = engine.check_admission(client, &job_id);
                }
                1 => {
                    let _ = engine.mark_job_started(client, &job_id, 1.0);
                }
                _ => {
                    if engine.mark_job_completed(client, &job_id, 0.5) {
                        charged += 0.5;
                    }
                }
            }
            prop_assert!(engine.active_jobs(client) <= max as usize);
        }
        if let Some(usage) = engine.usage(client) {
            prop_assert!((usage.total_cpu_seconds - charged).abs() < EPS);
        }
    }

    #[test]
    fn concurrent_completions_stay_within_the_cpu_window(
        max in 1u32..=4,
        ops in prop::collection::vec((0u8..3, 0usize..6, 0.0f64..30.0, 0u64..5_000), 1..200),
    ) {
        let engine = QuotaEngine::new(QuotaConfig {
            max_concurrent_jobs: max,
            max_jobs_per_hour: 10_000,
            request_burst: 10_000,
            request_refill_per_sec: 10_000.0,
            ..QuotaConfig::default()
        });
        let limit = engine.config().cpu_seconds_per_window;
        let client = "10.0.0.2";
        let start = Instant::now();
        let mut now = start;
        let mut grants: HashMap<String, f64> = HashMap::new();
        let mut max_grant: f64 = 0.0;
        for (op, job, requested, advance_ms) in ops {
            now += Duration::from_millis(advance_ms);
            let job_id = format!("job-{job}");
            match op {
                0 => {
                    let _ = engine.check_admission_at(client, &job_id, now);
                }
                1 => {
                    if let Ok(grant) = engine.mark_job_started_at(client, &job_id, requested, now) {
                        prop_assert!(grant <= requested + EPS);
                        max_grant = max_grant.max(grant);
                        grants.insert(job_id, grant);
                    }
                }
                _ => {
                    // Each job burns exactly what it was granted.
                    let grant = grants.get(&job_id).copied().unwrap_or(0.0);
                    if engine.mark_job_completed_at(client, &job_id, grant, now) {
                        grants.remove(&job_id);
                    }
                }
            }
            if let Some(usage) = engine.usage_at(client, now) {
                prop_assert!(usage.cpu_seconds_used <= limit + max_grant + EPS);
                prop_assert!(
                    usage.cpu_seconds_used + usage.cpu_seconds_reserved <= limit + max_grant + EPS
                );
                prop_assert!(usage.running_jobs <= max as usize);
            }
        }
    }
}
