// In-process worker metrics with a Prometheus text export.
//
// Admission, scheduling, outcomes and cleanup are all counted here. Every
// metric is a plain atomic so recording never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::types::{FailureReason, RejectReason, Violation};

/// Monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that goes up and down; never below zero
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Bucket {
    /// Upper bound in seconds
    le: f64,
    count: AtomicU64,
}

/// Cumulative histogram of durations
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<Bucket>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn with_bounds(bounds: &[f64]) -> Self {
        Self {
            buckets: bounds
                .iter()
                .map(|&le| Bucket {
                    le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets from 1 ms to 10 min, covering queue waits and job run times.
    pub fn job_durations() -> Self {
        Self::with_bounds(&[
            0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0,
        ])
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum_micros
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in self.buckets.iter().filter(|b| seconds <= b.le) {
            bucket.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 1e-9)
            .map_or(0, |b| b.count.load(Ordering::Relaxed))
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        out.push_str(&format!("# HELP {} {}\n# TYPE {} histogram\n", name, help, name));
        for bucket in &self.buckets {
            out.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                name,
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, self.count()));
        out.push_str(&format!("{}_sum {}\n", name, self.sum_seconds()));
        out.push_str(&format!("{}_count {}\n", name, self.count()));
    }
}

/// How a job record left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    Download,
    Ttl,
    MemoryPressure,
    Shutdown,
}

const REJECT_LABELS: [&str; 5] = [
    "banned",
    "request_rate",
    "concurrency_limit",
    "hourly_job_limit",
    "cpu_quota_exhausted",
];

const FAILURE_LABELS: [&str; 11] = [
    "wall_timeout",
    "cpu_timeout",
    "memory_limit",
    "blocked_syscall",
    "file_size_limit",
    "non_zero_exit",
    "signaled",
    "setup_failure",
    "internal",
    "cancelled",
    "expired",
];

const EVICTION_LABELS: [&str; 4] = ["download", "ttl", "memory_pressure", "shutdown"];

fn reject_index(reason: &RejectReason) -> usize {
    match reason {
        RejectReason::Banned { .. } => 0,
        RejectReason::RequestRate => 1,
        RejectReason::ConcurrencyLimit { .. } => 2,
        RejectReason::HourlyJobLimit { .. } => 3,
        RejectReason::CpuQuotaExhausted { .. } => 4,
    }
}

fn failure_index(reason: &FailureReason) -> usize {
    match reason {
        FailureReason::Violation(Violation::WallTimeout) => 0,
        FailureReason::Violation(Violation::CpuTimeout) => 1,
        FailureReason::Violation(Violation::MemoryLimit) => 2,
        FailureReason::Violation(Violation::BlockedSyscall) => 3,
        FailureReason::Violation(Violation::FileSizeLimit) => 4,
        FailureReason::NonZeroExit(_) => 5,
        FailureReason::Signaled(_) => 6,
        FailureReason::SetupFailure(_) => 7,
        FailureReason::Internal(_) => 8,
        FailureReason::Cancelled => 9,
        FailureReason::Expired => 10,
    }
}

fn eviction_index(cause: EvictionCause) -> usize {
    match cause {
        EvictionCause::Download => 0,
        EvictionCause::Ttl => 1,
        EvictionCause::MemoryPressure => 2,
        EvictionCause::Shutdown => 3,
    }
}

/// Worker-wide metric set
#[derive(Debug)]
pub struct MetricsRegistry {
    pub submissions: Counter,
    rejections: [Counter; 5],
    pub jobs_completed: Counter,
    failures: [Counter; 11],
    evictions: [Counter; 4],
    pub orphans_swept: Counter,
    pub queued_jobs: Gauge,
    pub running_jobs: Gauge,
    pub queue_wait: Histogram,
    pub run_time: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            submissions: Counter::new(),
            rejections: Default::default(),
            jobs_completed: Counter::new(),
            failures: Default::default(),
            evictions: Default::default(),
            orphans_swept: Counter::new(),
            queued_jobs: Gauge::new(),
            running_jobs: Gauge::new(),
            queue_wait: Histogram::job_durations(),
            run_time: Histogram::job_durations(),
        }
    }

    pub fn record_rejection(&self, reason: &RejectReason) {
        self.rejections[reject_index(reason)].inc();
    }

    pub fn rejections(&self, reason: &RejectReason) -> u64 {
        self.rejections[reject_index(reason)].get()
    }

    pub fn record_failure(&self, reason: &FailureReason) {
        self.failures[failure_index(reason)].inc();
    }

    pub fn failures(&self, reason: &FailureReason) -> u64 {
        self.failures[failure_index(reason)].get()
    }

    pub fn record_eviction(&self, cause: EvictionCause) {
        self.evictions[eviction_index(cause)].inc();
    }

    pub fn evictions(&self, cause: EvictionCause) -> u64 {
        self.evictions[eviction_index(cause)].get()
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let mut scalar = |name: &str, kind: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"
            ));
        };
        scalar("sandrun_submissions_total", "counter", "Admitted submissions", self.submissions.get());
        scalar("sandrun_jobs_completed_total", "counter", "Jobs that completed cleanly", self.jobs_completed.get());
        scalar("sandrun_orphans_swept_total", "counter", "Leftover resources removed at startup", self.orphans_swept.get());
        scalar("sandrun_queued_jobs", "gauge", "Jobs waiting for a slot", self.queued_jobs.get());
        scalar("sandrun_running_jobs", "gauge", "Jobs currently running", self.running_jobs.get());

        let mut labelled = |name: &str, help: &str, label: &str, names: &[&str], counters: &[Counter]| {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n"));
            for (value, counter) in names.iter().zip(counters) {
                out.push_str(&format!("{name}{{{label}=\"{value}\"}} {}\n", counter.get()));
            }
        };
        labelled("sandrun_rejections_total", "Admission rejections", "reason", &REJECT_LABELS, &self.rejections);
        labelled("sandrun_jobs_failed_total", "Failed jobs", "reason", &FAILURE_LABELS, &self.failures);
        labelled("sandrun_evictions_total", "Job records removed", "cause", &EVICTION_LABELS, &self.evictions);

        self.queue_wait
            .render("sandrun_queue_wait_seconds", "Time from admission to start", &mut out);
        self.run_time
            .render("sandrun_run_time_seconds", "Wall time of executions", &mut out);
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_does_not_wrap() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::job_durations();
        h.observe(Duration::from_millis(40));
        h.observe(Duration::from_millis(400));
        h.observe(Duration::from_secs(20));

        assert_eq!(h.count(), 3);
        assert_eq!(h.bucket_count(0.05), 1);
        assert_eq!(h.bucket_count(0.5), 2);
        assert_eq!(h.bucket_count(30.0), 3);
        assert!((h.sum_seconds() - 20.44).abs() < 1e-6);
    }

    #[test]
    fn labelled_counters_are_independent() {
        let m = MetricsRegistry::new();
        m.record_rejection(&RejectReason::RequestRate);
        m.record_rejection(&RejectReason::ConcurrencyLimit { active: 2, max: 2 });
        m.record_rejection(&RejectReason::ConcurrencyLimit { active: 3, max: 2 });
        m.record_failure(&FailureReason::Violation(Violation::MemoryLimit));
        m.record_eviction(EvictionCause::Ttl);

        assert_eq!(m.rejections(&RejectReason::RequestRate), 1);
        assert_eq!(m.rejections(&RejectReason::ConcurrencyLimit { active: 0, max: 0 }), 2);
        assert_eq!(m.failures(&FailureReason::Violation(Violation::MemoryLimit)), 1);
        assert_eq!(m.failures(&FailureReason::Cancelled), 0);
        assert_eq!(m.evictions(EvictionCause::Ttl), 1);
    }

    #[test]
    fn prometheus_text_has_every_family() {
        let m = MetricsRegistry::new();
        m.submissions.add(3);
        m.record_failure(&FailureReason::NonZeroExit(1));
        m.run_time.observe(Duration::from_secs(2));

        let text = m.render_prometheus();
        assert!(text.contains("sandrun_submissions_total 3"));
        assert!(text.contains("sandrun_jobs_failed_total{reason=\"non_zero_exit\"} 1"));
        assert!(text.contains("sandrun_rejections_total{reason=\"cpu_quota_exhausted\"} 0"));
        assert!(text.contains("sandrun_run_time_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("# TYPE sandrun_running_jobs gauge"));
    }

    #[test]
    fn global_registry_is_shared() {
        assert!(Arc::ptr_eq(&get_metrics(), &get_metrics()));
    }
}
