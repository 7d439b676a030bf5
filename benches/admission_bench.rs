// Admission latency benchmark.
// Measures check_admission + release_admission on the quota table, single
// threaded and under contention from several submitting threads.
// Target: p99 < 50us uncontended.

use sandrun::config::settings::QuotaConfig;
use sandrun::quota::QuotaEngine;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 20_000;
const WARMUP_ITERATIONS: usize = 1_000;
const THREADS: usize = 8;
const CLIENTS: usize = 256;

struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();
        let at = |q: f64| samples[((len as f64 * q) as usize).min(len - 1)];
        let sum: Duration = samples.iter().sum();
        Self {
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
            max: samples[len - 1],
            mean: sum / len as u32,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

fn engine() -> QuotaEngine {
    QuotaEngine::new(QuotaConfig {
        max_jobs_per_hour: u32::MAX,
        request_burst: u32::MAX,
        request_refill_per_sec: 1e9,
        ..QuotaConfig::default()
    })
}

fn admit_once(engine: &QuotaEngine, client: &str, seq: usize) -> Duration {
    let job_id = format!("job-{}", seq);
    let start = Instant::now();
    let admitted = engine.check_admission(client, &job_id).is_ok();
    if admitted {
        engine.release_admission(client, &job_id);
    }
    start.elapsed()
}

fn bench_uncontended() -> LatencyStats {
    let engine = engine();
    let clients: Vec<String> = (0..CLIENTS).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();
    for i in 0..WARMUP_ITERATIONS {
        admit_once(&engine, &clients[i % CLIENTS], i);
    }
    let samples = (0..ITERATIONS)
        .map(|i| admit_once(&engine, &clients[i % CLIENTS], i))
        .collect();
    LatencyStats::from_samples(samples)
}

fn bench_contended() -> LatencyStats {
    let engine = Arc::new(engine());
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let client = format!("192.168.{}.1", t);
                (0..ITERATIONS / THREADS)
                    .map(|i| admit_once(&engine, &client, i))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let samples = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap_or_default())
        .collect();
    LatencyStats::from_samples(samples)
}

fn main() {
    println!("admission benchmark: {} iterations", ITERATIONS);

    let single = bench_uncontended();
    single.print(&format!("uncontended ({} clients)", CLIENTS));

    let contended = bench_contended();
    contended.print(&format!("contended ({} threads)", THREADS));

    if single.p99 > Duration::from_micros(50) {
        println!("\nWARN: uncontended p99 {:?} above 50us target", single.p99);
    }
}
