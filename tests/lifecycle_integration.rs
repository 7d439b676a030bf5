//! Lifecycle tests against an in-memory engine.
//!
//! The fake engine interprets the job's `MODE` env var instead of launching
//! anything, so these run unprivileged and fast.

use sandrun::core::engine::{Execution, ExecutionContext, SandboxEngine};
use sandrun::core::CancelToken;
use sandrun::observability::EvictionCause;
use sandrun::safety::JobWorkspace;
use sandrun::{
    ExecutionResult, FailureReason, Interpreter, JobConfig, JobError, JobId, JobState,
    RejectReason, ResourceLimits, SandboxError, SubmitError, Violation, WorkerConfig,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

struct FakeEngine {
    jobs_root: PathBuf,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeEngine {
    fn new(jobs_root: &Path) -> Arc<Self> {
        Arc::new(Self {
            jobs_root: jobs_root.to_path_buf(),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl SandboxEngine for FakeEngine {
    fn preflight(&self, config: &JobConfig) -> sandrun::Result<()> {
        if config.env.get("MODE").map(String::as_str) == Some("preflight") {
            return Err(SandboxError::Gpu("no such device".into()));
        }
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext<'_>, cancel: &CancelToken) -> sandrun::Result<Execution> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let out = self.run(ctx, cancel);
        self.running.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

impl FakeEngine {
    fn run(&self, ctx: &ExecutionContext<'_>, cancel: &CancelToken) -> sandrun::Result<Execution> {
        let mode = ctx.config.env.get("MODE").cloned().unwrap_or_default();
        let cpu: f64 = ctx
            .config
            .env
            .get("CPU")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.1);
        let started = Instant::now();

        if mode == "setup" {
            return Err(SandboxError::Mount("pivot_root failed".into()));
        }
        if mode == "panic" {
            panic!("engine bug");
        }

        let workspace = JobWorkspace::plain(&self.jobs_root, ctx.job_id)?;
        workspace.stage_inputs(&ctx.config.inputs)?;
        std::fs::write(workspace.path().join("out.txt"), b"result")?;

        let mut result = ExecutionResult {
            exit_code: Some(0),
            stdout: "hello\n".into(),
            cpu_seconds: cpu,
            memory_peak: 4096,
            ..Default::default()
        };
        match mode.as_str() {
            "fail" => {
                result.exit_code = Some(3);
                result.stderr = "boom\n".into();
            }
            m if m.starts_with("sleep:") => {
                let ms: u64 = m["sleep:".len()..].parse().unwrap_or(0);
                let until = started + Duration::from_millis(ms);
                while Instant::now() < until && !cancel.is_cancelled() {
                    if Instant::now() >= ctx.deadline {
                        result.exit_code = None;
                        result.signal = Some(9);
                        result.timeout_occurred = true;
                        result.violation = Some(Violation::WallTimeout);
                        break;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                if cancel.is_cancelled() {
                    result.exit_code = None;
                    result.signal = Some(9);
                }
            }
            _ => {}
        }
        result.execution_time = started.elapsed();
        result.output_files = workspace.collect_outputs(&ctx.config.outputs)?;
        Ok(Execution {
            result,
            workspace: Some(workspace),
        })
    }
}

struct Harness {
    _base: tempfile::TempDir,
    jobs_root: PathBuf,
    config: WorkerConfig,
}

impl Harness {
    fn new() -> Self {
        let base = tempfile::tempdir().unwrap();
        let mut config = WorkerConfig::default();
        config.sandbox.cgroup_root = base.path().join("cgroup");
        config.sandbox.jobs_root = base.path().join("jobs");
        config.sandbox.runtime_root = base.path().join("roots");
        config.sandbox.strict_mode = false;
        config.quota.request_burst = 100;
        config.quota.request_refill_per_sec = 100.0;
        config.quota.max_jobs_per_hour = 1000;
        config.lifecycle.sweep_interval_ms = 60_000;
        Self {
            jobs_root: base.path().join("jobs"),
            _base: base,
            config,
        }
    }

    fn start(&self) -> (sandrun::Coordinator, Arc<FakeEngine>) {
        let engine = FakeEngine::new(&self.jobs_root);
        let coordinator = sandrun::Coordinator::start(self.config.clone(), engine.clone()).unwrap();
        (coordinator, engine)
    }
}

fn job(mode: &str) -> JobConfig {
    let mut config = JobConfig::new(Interpreter::Python3, "main.py").with_input("main.py", "print('hello')");
    config.env.insert("MODE".into(), mode.into());
    config
}

#[test]
fn successful_job_walks_the_state_machine() {
    let h = Harness::new();
    let (coord, _) = h.start();

    let id = coord.submit(job("ok"), "10.0.0.1").unwrap();
    let snap = coord.wait_for(&id, WAIT).unwrap();

    assert_eq!(snap.state, JobState::Completed);
    assert_eq!(snap.history, vec![JobState::Queued, JobState::Running, JobState::Completed]);
    assert_eq!(snap.exit_code, Some(0));
    assert!(snap.failure.is_none());
    assert_eq!(snap.job_hash.len(), 64);
    assert!(snap.started_at.is_some() && snap.finished_at.is_some());

    let logs = coord.logs(&id).unwrap();
    assert_eq!(logs.stdout, "hello\n");

    let outputs = coord.outputs(&id).unwrap();
    let names: Vec<_> = outputs.iter().map(|o| o.path.as_str()).collect();
    assert_eq!(names, vec!["main.py", "out.txt"]);
    let path = coord.output_path(&id, "out.txt").unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"result");
    assert!(matches!(
        coord.output_path(&id, "../escape"),
        Err(JobError::InvalidPath(_))
    ));

    let digest = coord.result_digest(&id).unwrap();
    assert_eq!(digest, coord.result_digest(&id).unwrap());
}

#[test]
fn nonzero_exit_fails_with_reason_and_logs() {
    let h = Harness::new();
    let (coord, _) = h.start();

    let id = coord.submit(job("fail"), "10.0.0.2").unwrap();
    let snap = coord.wait_for(&id, WAIT).unwrap();
    assert_eq!(snap.state, JobState::Failed);
    assert_eq!(snap.failure, Some(FailureReason::NonZeroExit(3)));
    assert_eq!(coord.logs(&id).unwrap().stderr, "boom\n");
}

#[test]
fn wall_deadline_is_a_violation() {
    let h = Harness::new();
    let (coord, _) = h.start();

    let mut config = job("sleep:5000");
    config.limits = ResourceLimits {
        wall_seconds: 1,
        ..ResourceLimits::default()
    };
    let id = coord.submit(config, "10.0.0.3").unwrap();
    let snap = coord.wait_for(&id, WAIT).unwrap();
    assert_eq!(snap.state, JobState::Failed);
    assert_eq!(snap.violation, Some(Violation::WallTimeout));
    assert!(snap.timeout_occurred);
}

#[test]
fn queries_before_completion_report_not_finished() {
    let h = Harness::new();
    let (coord, _) = h.start();

    let id = coord.submit(job("sleep:300"), "10.0.0.4").unwrap();
    assert!(matches!(coord.logs(&id), Err(JobError::NotFinished(_))));
    assert!(matches!(coord.acknowledge_download(&id), Err(JobError::NotFinished(_))));
    assert!(matches!(
        coord.status(&JobId::from("missing")),
        Err(JobError::NotFound(_))
    ));
    coord.wait_for(&id, WAIT).unwrap();
}

#[test]
fn per_client_concurrency_is_enforced_at_admission() {
    let h = Harness::new();
    let (coord, engine) = h.start();
    let client = "192.168.1.1";

    let a = coord.submit(job("sleep:300"), client).unwrap();
    let b = coord.submit(job("sleep:300"), client).unwrap();
    let err = coord.submit(job("ok"), client).unwrap_err();
    match err {
        SubmitError::Rejected(rejected) => {
            assert_eq!(rejected.reason, RejectReason::ConcurrencyLimit { active: 2, max: 2 });
            assert!(rejected.retry_after > Duration::ZERO);
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    coord.wait_for(&a, WAIT).unwrap();
    coord.wait_for(&b, WAIT).unwrap();
    assert!(engine.peak() <= 2);

    // Slots come back once both finish.
    let c = coord.submit(job("ok"), client).unwrap();
    assert_eq!(coord.wait_for(&c, WAIT).unwrap().state, JobState::Completed);
    assert_eq!(coord.quota().active_jobs(client), 0);
}

#[test]
fn cpu_window_exhaustion_rejects_further_jobs() {
    let h = Harness::new();
    let (coord, _) = h.start();
    let client = "172.16.0.9";

    let mut heavy = job("ok");
    heavy.env.insert("CPU".into(), "10.0".into());
    let id = coord.submit(heavy, client).unwrap();
    coord.wait_for(&id, WAIT).unwrap();

    let usage = coord.usage(client).unwrap();
    assert!((usage.cpu_seconds_used - 10.0).abs() < 1e-9);

    match coord.submit(job("ok"), client).unwrap_err() {
        SubmitError::Rejected(r) => {
            assert!(matches!(r.reason, RejectReason::CpuQuotaExhausted { .. }));
        }
        other => panic!("expected cpu rejection, got {other:?}"),
    }
    // Another client is unaffected.
    assert!(coord.submit(job("ok"), "172.16.0.10").is_ok());
}

#[test]
fn worker_wide_parallelism_keeps_jobs_queued() {
    let mut h = Harness::new();
    h.config.lifecycle.max_parallel_jobs = 1;
    let (coord, engine) = h.start();

    let first = coord.submit(job("sleep:300"), "10.1.0.1").unwrap();
    let second = coord.submit(job("ok"), "10.1.0.2").unwrap();

    let deadline = Instant::now() + WAIT;
    while coord.status(&first).unwrap().state != JobState::Running {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }
    let waiting = coord.status(&second).unwrap();
    assert_eq!(waiting.state, JobState::Queued);
    assert_eq!(waiting.queue_position, Some(0));

    coord.wait_for(&first, WAIT).unwrap();
    assert_eq!(coord.wait_for(&second, WAIT).unwrap().state, JobState::Completed);
    assert_eq!(engine.peak(), 1);
}

#[test]
fn higher_priority_client_runs_first() {
    let mut h = Harness::new();
    h.config.lifecycle.max_parallel_jobs = 1;
    let (coord, _) = h.start();
    coord.quota().set_priority("vip", 10);

    let blocker = coord.submit(job("sleep:500"), "slow").unwrap();
    let deadline = Instant::now() + WAIT;
    while coord.status(&blocker).unwrap().state != JobState::Running {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }
    let normal = coord.submit(job("ok"), "normal").unwrap();
    let vip = coord.submit(job("ok"), "vip").unwrap();
    assert_eq!(coord.status(&vip).unwrap().queue_position, Some(0));
    assert_eq!(coord.status(&normal).unwrap().queue_position, Some(1));

    let vip_done = coord.wait_for(&vip, WAIT).unwrap();
    let normal_done = coord.wait_for(&normal, WAIT).unwrap();
    assert!(vip_done.started_at.unwrap() <= normal_done.started_at.unwrap());
}

#[test]
fn setup_failure_and_panic_are_isolated() {
    let h = Harness::new();
    let (coord, _) = h.start();

    let setup = coord.submit(job("setup"), "10.2.0.1").unwrap();
    let snap = coord.wait_for(&setup, WAIT).unwrap();
    assert_eq!(snap.state, JobState::Failed);
    assert!(matches!(snap.failure, Some(FailureReason::SetupFailure(_))));
    assert!(coord.logs(&setup).unwrap().stderr.contains("pivot_root"));

    let panicked = coord.submit(job("panic"), "10.2.0.1").unwrap();
    let snap = coord.wait_for(&panicked, WAIT).unwrap();
    assert!(matches!(snap.failure, Some(FailureReason::Internal(_))));

    // The coordinator still works and the client's slots were returned.
    assert_eq!(coord.quota().active_jobs("10.2.0.1"), 0);
    let ok = coord.submit(job("ok"), "10.2.0.1").unwrap();
    assert_eq!(coord.wait_for(&ok, WAIT).unwrap().state, JobState::Completed);
}

#[test]
fn invalid_and_preflight_failures_issue_no_job() {
    let h = Harness::new();
    let (coord, _) = h.start();

    let mut bad = job("ok");
    bad.entrypoint = "../main.py".into();
    assert!(matches!(coord.submit(bad, "10.3.0.1"), Err(SubmitError::Invalid(_))));
    assert!(matches!(
        coord.submit(job("preflight"), "10.3.0.1"),
        Err(SubmitError::Setup(SandboxError::Gpu(_)))
    ));
    assert_eq!(coord.job_count(), 0);
    assert_eq!(coord.quota().active_jobs("10.3.0.1"), 0);
}

#[test]
fn acknowledged_download_removes_record_and_workspace() {
    let h = Harness::new();
    let (coord, _) = h.start();
    let before = coord.metrics().evictions(EvictionCause::Download);

    let id = coord.submit(job("ok"), "10.4.0.1").unwrap();
    coord.wait_for(&id, WAIT).unwrap();
    let dir = h.jobs_root.join(id.as_str());
    assert!(dir.exists());

    coord.acknowledge_download(&id).unwrap();
    assert!(!dir.exists());
    assert!(matches!(coord.status(&id), Err(JobError::NotFound(_))));
    assert!(matches!(coord.acknowledge_download(&id), Err(JobError::NotFound(_))));
    assert!(coord.metrics().evictions(EvictionCause::Download) > before);
}

#[test]
fn terminal_jobs_expire_after_their_ttl() {
    let mut h = Harness::new();
    h.config.lifecycle.completed_ttl_secs = 300;
    h.config.lifecycle.failed_ttl_secs = 60;
    let (coord, _) = h.start();

    let ok = coord.submit(job("ok"), "10.5.0.1").unwrap();
    let failed = coord.submit(job("fail"), "10.5.0.2").unwrap();
    coord.wait_for(&ok, WAIT).unwrap();
    coord.wait_for(&failed, WAIT).unwrap();

    assert_eq!(coord.sweep_now(), 0);
    assert_eq!(coord.sweep_at(Instant::now() + Duration::from_secs(120)), 1);
    assert!(coord.status(&failed).is_err());
    assert!(coord.status(&ok).is_ok());

    assert_eq!(coord.sweep_at(Instant::now() + Duration::from_secs(400)), 1);
    assert_eq!(coord.job_count(), 0);
    assert!(!h.jobs_root.join(ok.as_str()).exists());
}

#[test]
fn memory_pressure_evicts_oldest_terminal_job() {
    let mut h = Harness::new();
    h.config.lifecycle.memory_pressure_bytes = 1;
    let (coord, _) = h.start();

    let old = coord.submit(job("ok"), "10.6.0.1").unwrap();
    coord.wait_for(&old, WAIT).unwrap();
    let new = coord.submit(job("ok"), "10.6.0.2").unwrap();
    coord.wait_for(&new, WAIT).unwrap();

    let before = coord.metrics().evictions(EvictionCause::MemoryPressure);
    // Every record is over a one-byte budget, so both go, oldest first.
    assert_eq!(coord.sweep_now(), 2);
    assert!(coord.status(&old).is_err());
    assert!(coord.status(&new).is_err());
    assert!(coord.metrics().evictions(EvictionCause::MemoryPressure) >= before + 2);
}

#[test]
fn shutdown_cancels_running_and_drops_queued() {
    let mut h = Harness::new();
    h.config.lifecycle.max_parallel_jobs = 1;
    let (coord, _) = h.start();

    let running = coord.submit(job("sleep:60000"), "10.7.0.1").unwrap();
    let deadline = Instant::now() + WAIT;
    while coord.status(&running).unwrap().state != JobState::Running {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }
    coord.submit(job("ok"), "10.7.0.2").unwrap();

    let started = Instant::now();
    coord.shutdown();
    assert!(started.elapsed() < WAIT);
    assert_eq!(coord.job_count(), 0);
    assert_eq!(coord.running_count(), 0);
    assert!(std::fs::read_dir(&h.jobs_root).unwrap().next().is_none());
    assert!(matches!(
        coord.submit(job("ok"), "10.7.0.1"),
        Err(SubmitError::ShuttingDown)
    ));
    coord.shutdown();
}

#[test]
fn job_whose_deadline_passes_in_the_queue_fails_unexecuted() {
    let mut h = Harness::new();
    h.config.lifecycle.max_parallel_jobs = 1;
    let (coord, _) = h.start();

    let blocker = coord.submit(job("sleep:1500"), "10.8.0.1").unwrap();
    let deadline = Instant::now() + WAIT;
    while coord.status(&blocker).unwrap().state != JobState::Running {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }
    let mut short = job("ok");
    short.limits = ResourceLimits {
        wall_seconds: 1,
        ..ResourceLimits::default()
    };
    let before = coord.metrics().failures(&FailureReason::Expired);
    let id = coord.submit(short, "10.8.0.2").unwrap();

    let snap = coord.wait_for(&id, WAIT).unwrap();
    assert_eq!(snap.state, JobState::Failed);
    assert_eq!(snap.failure, Some(FailureReason::Expired));
    assert_eq!(snap.history, vec![JobState::Queued, JobState::Running, JobState::Failed]);
    assert_eq!(snap.exit_code, None);
    assert_eq!(snap.violation, None);
    assert!(coord.metrics().failures(&FailureReason::Expired) > before);

    let usage = coord.usage("10.8.0.2").unwrap();
    assert_eq!(usage.pending_jobs, 0);
    assert_eq!(usage.running_jobs, 0);
    assert_eq!(usage.cpu_seconds_used, 0.0);
    coord.wait_for(&blocker, WAIT).unwrap();
}
