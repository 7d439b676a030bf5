//! Job lifecycle coordinator.
//!
//! Owns the registry, the run queue and the quota table. `submit` blocks
//! only on admission; a scheduler thread moves queued jobs into per-job
//! execution threads, and a janitor thread enforces retention. Every
//! started job releases its quota slot exactly once through a
//! [`RunningSlot`], whatever way its execution ends.

use crate::config::settings::WorkerConfig;
use crate::config::types::{
    ExecutionResult, FailureReason, JobError, OutputFile, SandboxError, SubmitError,
};
use crate::config::validator::validate_worker_config;
use crate::config::job::JobConfig;
use crate::core::engine::{ExecutionContext, SandboxEngine};
use crate::lifecycle::digest;
use crate::lifecycle::janitor::{self, Action, JobView};
use crate::lifecycle::job::{Job, JobId, JobLogs, JobSnapshot, JobState};
use crate::lifecycle::queue::{JobQueue, QueueEntry};
use crate::lifecycle::registry::{lock_job, JobRegistry, SharedJob};
use crate::observability::metrics::{get_metrics, EvictionCause, MetricsRegistry};
use crate::quota::{QuotaEngine, QuotaSnapshot, StartDenied};
use crate::safety::cleanup::sweep_orphans;
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SCHEDULER_TICK: Duration = Duration::from_millis(250);
const WAIT_POLL: Duration = Duration::from_millis(10);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "execution panicked".to_string())
}

enum StartOutcome {
    Started,
    /// Left in the queue; the client cannot start anything right now
    Deferred,
    /// Failed without running: the deadline passed in the queue
    Expired,
    Dropped,
}

struct Inner {
    config: WorkerConfig,
    quota: QuotaEngine,
    engine: Arc<dyn SandboxEngine>,
    registry: JobRegistry,
    queue: Mutex<JobQueue>,
    wake_tx: Sender<()>,
    running: AtomicUsize,
    shutting_down: AtomicBool,
    job_threads: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<MetricsRegistry>,
}

/// Releases a started job's quota slot when dropped.
struct RunningSlot {
    inner: Arc<Inner>,
    client_id: String,
    job_id: JobId,
    cpu_seconds: f64,
}

impl RunningSlot {
    fn finish(mut self, cpu_seconds: f64) {
        self.cpu_seconds = cpu_seconds;
    }
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        if !self
            .inner
            .quota
            .mark_job_completed(&self.client_id, self.job_id.as_str(), self.cpu_seconds)
        {
            log::error!("Quota completion for job {} was not recorded", self.job_id);
        }
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
        self.inner.metrics.running_jobs.dec();
        self.inner.wake();
    }
}

impl Inner {
    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn with_queue<R>(&self, f: impl FnOnce(&mut JobQueue) -> R) -> R {
        let mut queue = lock(&self.queue);
        let out = f(&mut queue);
        self.metrics.queued_jobs.set(queue.len() as u64);
        out
    }

    fn dispatch_ready(self: &Arc<Self>) {
        let max = self.config.lifecycle.max_parallel_jobs;
        let mut deferred: HashSet<String> = HashSet::new();
        while self.running.load(Ordering::SeqCst) < max && !self.is_shutting_down() {
            let next = self.with_queue(|q| {
                q.pop_first_eligible(|client| {
                    !deferred.contains(client) && self.quota.can_start_new_job(client)
                })
            });
            let Some(entry) = next else { break };
            if let StartOutcome::Deferred = self.start_job(&entry) {
                deferred.insert(entry.client_id.clone());
                self.with_queue(|q| q.requeue(entry));
            }
        }
    }

    fn start_job(self: &Arc<Self>, entry: &QueueEntry) -> StartOutcome {
        let Some(job) = self.registry.get(&entry.job_id) else {
            self.quota
                .release_admission(&entry.client_id, entry.job_id.as_str());
            return StartOutcome::Dropped;
        };
        let (requested, deadline) = {
            let record = lock_job(&job);
            (record.config.limits.cpu_seconds as f64, record.deadline)
        };
        if Instant::now() >= deadline {
            self.expire_job(&job, entry);
            return StartOutcome::Expired;
        }
        let grant = match self
            .quota
            .mark_job_started(&entry.client_id, entry.job_id.as_str(), requested)
        {
            Ok(grant) => grant,
            Err(StartDenied::ConcurrencyLimit) | Err(StartDenied::CpuExhausted) => {
                return StartOutcome::Deferred
            }
            Err(StartDenied::NotAdmitted) => {
                log::error!("Job {} was queued without an admission; dropping it", entry.job_id);
                self.registry.remove(&entry.job_id);
                return StartOutcome::Dropped;
            }
        };

        let now = Instant::now();
        {
            let mut record = lock_job(&job);
            if let Err(e) = record.mark_running(now) {
                log::error!("Job {}: {}", entry.job_id, e);
                drop(record);
                self.quota
                    .mark_job_completed(&entry.client_id, entry.job_id.as_str(), 0.0);
                return StartOutcome::Dropped;
            }
            self.metrics
                .queue_wait
                .observe(now.saturating_duration_since(record.queued_at));
        }
        self.running.fetch_add(1, Ordering::SeqCst);
        self.metrics.running_jobs.inc();
        log::info!(
            "Job {} RUNNING for {} (cpu grant {:.3}s)",
            entry.job_id,
            entry.client_id,
            grant
        );

        let slot = RunningSlot {
            inner: Arc::clone(self),
            client_id: entry.client_id.clone(),
            job_id: entry.job_id.clone(),
            cpu_seconds: 0.0,
        };
        let inner = Arc::clone(self);
        let thread_job = Arc::clone(&job);
        let name: String = entry.job_id.as_str().chars().take(8).collect();
        let spawned = thread::Builder::new()
            .name(format!("job-{}", name))
            .spawn(move || inner.run_job(thread_job, slot, grant));
        match spawned {
            Ok(handle) => {
                let mut threads = lock(&self.job_threads);
                threads.retain(|h| !h.is_finished());
                threads.push(handle);
            }
            Err(e) => {
                // The slot went down with the closure; only the record is left.
                log::error!("Failed to spawn thread for job {}: {}", entry.job_id, e);
                let reason = FailureReason::Internal(format!("thread spawn failed: {}", e));
                self.metrics.record_failure(&reason);
                let _ = lock_job(&job).fail(reason, Instant::now());
            }
        }
        StartOutcome::Started
    }

    /// Fail a job whose wall deadline ran out while it waited for a slot or
    /// for CPU budget. It goes straight through RUNNING to FAILED without
    /// touching the sandbox or the client's running count.
    fn expire_job(&self, job: &SharedJob, entry: &QueueEntry) {
        let now = Instant::now();
        let failed = {
            let mut record = lock_job(job);
            record
                .mark_running(now)
                .and_then(|_| record.fail(FailureReason::Expired, now))
        };
        self.quota
            .release_admission(&entry.client_id, entry.job_id.as_str());
        match failed {
            Ok(()) => {
                log::warn!(
                    "Job {} for {} expired in the queue before it could start",
                    entry.job_id,
                    entry.client_id
                );
                self.metrics.record_failure(&FailureReason::Expired);
            }
            Err(e) => log::error!("Job {}: {}", entry.job_id, e),
        }
    }

    fn run_job(self: Arc<Self>, job: SharedJob, slot: RunningSlot, grant: f64) {
        let (config, deadline, cancel) = {
            let record = lock_job(&job);
            (record.config.clone(), record.deadline, record.cancel.clone())
        };
        let job_id = slot.job_id.clone();
        let ctx = ExecutionContext {
            job_id: job_id.as_str(),
            config: &config,
            deadline,
            cpu_seconds: grant,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.engine.execute(&ctx, &cancel)));

        let now = Instant::now();
        let mut record = lock_job(&job);
        let (cpu_seconds, recorded) = match outcome {
            Ok(Ok(execution)) => {
                self.metrics.run_time.observe(execution.result.execution_time);
                let cpu = execution.result.cpu_seconds;
                (cpu, record.finish(execution.result, execution.workspace, now).map(|_| ()))
            }
            Ok(Err(e)) => {
                log::warn!("Job {} sandbox setup failed: {}", job_id, e);
                (0.0, record.fail(FailureReason::SetupFailure(e.to_string()), now))
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                log::error!("Job {} execution panicked: {}", job_id, msg);
                (0.0, record.fail(FailureReason::Internal(msg), now))
            }
        };
        if let Err(e) = recorded {
            log::error!("Job {}: {}", job_id, e);
        }

        match record.failure() {
            None => self.metrics.jobs_completed.inc(),
            Some(reason) => self.metrics.record_failure(reason),
        }
        log::info!(
            "Job {} {}{}",
            job_id,
            record.state(),
            record
                .failure()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        slot.finish(cpu_seconds);

        let evict = record.eviction_requested();
        drop(record);
        if evict {
            self.remove_job(&job_id, EvictionCause::MemoryPressure);
        }
    }

    fn remove_job(&self, id: &JobId, cause: EvictionCause) -> bool {
        let Some(job) = self.registry.remove(id) else {
            return false;
        };
        let mut record = lock_job(&job);
        if record.state() == JobState::Queued {
            self.with_queue(|q| q.remove(id));
            self.quota.release_admission(&record.client_id, id.as_str());
        }
        record.release_workspace();
        self.metrics.record_eviction(cause);
        log::info!("Removed job {} ({:?})", id, cause);
        true
    }

    fn sweep(&self, now: Instant) -> usize {
        let grace = self.config.lifecycle.stuck_grace();
        let views: Vec<JobView> = self
            .registry
            .all()
            .iter()
            .map(|job| {
                let record = lock_job(job);
                JobView {
                    id: record.id.clone(),
                    state: record.state(),
                    queued_at: record.queued_at,
                    finished_at: record.finished_at(),
                    stuck: record.is_stuck(now, grace),
                    eviction_pending: record.eviction_requested(),
                    data_bytes: record.data_bytes(),
                }
            })
            .collect();

        let mut removed = 0;
        for (id, action) in janitor::plan(&views, now, &self.config.lifecycle) {
            match action {
                Action::ExpireTtl => removed += usize::from(self.remove_job(&id, EvictionCause::Ttl)),
                Action::EvictTerminal => {
                    removed += usize::from(self.remove_job(&id, EvictionCause::MemoryPressure))
                }
                Action::CancelStuck => {
                    if let Some(job) = self.registry.get(&id) {
                        log::warn!("Job {} is stuck past its deadline; cancelling", id);
                        lock_job(&job).request_eviction();
                    }
                }
            }
        }
        self.quota.cleanup_idle_clients();
        removed
    }

    fn terminal(&self, id: &JobId) -> Result<SharedJob, JobError> {
        let job = self
            .registry
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if !lock_job(&job).state().is_terminal() {
            return Err(JobError::NotFinished(id.to_string()));
        }
        Ok(job)
    }
}

fn scheduler_loop(inner: Arc<Inner>, wake_rx: Receiver<()>, shutdown_rx: Receiver<()>) {
    loop {
        select! {
            recv(wake_rx) -> _ => {}
            recv(shutdown_rx) -> _ => break,
            default(SCHEDULER_TICK) => {}
        }
        if inner.is_shutting_down() {
            break;
        }
        inner.dispatch_ready();
    }
    log::debug!("Scheduler stopped");
}

fn janitor_loop(inner: Arc<Inner>, shutdown_rx: Receiver<()>) {
    let interval = inner.config.lifecycle.sweep_interval();
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                inner.sweep(Instant::now());
            }
            _ => break,
        }
    }
    log::debug!("Janitor stopped");
}

/// The lifecycle manager's public surface.
pub struct Coordinator {
    inner: Arc<Inner>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Validate configuration, sweep leftovers from a previous run and start
    /// the scheduler and janitor threads.
    pub fn start(config: WorkerConfig, engine: Arc<dyn SandboxEngine>) -> Result<Self, SandboxError> {
        validate_worker_config(&config)?
            .into_result()
            .map_err(SandboxError::Config)?;

        let metrics = get_metrics();
        let report = sweep_orphans(&config.sandbox);
        metrics
            .orphans_swept
            .add((report.cgroups_removed + report.mounts_detached + report.dirs_removed) as u64);

        let (wake_tx, wake_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let inner = Arc::new(Inner {
            quota: QuotaEngine::new(config.quota.clone()),
            config,
            engine,
            registry: JobRegistry::new(),
            queue: Mutex::new(JobQueue::new()),
            wake_tx,
            running: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            job_threads: Mutex::new(Vec::new()),
            metrics,
        });

        let scheduler = {
            let inner = Arc::clone(&inner);
            let shutdown_rx = shutdown_rx.clone();
            thread::Builder::new()
                .name("sandrun-scheduler".to_string())
                .spawn(move || scheduler_loop(inner, wake_rx, shutdown_rx))?
        };
        let janitor = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("sandrun-janitor".to_string())
                .spawn(move || janitor_loop(inner, shutdown_rx))?
        };
        log::info!(
            "Coordinator started (max_parallel_jobs={}, max_concurrent_jobs={})",
            inner.config.lifecycle.max_parallel_jobs,
            inner.config.quota.max_concurrent_jobs
        );

        Ok(Self {
            inner,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            workers: Mutex::new(vec![scheduler, janitor]),
        })
    }

    /// Admit a job or reject it. Never waits on job execution.
    pub fn submit(&self, config: JobConfig, client_id: &str) -> Result<JobId, SubmitError> {
        let inner = &self.inner;
        if inner.is_shutting_down() {
            return Err(SubmitError::ShuttingDown);
        }
        config.validate().into_result().map_err(SubmitError::Invalid)?;
        inner.engine.preflight(&config)?;

        let id = JobId::generate();
        let admission = inner
            .quota
            .check_admission(client_id, id.as_str())
            .map_err(|rejected| {
                inner.metrics.record_rejection(&rejected.reason);
                rejected
            })?;

        let job_hash = digest::job_hash(&config);
        let job = Job::new(
            id.clone(),
            client_id,
            config,
            admission.priority,
            job_hash,
            Instant::now(),
        );
        inner.registry.insert(job);
        inner.with_queue(|q| q.push(id.clone(), client_id, admission.priority));
        inner.metrics.submissions.inc();
        log::info!(
            "Job {} QUEUED for {} (priority {})",
            id,
            client_id,
            admission.priority
        );

        if inner.is_shutting_down() {
            inner.remove_job(&id, EvictionCause::Shutdown);
            return Err(SubmitError::ShuttingDown);
        }
        inner.wake();
        Ok(id)
    }

    pub fn status(&self, id: &JobId) -> Result<JobSnapshot, JobError> {
        let position = lock(&self.inner.queue).position(id);
        let job = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let snapshot = lock_job(&job).snapshot(position);
        Ok(snapshot)
    }

    pub fn logs(&self, id: &JobId) -> Result<JobLogs, JobError> {
        let job = self.inner.terminal(id)?;
        let logs = lock_job(&job).logs();
        logs.ok_or_else(|| JobError::NotFinished(id.to_string()))
    }

    pub fn outputs(&self, id: &JobId) -> Result<Vec<OutputFile>, JobError> {
        let job = self.inner.terminal(id)?;
        let record = lock_job(&job);
        Ok(record
            .result()
            .map(|r| r.output_files.clone())
            .unwrap_or_default())
    }

    /// Host path of a downloadable output file.
    pub fn output_path(&self, id: &JobId, rel: &str) -> Result<PathBuf, JobError> {
        let job = self.inner.terminal(id)?;
        let record = lock_job(&job);
        let workspace = record
            .workspace()
            .ok_or_else(|| JobError::InvalidPath(format!("job {} has no outputs", id)))?;
        workspace.resolve(rel)
    }

    /// The client has its results; drop everything now.
    pub fn acknowledge_download(&self, id: &JobId) -> Result<(), JobError> {
        self.inner.terminal(id)?;
        if self.inner.remove_job(id, EvictionCause::Download) {
            Ok(())
        } else {
            Err(JobError::NotFound(id.to_string()))
        }
    }

    /// Digest over the job hash, exit code, usage and output hashes.
    pub fn result_digest(&self, id: &JobId) -> Result<String, JobError> {
        let job = self.inner.terminal(id)?;
        let record = lock_job(&job);
        let empty = ExecutionResult::default();
        let result = record.result().unwrap_or(&empty);
        Ok(digest::result_digest(&record.job_hash, result))
    }

    /// Block until the job is terminal or `timeout` passes.
    pub fn wait_for(&self, id: &JobId, timeout: Duration) -> Result<JobSnapshot, JobError> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.status(id)?;
            if snapshot.state.is_terminal() {
                return Ok(snapshot);
            }
            if Instant::now() >= deadline {
                return Err(JobError::NotFinished(id.to_string()));
            }
            thread::sleep(WAIT_POLL);
        }
    }

    pub fn usage(&self, client_id: &str) -> Option<QuotaSnapshot> {
        self.inner.quota.usage(client_id)
    }

    pub fn quota(&self) -> &QuotaEngine {
        &self.inner.quota
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

    pub fn job_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn queued_count(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run one retention pass now; returns the number of records removed.
    pub fn sweep_now(&self) -> usize {
        self.inner.sweep(Instant::now())
    }

    /// Retention pass as if the clock read `now`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        self.inner.sweep(now)
    }

    /// Stop accepting work, cancel running jobs and release everything.
    /// Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Coordinator shutting down");
        drop(lock(&self.shutdown_tx).take());
        for handle in lock(&self.workers).drain(..) {
            let _ = handle.join();
        }

        for entry in inner.with_queue(JobQueue::drain) {
            inner.remove_job(&entry.job_id, EvictionCause::Shutdown);
        }
        for job in inner.registry.all() {
            let record = lock_job(&job);
            if record.state() == JobState::Running {
                record.cancel.cancel();
            }
        }
        let threads: Vec<JoinHandle<()>> = lock(&inner.job_threads).drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
        for job in inner.registry.all() {
            let id = lock_job(&job).id.clone();
            inner.remove_job(&id, EvictionCause::Shutdown);
        }
        log::info!("Coordinator stopped");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
