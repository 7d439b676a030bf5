//! Per-client admission control.
//!
//! Every mutation of a client's counters happens under one table lock, so
//! admission, start and completion bookkeeping for a client are serialised.
//! CPU-seconds from concurrently finishing jobs are added one completion at
//! a time and cannot be lost or double counted.
//!
//! A running job holds its CPU grant as a reservation against the window.
//! A job may start only while charged usage plus the other reservations is
//! within the limit, so at most one grant reaches past it: charged usage
//! overshoots the window by no more than one in-flight job's CPU.

use crate::config::settings::QuotaConfig;
use crate::config::types::{AdmissionRejected, RejectReason};
use crate::quota::sliding_window::{SlidingWindowLimiter, UsageWindow};
use crate::quota::token_bucket::TokenBucket;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const HOUR: Duration = Duration::from_secs(3600);
/// Retry hint when the only obstacle is a busy concurrency slot
const CONCURRENCY_RETRY_HINT: Duration = Duration::from_secs(5);

/// Limit families tracked per client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    Ban,
    RequestRate,
    ConcurrentJobs,
    JobsPerHour,
    CpuSeconds,
}

impl LimitType {
    fn of(reason: &RejectReason) -> Self {
        match reason {
            RejectReason::Banned { .. } => LimitType::Ban,
            RejectReason::RequestRate => LimitType::RequestRate,
            RejectReason::ConcurrencyLimit { .. } => LimitType::ConcurrentJobs,
            RejectReason::HourlyJobLimit { .. } => LimitType::JobsPerHour,
            RejectReason::CpuQuotaExhausted { .. } => LimitType::CpuSeconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ban {
    Permanent,
    Until(Instant),
}

impl Ban {
    fn active_at(self, now: Instant) -> bool {
        match self {
            Ban::Permanent => true,
            Ban::Until(t) => now < t,
        }
    }
}

/// Counters for one client address
#[derive(Debug)]
struct ClientQuota {
    cpu_usage: UsageWindow,
    /// Admitted, not yet started
    pending: HashSet<String>,
    /// Started, not yet completed, with the CPU grant each one holds
    running: HashMap<String, f64>,
    hourly_jobs: SlidingWindowLimiter,
    requests: TokenBucket,
    ban: Option<Ban>,
    priority: i32,
    last_seen: Instant,
    rejections: BTreeMap<LimitType, u64>,
    total_cpu_seconds: f64,
    completed_jobs: u64,
}

impl ClientQuota {
    fn new(config: &QuotaConfig, now: Instant) -> Self {
        Self {
            cpu_usage: UsageWindow::new(config.cpu_window()),
            pending: HashSet::new(),
            running: HashMap::new(),
            hourly_jobs: SlidingWindowLimiter::new(HOUR, config.max_jobs_per_hour as usize),
            requests: TokenBucket::starting_at(
                f64::from(config.request_burst),
                config.request_refill_per_sec,
                now,
            ),
            ban: None,
            priority: 0,
            last_seen: now,
            rejections: BTreeMap::new(),
            total_cpu_seconds: 0.0,
            completed_jobs: 0,
        }
    }

    fn outstanding(&self) -> usize {
        self.pending.len() + self.running.len()
    }

    fn reserved_cpu(&self) -> f64 {
        self.running.values().sum()
    }

    fn active_ban(&mut self, now: Instant) -> Option<Ban> {
        match self.ban {
            Some(ban) if ban.active_at(now) => Some(ban),
            Some(_) => {
                self.ban = None;
                None
            }
            None => None,
        }
    }
}

/// Successful admission
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub client_id: String,
    pub job_id: String,
    pub priority: i32,
    /// CPU-seconds left in the window at admission time
    pub cpu_seconds_remaining: f64,
}

/// Why an admitted job may not start yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDenied {
    /// The job was never admitted or was already started
    NotAdmitted,
    ConcurrencyLimit,
    CpuExhausted,
}

/// Read-only view of one client's quota state
#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    pub client_id: String,
    pub cpu_seconds_used: f64,
    /// Held by running jobs, not yet charged
    pub cpu_seconds_reserved: f64,
    pub cpu_seconds_limit: f64,
    pub window_resets_in: Option<Duration>,
    pub running_jobs: usize,
    pub pending_jobs: usize,
    pub jobs_this_hour: usize,
    pub banned: bool,
    pub priority: i32,
    pub rejections: BTreeMap<LimitType, u64>,
    pub total_cpu_seconds: f64,
    pub completed_jobs: u64,
}

/// Shared quota table
pub struct QuotaEngine {
    config: QuotaConfig,
    clients: Mutex<HashMap<String, ClientQuota>>,
}

impl QuotaEngine {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, ClientQuota>> {
        // Counters stay consistent across a panic elsewhere: every update
        // below is completed before the guard drops.
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check_admission(
        &self,
        client_id: &str,
        job_id: &str,
    ) -> Result<Admission, AdmissionRejected> {
        self.check_admission_at(client_id, job_id, Instant::now())
    }

    /// Admit `job_id` for `client_id` or say why not.
    ///
    /// Checks run in order: ban, request rate, concurrency, hourly job
    /// count, CPU-seconds. On success a pending slot is reserved, so the
    /// concurrency ceiling counts queued and running jobs alike.
    pub fn check_admission_at(
        &self,
        client_id: &str,
        job_id: &str,
        now: Instant,
    ) -> Result<Admission, AdmissionRejected> {
        let mut table = self.table();
        let config = &self.config;
        let client = table
            .entry(client_id.to_string())
            .or_insert_with(|| ClientQuota::new(config, now));
        client.last_seen = now;

        let verdict = Self::evaluate(config, client, now);
        match verdict {
            Ok(()) => {
                client.pending.insert(job_id.to_string());
                client.hourly_jobs.allow_request_at(now);
                let used = client.cpu_usage.total_at(now);
                log::debug!(
                    "admitted job {} for {} (pending={}, running={}, cpu_used={:.3})",
                    job_id,
                    client_id,
                    client.pending.len(),
                    client.running.len(),
                    used
                );
                Ok(Admission {
                    client_id: client_id.to_string(),
                    job_id: job_id.to_string(),
                    priority: client.priority,
                    cpu_seconds_remaining: (config.cpu_seconds_per_window - used).max(0.0),
                })
            }
            Err((reason, retry_after)) => {
                *client.rejections.entry(LimitType::of(&reason)).or_insert(0) += 1;
                log::info!("rejected submission from {}: {:?}", client_id, reason);
                Err(AdmissionRejected {
                    client_id: client_id.to_string(),
                    reason,
                    retry_after,
                })
            }
        }
    }

    fn evaluate(
        config: &QuotaConfig,
        client: &mut ClientQuota,
        now: Instant,
    ) -> Result<(), (RejectReason, Duration)> {
        if let Some(ban) = client.active_ban(now) {
            let (remaining_secs, retry) = match ban {
                Ban::Permanent => (None, Duration::from_secs(config.default_ban_secs)),
                Ban::Until(t) => {
                    let left = t.saturating_duration_since(now);
                    (Some(left.as_secs()), left)
                }
            };
            return Err((RejectReason::Banned { remaining_secs }, retry));
        }

        if !client.requests.try_consume_at(1.0, now) {
            let retry = client
                .requests
                .time_until_available_at(1.0, now)
                .unwrap_or(Duration::from_secs(1));
            return Err((RejectReason::RequestRate, retry));
        }

        let active = client.outstanding();
        if active >= config.max_concurrent_jobs as usize {
            return Err((
                RejectReason::ConcurrencyLimit {
                    active: active as u32,
                    max: config.max_concurrent_jobs,
                },
                CONCURRENCY_RETRY_HINT,
            ));
        }

        if !client.hourly_jobs.would_allow_at(now) {
            return Err((
                RejectReason::HourlyJobLimit {
                    max: config.max_jobs_per_hour,
                },
                client.hourly_jobs.time_to_next_slot_at(now),
            ));
        }

        let used = client.cpu_usage.total_at(now);
        if used >= config.cpu_seconds_per_window {
            let retry = client
                .cpu_usage
                .time_until_below_at(config.cpu_seconds_per_window, now);
            return Err((
                RejectReason::CpuQuotaExhausted {
                    used_seconds: used,
                    limit_seconds: config.cpu_seconds_per_window,
                },
                retry,
            ));
        }

        Ok(())
    }

    /// Drop a pending reservation for a job that will never start.
    pub fn release_admission(&self, client_id: &str, job_id: &str) -> bool {
        let mut table = self.table();
        match table.get_mut(client_id) {
            Some(client) => client.pending.remove(job_id),
            None => false,
        }
    }

    /// True iff the client has fewer RUNNING jobs than the ceiling.
    pub fn can_start_new_job(&self, client_id: &str) -> bool {
        let table = self.table();
        table
            .get(client_id)
            .map_or(true, |c| c.running.len() < self.config.max_concurrent_jobs as usize)
    }

    /// CPU-seconds still available in the client's window.
    pub fn cpu_seconds_remaining(&self, client_id: &str) -> f64 {
        self.cpu_seconds_remaining_at(client_id, Instant::now())
    }

    pub fn cpu_seconds_remaining_at(&self, client_id: &str, now: Instant) -> f64 {
        let mut table = self.table();
        let used = table
            .get_mut(client_id)
            .map_or(0.0, |c| c.cpu_usage.total_at(now));
        (self.config.cpu_seconds_per_window - used).max(0.0)
    }

    pub fn mark_job_started(
        &self,
        client_id: &str,
        job_id: &str,
        requested_cpu_seconds: f64,
    ) -> Result<f64, StartDenied> {
        self.mark_job_started_at(client_id, job_id, requested_cpu_seconds, Instant::now())
    }

    /// Move an admitted job to running and return its CPU grant.
    ///
    /// The grant is the requested CPU ceiling clamped to what is left in
    /// the window. The start is refused with `CpuExhausted`, leaving the job
    /// admitted, when the window is spent or when charged usage plus the
    /// grants of the client's other running jobs already fills it.
    pub fn mark_job_started_at(
        &self,
        client_id: &str,
        job_id: &str,
        requested_cpu_seconds: f64,
        now: Instant,
    ) -> Result<f64, StartDenied> {
        let mut table = self.table();
        let client = table.get_mut(client_id).ok_or(StartDenied::NotAdmitted)?;
        if !client.pending.contains(job_id) {
            return Err(StartDenied::NotAdmitted);
        }
        if client.running.len() >= self.config.max_concurrent_jobs as usize {
            return Err(StartDenied::ConcurrencyLimit);
        }
        let limit = self.config.cpu_seconds_per_window;
        let used = client.cpu_usage.total_at(now);
        if used >= limit || used + client.reserved_cpu() > limit {
            return Err(StartDenied::CpuExhausted);
        }

        let grant = requested_cpu_seconds.max(0.0).min(limit - used);
        client.pending.remove(job_id);
        client.running.insert(job_id.to_string(), grant);
        client.last_seen = now;
        Ok(grant)
    }

    pub fn mark_job_completed(&self, client_id: &str, job_id: &str, cpu_seconds: f64) -> bool {
        self.mark_job_completed_at(client_id, job_id, cpu_seconds, Instant::now())
    }

    /// Release the running slot and its reservation, and charge CPU time.
    ///
    /// Returns false, and charges nothing, if the job is not running; a
    /// second completion for the same job is therefore harmless.
    pub fn mark_job_completed_at(
        &self,
        client_id: &str,
        job_id: &str,
        cpu_seconds: f64,
        now: Instant,
    ) -> bool {
        let mut table = self.table();
        let Some(client) = table.get_mut(client_id) else {
            log::warn!("completion for unknown client {} (job {})", client_id, job_id);
            return false;
        };
        if client.running.remove(job_id).is_none() {
            log::warn!("duplicate or unmatched completion for job {}", job_id);
            return false;
        }
        let charged = if cpu_seconds.is_finite() { cpu_seconds.max(0.0) } else { 0.0 };
        client.cpu_usage.record_at(charged, now);
        client.total_cpu_seconds += charged;
        client.completed_jobs += 1;
        client.last_seen = now;
        true
    }

    /// Number of RUNNING jobs for the client.
    pub fn active_jobs(&self, client_id: &str) -> usize {
        self.table().get(client_id).map_or(0, |c| c.running.len())
    }

    pub fn ban_ip(&self, client_id: &str, duration: Option<Duration>) {
        self.ban_ip_at(client_id, duration, Instant::now())
    }

    /// Ban a client. `None` bans until `unban_ip`.
    pub fn ban_ip_at(&self, client_id: &str, duration: Option<Duration>, now: Instant) {
        let mut table = self.table();
        let config = &self.config;
        let client = table
            .entry(client_id.to_string())
            .or_insert_with(|| ClientQuota::new(config, now));
        client.ban = Some(match duration {
            Some(d) => Ban::Until(now + d),
            None => Ban::Permanent,
        });
        log::warn!("banned client {} for {:?}", client_id, duration);
    }

    pub fn unban_ip(&self, client_id: &str) -> bool {
        let mut table = self.table();
        match table.get_mut(client_id) {
            Some(client) => {
                let was_banned = client.ban.take().is_some();
                if was_banned {
                    log::info!("unbanned client {}", client_id);
                }
                was_banned
            }
            None => false,
        }
    }

    pub fn is_ip_banned(&self, client_id: &str) -> bool {
        self.is_ip_banned_at(client_id, Instant::now())
    }

    pub fn is_ip_banned_at(&self, client_id: &str, now: Instant) -> bool {
        self.table()
            .get_mut(client_id)
            .map_or(false, |c| c.active_ban(now).is_some())
    }

    /// Set queue priority; higher runs first among eligible jobs.
    pub fn set_priority(&self, client_id: &str, level: i32) {
        let now = Instant::now();
        let mut table = self.table();
        let config = &self.config;
        table
            .entry(client_id.to_string())
            .or_insert_with(|| ClientQuota::new(config, now))
            .priority = level;
    }

    pub fn priority(&self, client_id: &str) -> i32 {
        self.table().get(client_id).map_or(0, |c| c.priority)
    }

    pub fn usage(&self, client_id: &str) -> Option<QuotaSnapshot> {
        self.usage_at(client_id, Instant::now())
    }

    pub fn usage_at(&self, client_id: &str, now: Instant) -> Option<QuotaSnapshot> {
        let mut table = self.table();
        let client = table.get_mut(client_id)?;
        let banned = client.active_ban(now).is_some();
        Some(QuotaSnapshot {
            client_id: client_id.to_string(),
            cpu_seconds_used: client.cpu_usage.total_at(now),
            cpu_seconds_reserved: client.reserved_cpu(),
            cpu_seconds_limit: self.config.cpu_seconds_per_window,
            window_resets_in: client
                .cpu_usage
                .reset_at(now)
                .map(|t| t.saturating_duration_since(now)),
            running_jobs: client.running.len(),
            pending_jobs: client.pending.len(),
            jobs_this_hour: client.hourly_jobs.current_count_at(now),
            banned,
            priority: client.priority,
            rejections: client.rejections.clone(),
            total_cpu_seconds: client.total_cpu_seconds,
            completed_jobs: client.completed_jobs,
        })
    }

    pub fn cleanup_idle_clients(&self) -> usize {
        self.cleanup_idle_clients_at(Instant::now())
    }

    /// Forget clients with no jobs, no ban and no recent activity.
    pub fn cleanup_idle_clients_at(&self, now: Instant) -> usize {
        let ttl = self.config.client_idle_ttl();
        let mut table = self.table();
        let before = table.len();
        table.retain(|_, c| {
            let idle = c.outstanding() == 0
                && c.active_ban(now).is_none()
                && now.saturating_duration_since(c.last_seen) >= ttl;
            !idle
        });
        let removed = before - table.len();
        if removed > 0 {
            log::debug!("removed {} idle quota entries", removed);
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.table().len()
    }
}
