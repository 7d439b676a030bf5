//! Retention decisions.
//!
//! The janitor thread periodically looks at every job and decides what to
//! drop: terminal jobs past their TTL, and under memory pressure the oldest
//! terminal-or-stuck jobs until the total falls below the threshold.
//! Deciding is pure so it can be tested without threads or clocks.

use crate::config::settings::LifecycleConfig;
use crate::lifecycle::job::{JobId, JobState};
use std::time::{Duration, Instant};

/// What the janitor needs to know about one job
#[derive(Debug, Clone)]
pub struct JobView {
    pub id: JobId,
    pub state: JobState,
    pub queued_at: Instant,
    pub finished_at: Option<Instant>,
    pub stuck: bool,
    /// Already cancelled for eviction; waiting for its execution to return
    pub eviction_pending: bool,
    pub data_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Delete the record and its workspace now
    ExpireTtl,
    EvictTerminal,
    /// Cancel the execution; the record goes when it returns
    CancelStuck,
}

fn ttl_for(state: JobState, config: &LifecycleConfig) -> Option<Duration> {
    match state {
        JobState::Completed => Some(config.completed_ttl()),
        JobState::Failed => Some(config.failed_ttl()),
        JobState::Queued | JobState::Running => None,
    }
}

pub fn plan(jobs: &[JobView], now: Instant, config: &LifecycleConfig) -> Vec<(JobId, Action)> {
    let mut actions = Vec::new();
    let mut remaining: Vec<&JobView> = Vec::with_capacity(jobs.len());

    for job in jobs {
        let expired = match (ttl_for(job.state, config), job.finished_at) {
            (Some(ttl), Some(finished)) => now.saturating_duration_since(finished) >= ttl,
            _ => false,
        };
        if expired {
            actions.push((job.id.clone(), Action::ExpireTtl));
        } else {
            remaining.push(job);
        }
    }

    let mut total: u64 = remaining.iter().map(|j| j.data_bytes).sum();
    if total <= config.memory_pressure_bytes {
        return actions;
    }

    let mut candidates: Vec<&JobView> = remaining
        .into_iter()
        .filter(|j| j.state.is_terminal() || (j.stuck && !j.eviction_pending))
        .collect();
    candidates.sort_by_key(|j| j.queued_at);

    for job in candidates {
        if total <= config.memory_pressure_bytes {
            break;
        }
        let action = if job.state.is_terminal() {
            Action::EvictTerminal
        } else {
            Action::CancelStuck
        };
        actions.push((job.id.clone(), action));
        total = total.saturating_sub(job.data_bytes);
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pressure: u64) -> LifecycleConfig {
        LifecycleConfig {
            completed_ttl_secs: 300,
            failed_ttl_secs: 60,
            memory_pressure_bytes: pressure,
            ..LifecycleConfig::default()
        }
    }

    fn view(id: &str, state: JobState, age_secs: u64, finished_secs_ago: Option<u64>, bytes: u64) -> (JobView, Instant) {
        let now = Instant::now() + Duration::from_secs(10_000);
        (
            JobView {
                id: id.into(),
                state,
                queued_at: now - Duration::from_secs(age_secs),
                finished_at: finished_secs_ago.map(|s| now - Duration::from_secs(s)),
                stuck: false,
                eviction_pending: false,
                data_bytes: bytes,
            },
            now,
        )
    }

    #[test]
    fn failed_jobs_expire_sooner_than_completed() {
        let (failed, now) = view("f", JobState::Failed, 200, Some(100), 1);
        let (completed, _) = view("c", JobState::Completed, 200, Some(100), 1);
        let actions = plan(&[failed, completed], now, &config(u64::MAX));
        assert_eq!(actions, vec![(JobId::from("f"), Action::ExpireTtl)]);
    }

    #[test]
    fn live_jobs_never_expire() {
        let (queued, now) = view("q", JobState::Queued, 9000, None, 1);
        let (running, _) = view("r", JobState::Running, 9000, None, 1);
        assert!(plan(&[queued, running], now, &config(u64::MAX)).is_empty());
    }

    #[test]
    fn pressure_evicts_oldest_terminal_first_until_below() {
        let (old, now) = view("old", JobState::Completed, 50, Some(10), 100);
        let (mid, _) = view("mid", JobState::Failed, 40, Some(10), 100);
        let (new, _) = view("new", JobState::Completed, 30, Some(10), 100);
        let (running, _) = view("run", JobState::Running, 60, None, 100);

        let actions = plan(&[new, running, mid, old], now, &config(250));
        assert_eq!(
            actions,
            vec![
                (JobId::from("old"), Action::EvictTerminal),
                (JobId::from("mid"), Action::EvictTerminal),
            ]
        );
    }

    #[test]
    fn stuck_jobs_are_cancelled_once() {
        let (mut stuck, now) = view("stuck", JobState::Running, 100, None, 500);
        stuck.stuck = true;
        let (done, _) = view("done", JobState::Completed, 10, Some(1), 10);

        let actions = plan(&[stuck.clone(), done.clone()], now, &config(100));
        assert_eq!(actions[0], (JobId::from("stuck"), Action::CancelStuck));

        stuck.eviction_pending = true;
        let actions = plan(&[stuck, done], now, &config(100));
        assert_eq!(actions, vec![(JobId::from("done"), Action::EvictTerminal)]);
    }

    #[test]
    fn expired_bytes_do_not_count_toward_pressure() {
        let (expired, now) = view("x", JobState::Failed, 500, Some(400), 1000);
        let (fresh, _) = view("y", JobState::Completed, 5, Some(1), 10);
        let actions = plan(&[expired, fresh], now, &config(100));
        assert_eq!(actions, vec![(JobId::from("x"), Action::ExpireTtl)]);
    }
}
