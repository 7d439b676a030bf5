//! Job records and their state machine.
//!
//! A job moves QUEUED -> RUNNING -> COMPLETED or FAILED, never backwards and
//! never skipping RUNNING. The record is mutated only by whoever holds its
//! lock on behalf of the job's current phase; everyone else reads snapshots.

use crate::config::job::JobConfig;
use crate::config::types::{ExecutionResult, FailureReason, OutputFile, OutputIntegrity, Violation};
use crate::core::cancel::CancelToken;
use crate::safety::workspace::JobWorkspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Opaque job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        JobId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// Resource usage recorded on a finished job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUsage {
    pub cpu_seconds: f64,
    pub memory_peak_bytes: u64,
    pub gpu_memory_peak_bytes: Option<u64>,
    pub wall_time_ms: u64,
}

/// Captured streams of a finished job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogs {
    pub stdout: String,
    pub stderr: String,
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
}

/// Immutable view of a job for status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub client_id: String,
    pub state: JobState,
    /// Zero-based position while QUEUED
    pub queue_position: Option<usize>,
    pub priority: i32,
    pub interpreter: String,
    pub job_hash: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timeout_occurred: bool,
    pub violation: Option<Violation>,
    pub failure: Option<FailureReason>,
    pub usage: Option<JobUsage>,
    pub outputs: Vec<OutputFile>,
    pub history: Vec<JobState>,
}

#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub client_id: String,
    pub config: JobConfig,
    pub priority: i32,
    pub job_hash: String,
    pub cancel: CancelToken,
    /// Absolute wall-clock deadline fixed at admission
    pub deadline: Instant,
    pub queued_at: Instant,
    state: JobState,
    history: Vec<JobState>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    submitted_wall: DateTime<Utc>,
    started_wall: Option<DateTime<Utc>>,
    finished_wall: Option<DateTime<Utc>>,
    result: Option<ExecutionResult>,
    failure: Option<FailureReason>,
    workspace: Option<JobWorkspace>,
    /// Remove as soon as the execution returns
    evict_on_finish: bool,
}

impl Job {
    pub fn new(
        id: JobId,
        client_id: impl Into<String>,
        config: JobConfig,
        priority: i32,
        job_hash: String,
        now: Instant,
    ) -> Self {
        let deadline = now + Duration::from_secs(config.limits.wall_seconds);
        Self {
            id,
            client_id: client_id.into(),
            config,
            priority,
            job_hash,
            cancel: CancelToken::new(),
            deadline,
            queued_at: now,
            state: JobState::Queued,
            history: vec![JobState::Queued],
            started_at: None,
            finished_at: None,
            submitted_wall: Utc::now(),
            started_wall: None,
            finished_wall: None,
            result: None,
            failure: None,
            workspace: None,
            evict_on_finish: false,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        self.result.as_ref()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn workspace(&self) -> Option<&JobWorkspace> {
        self.workspace.as_ref()
    }

    fn transition(&mut self, to: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.history.push(to);
        Ok(())
    }

    pub fn mark_running(&mut self, now: Instant) -> Result<(), InvalidTransition> {
        self.transition(JobState::Running)?;
        self.started_at = Some(now);
        self.started_wall = Some(Utc::now());
        Ok(())
    }

    /// Record a finished execution. Success iff exit 0 with no violation and
    /// no cancellation.
    pub fn finish(
        &mut self,
        result: ExecutionResult,
        workspace: Option<JobWorkspace>,
        now: Instant,
    ) -> Result<JobState, InvalidTransition> {
        let failure = if self.cancel.is_cancelled() && !result.is_success() {
            Some(FailureReason::Cancelled)
        } else {
            result.failure_reason()
        };
        let to = if failure.is_none() {
            JobState::Completed
        } else {
            JobState::Failed
        };
        self.transition(to)?;
        self.failure = failure;
        self.result = Some(result);
        self.workspace = workspace;
        self.stamp_finished(now);
        Ok(to)
    }

    /// Record a failure that produced no execution result.
    pub fn fail(&mut self, reason: FailureReason, now: Instant) -> Result<(), InvalidTransition> {
        self.transition(JobState::Failed)?;
        self.failure = Some(reason);
        self.stamp_finished(now);
        Ok(())
    }

    fn stamp_finished(&mut self, now: Instant) {
        self.finished_at = Some(now);
        self.finished_wall = Some(Utc::now());
    }

    /// RUNNING past its deadline plus `grace`.
    pub fn is_stuck(&self, now: Instant, grace: Duration) -> bool {
        self.state == JobState::Running && now >= self.deadline + grace
    }

    pub fn request_eviction(&mut self) {
        self.evict_on_finish = true;
        self.cancel.cancel();
    }

    pub fn eviction_requested(&self) -> bool {
        self.evict_on_finish
    }

    /// Bytes this record keeps in memory: inputs, captured streams and
    /// the tmpfs workspace.
    pub fn data_bytes(&self) -> u64 {
        let streams = self
            .result
            .as_ref()
            .map_or(0, |r| (r.stdout.len() + r.stderr.len()) as u64);
        let workspace = self.workspace.as_ref().map_or(0, JobWorkspace::data_bytes);
        self.config.input_bytes() + streams + workspace
    }

    pub fn logs(&self) -> Option<JobLogs> {
        if !self.state.is_terminal() {
            return None;
        }
        Some(match (&self.result, &self.failure) {
            (Some(r), _) => JobLogs {
                stdout: r.stdout.clone(),
                stderr: r.stderr.clone(),
                stdout_integrity: r.stdout_integrity,
                stderr_integrity: r.stderr_integrity,
            },
            (None, failure) => JobLogs {
                stdout: String::new(),
                stderr: failure.as_ref().map(ToString::to_string).unwrap_or_default(),
                stdout_integrity: OutputIntegrity::Complete,
                stderr_integrity: OutputIntegrity::Complete,
            },
        })
    }

    /// Release the workspace now. Idempotent.
    pub fn release_workspace(&mut self) {
        if let Some(mut workspace) = self.workspace.take() {
            if let Err(e) = workspace.release() {
                log::warn!("Failed to release workspace of job {}: {}", self.id, e);
            }
        }
    }

    pub fn snapshot(&self, queue_position: Option<usize>) -> JobSnapshot {
        let result = self.result.as_ref();
        JobSnapshot {
            id: self.id.clone(),
            client_id: self.client_id.clone(),
            state: self.state,
            queue_position: if self.state == JobState::Queued {
                queue_position
            } else {
                None
            },
            priority: self.priority,
            interpreter: self.config.interpreter.tag().to_string(),
            job_hash: self.job_hash.clone(),
            submitted_at: self.submitted_wall,
            started_at: self.started_wall,
            finished_at: self.finished_wall,
            exit_code: result.and_then(|r| r.exit_code),
            signal: result.and_then(|r| r.signal),
            timeout_occurred: result.map_or(false, |r| r.timeout_occurred),
            violation: result.and_then(|r| r.violation),
            failure: self.failure.clone(),
            usage: result.map(|r| JobUsage {
                cpu_seconds: r.cpu_seconds,
                memory_peak_bytes: r.memory_peak,
                gpu_memory_peak_bytes: r.gpu_memory_peak,
                wall_time_ms: r.execution_time.as_millis() as u64,
            }),
            outputs: result.map(|r| r.output_files.clone()).unwrap_or_default(),
            history: self.history.clone(),
        }
    }
}
