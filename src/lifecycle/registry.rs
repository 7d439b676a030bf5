//! Job registry: the only cross-job map besides the quota table.
//!
//! The map is behind an `RwLock`; each job sits behind its own `Mutex`, so
//! a status read of one job never waits on another job's bookkeeping.

use crate::lifecycle::job::{Job, JobId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

pub type SharedJob = Arc<Mutex<Job>>;

/// Lock a job record. A panic while holding the lock leaves the record as
/// it was before the panicking call, so poisoning is ignored.
pub fn lock_job(job: &SharedJob) -> MutexGuard<'_, Job> {
    job.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, SharedJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> SharedJob {
        let id = job.id.clone();
        let shared = Arc::new(Mutex::new(job));
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&shared));
        shared
    }

    pub fn get(&self, id: &JobId) -> Option<SharedJob> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &JobId) -> Option<SharedJob> {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Every record, cloned out so no map lock is held while callers lock jobs.
    pub fn all(&self) -> Vec<SharedJob> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::job::JobConfig;
    use crate::config::presets::Interpreter;
    use std::time::Instant;

    fn job(id: &str) -> Job {
        Job::new(
            JobId::from(id),
            "client",
            JobConfig::new(Interpreter::Sh, "run.sh"),
            0,
            String::new(),
            Instant::now(),
        )
    }

    #[test]
    fn insert_get_remove() {
        let registry = JobRegistry::new();
        registry.insert(job("a"));
        registry.insert(job("b"));
        assert_eq!(registry.len(), 2);

        let a = registry.get(&"a".into()).unwrap();
        assert_eq!(lock_job(&a).id.as_str(), "a");

        assert!(registry.remove(&"a".into()).is_some());
        assert!(registry.get(&"a".into()).is_none());
        assert!(registry.remove(&"a".into()).is_none());
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn removed_record_stays_usable_by_holders() {
        let registry = JobRegistry::new();
        let held = registry.insert(job("a"));
        registry.remove(&"a".into());
        assert!(registry.is_empty());
        assert_eq!(lock_job(&held).id.as_str(), "a");
    }
}
