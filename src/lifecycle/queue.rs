//! Run queue: FIFO, with higher priority first among eligible jobs.

use crate::lifecycle::job::JobId;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

/// Ordering key: higher priority first, then admission order.
type Key = (Reverse<i32>, u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub client_id: String,
    pub priority: i32,
    key: Key,
}

#[derive(Debug, Default)]
pub struct JobQueue {
    entries: BTreeMap<Key, QueueEntry>,
    index: HashMap<JobId, Key>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job_id: JobId, client_id: impl Into<String>, priority: i32) {
        let key = (Reverse(priority), self.next_seq);
        self.next_seq += 1;
        self.index.insert(job_id.clone(), key);
        self.entries.insert(
            key,
            QueueEntry {
                job_id,
                client_id: client_id.into(),
                priority,
                key,
            },
        );
    }

    /// Put a popped entry back at its original place.
    pub fn requeue(&mut self, entry: QueueEntry) {
        self.index.insert(entry.job_id.clone(), entry.key);
        self.entries.insert(entry.key, entry);
    }

    /// Remove and return the first job whose client passes `eligible`.
    pub fn pop_first_eligible<F>(&mut self, mut eligible: F) -> Option<QueueEntry>
    where
        F: FnMut(&str) -> bool,
    {
        let key = self
            .entries
            .iter()
            .find(|(_, e)| eligible(&e.client_id))
            .map(|(k, _)| *k)?;
        let entry = self.entries.remove(&key)?;
        self.index.remove(&entry.job_id);
        Some(entry)
    }

    pub fn remove(&mut self, job_id: &JobId) -> Option<QueueEntry> {
        let key = self.index.remove(job_id)?;
        self.entries.remove(&key)
    }

    /// Zero-based position in run order.
    pub fn position(&self, job_id: &JobId) -> Option<usize> {
        let key = self.index.get(job_id)?;
        Some(self.entries.range(..*key).count())
    }

    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(q: &mut JobQueue) -> Vec<String> {
        q.drain().into_iter().map(|e| e.job_id.to_string()).collect()
    }

    #[test]
    fn fifo_within_priority() {
        let mut q = JobQueue::new();
        q.push("a".into(), "c1", 0);
        q.push("b".into(), "c2", 0);
        q.push("c".into(), "c1", 0);
        assert_eq!(ids(&mut q), vec!["a", "b", "c"]);
    }

    #[test]
    fn higher_priority_goes_first() {
        let mut q = JobQueue::new();
        q.push("low".into(), "c1", 0);
        q.push("high".into(), "c2", 5);
        q.push("neg".into(), "c3", -1);
        assert_eq!(q.position(&"high".into()), Some(0));
        assert_eq!(q.position(&"low".into()), Some(1));
        assert_eq!(q.position(&"neg".into()), Some(2));
    }

    #[test]
    fn ineligible_clients_are_skipped_not_dropped() {
        let mut q = JobQueue::new();
        q.push("a".into(), "busy", 0);
        q.push("b".into(), "free", 0);
        let popped = q.pop_first_eligible(|c| c != "busy").unwrap();
        assert_eq!(popped.job_id.as_str(), "b");
        assert_eq!(q.len(), 1);
        assert_eq!(q.position(&"a".into()), Some(0));
    }

    #[test]
    fn requeue_restores_order() {
        let mut q = JobQueue::new();
        q.push("a".into(), "c", 0);
        q.push("b".into(), "c", 0);
        let first = q.pop_first_eligible(|_| true).unwrap();
        q.requeue(first);
        assert_eq!(ids(&mut q), vec!["a", "b"]);
    }

    #[test]
    fn remove_by_id() {
        let mut q = JobQueue::new();
        q.push("a".into(), "c", 0);
        assert!(q.remove(&"a".into()).is_some());
        assert!(q.remove(&"a".into()).is_none());
        assert!(q.is_empty());
        assert_eq!(q.position(&"a".into()), None);
    }
}
