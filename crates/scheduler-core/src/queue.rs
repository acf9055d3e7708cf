//! Priority-ordered ready queue (spec §4.3).
//!
//! Jobs are keyed by a `score`: lower dispatches earlier. The score is computed
//! once at enqueue/re-enqueue time by [`ScoreParams::score`] and never
//! recomputed while a job sits in the queue, so the ordered structure itself
//! never needs to be rebalanced out from under a reader.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::{JobId, PriorityBand};

/// Score formula constants (spec §6). All are configuration with documented
/// defaults; see [`crate::config::SchedulerConfig`] for the live values.
#[derive(Debug, Clone, Copy)]
pub struct ScoreParams {
    pub band_high: i64,
    pub band_normal: i64,
    pub band_low: i64,
    pub age_weight_per_minute: i64,
    pub retry_penalty_per_attempt: i64,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            band_high: 0,
            band_normal: 1000,
            band_low: 2000,
            age_weight_per_minute: 1,
            retry_penalty_per_attempt: 100,
        }
    }
}

impl ScoreParams {
    fn base_band(&self, band: PriorityBand) -> i64 {
        match band {
            PriorityBand::High => self.band_high,
            PriorityBand::Normal => self.band_normal,
            PriorityBand::Low => self.band_low,
        }
    }

    /// `score = base_band + age_minutes*age_weight + retry_penalty*attempt -
    /// overdue_bonus`.
    ///
    /// `overdue_bonus` is the number of minutes past `scheduled_at` (0 if not
    /// yet due or no `scheduled_at` was set), weighted the same as age so a
    /// job that is very overdue can outrank aging alone.
    pub fn score(
        &self,
        band: PriorityBand,
        created_at: DateTime<Utc>,
        scheduled_at: Option<DateTime<Utc>>,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> i64 {
        let age_minutes = (now - created_at).num_minutes().max(0);
        let overdue_minutes = scheduled_at
            .map(|at| (now - at).num_minutes().max(0))
            .unwrap_or(0);

        self.base_band(band)
            + age_minutes * self.age_weight_per_minute
            + i64::from(attempt_count) * self.retry_penalty_per_attempt
            - overdue_minutes * self.age_weight_per_minute
    }
}

/// Ordering key: `(score, sequence, job_id)`. `sequence` is a monotonically
/// increasing enqueue counter that makes ties break by insertion order,
/// giving the queue a deterministic iteration order for identical input
/// histories (spec §8 property 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    score: i64,
    sequence: u64,
    job_id: JobId,
}

#[derive(Debug)]
pub struct PriorityQueue {
    ordered: Mutex<BTreeSet<Entry>>,
    index: Mutex<HashMap<JobId, Entry>>,
    next_sequence: AtomicI64,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            ordered: Mutex::new(BTreeSet::new()),
            index: Mutex::new(HashMap::new()),
            next_sequence: AtomicI64::new(0),
        }
    }

    /// Insert a job at `score`. If the job is already queued it is moved
    /// (equivalent to `remove` then `push`).
    pub fn push(&self, job_id: JobId, score: i64) {
        self.remove(job_id);
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed) as u64;
        let entry = Entry {
            score,
            sequence,
            job_id,
        };
        self.ordered.lock().insert(entry);
        self.index.lock().insert(job_id, entry);
    }

    pub fn pop(&self) -> Option<JobId> {
        let mut ordered = self.ordered.lock();
        let entry = ordered.iter().next().copied()?;
        ordered.remove(&entry);
        self.index.lock().remove(&entry.job_id);
        Some(entry.job_id)
    }

    pub fn peek_top(&self) -> Option<JobId> {
        self.ordered.lock().iter().next().map(|e| e.job_id)
    }

    pub fn remove(&self, job_id: JobId) -> bool {
        if let Some(entry) = self.index.lock().remove(&job_id) {
            self.ordered.lock().remove(&entry);
            true
        } else {
            false
        }
    }

    /// Equivalent to `remove` followed by `push` at the new score, per spec
    /// §4.3.
    pub fn reprioritize(&self, job_id: JobId, new_score: i64) {
        self.push(job_id, new_score);
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.index.lock().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.ordered.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First `limit` job ids in dispatch order, without removing them.
    pub fn snapshot(&self, limit: usize) -> Vec<JobId> {
        self.ordered
            .lock()
            .iter()
            .take(limit)
            .map(|e| e.job_id)
            .collect()
    }
}
