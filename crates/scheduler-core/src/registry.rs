//! Worker lifecycle, health and capacity accounting (spec §4.4).

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::model::{JobId, PriorityBand, Worker, WorkerId, WorkerSpec, WorkerStatus};

/// Weights for [`WorkerRegistry::select_candidates`]'s scoring formula (spec
/// §4.4 / §9: pinned at 0.25 each plus a 1.3 high-priority multiplier, exposed
/// as configuration rather than hardcoded so a deployment can retune).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct CandidateWeights {
    pub available_capacity: f64,
    pub inverse_load: f64,
    pub success_rate: f64,
    pub inverse_exec_time: f64,
    pub high_priority_multiplier: f64,
}

impl Default for CandidateWeights {
    fn default() -> Self {
        Self {
            available_capacity: 0.25,
            inverse_load: 0.25,
            success_rate: 0.25,
            inverse_exec_time: 0.25,
            high_priority_multiplier: 1.3,
        }
    }
}

/// A job's requirements, as seen by the registry when selecting candidates.
/// Decoupled from [`crate::model::Job`] so callers (e.g. the dispatcher) can
/// pass a borrowed view without cloning the whole record.
#[derive(Debug, Clone, Copy)]
pub struct CandidateQuery<'a> {
    pub capabilities: &'a std::collections::HashSet<String>,
    pub priority: PriorityBand,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedCandidate {
    pub worker_id_index: usize,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    WorkerNotFound,
    Full,
    NotActive,
}

/// Owns the live worker table. Per spec §5, per-worker mutation is guarded by
/// `DashMap`'s internal per-shard locking (equivalent to a per-worker mutex
/// for the purposes of this engine); snapshot-style reads (`list`, `select_candidates`)
/// take a consistent-enough view by iterating the map directly.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: DashMap<WorkerId, Worker>,
    weights: CandidateWeights,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
            weights: CandidateWeights::default(),
        }
    }

    pub fn with_weights(weights: CandidateWeights) -> Self {
        Self {
            workers: DashMap::new(),
            weights,
        }
    }

    /// Idempotent by worker id. Re-registration preserves lifetime counters
    /// and increments the registration epoch, invalidating stale leases that
    /// might still be in flight from a previous incarnation of the worker.
    pub fn register(&self, spec: WorkerSpec, now: DateTime<Utc>) -> u64 {
        if let Some(mut existing) = self.workers.get_mut(&spec.id) {
            existing.locator = spec.locator;
            existing.capabilities = spec.capabilities;
            existing.max_slots = spec.max_slots.max(1);
            existing.reserved_high_priority_slots = spec.reserved_high_priority_slots;
            existing.load_factor = spec.load_factor.clamp(0.1, 2.0);
            existing.priority_threshold = spec.priority_threshold;
            existing.status = WorkerStatus::Active;
            existing.last_heartbeat = now;
            existing.epoch += 1;
            return existing.epoch;
        }
        let worker = Worker::from_spec(spec, now);
        let epoch = worker.epoch;
        self.workers.insert(worker.id.clone(), worker);
        epoch
    }

    /// Re-insert a worker exactly as persisted, used by startup recovery.
    /// Unlike [`Self::register`], this does not bump `epoch` — the persisted
    /// value is the source of truth and the registry must agree with the
    /// Store on it or the next live re-registration's epoch check fails.
    pub fn restore(&self, worker: Worker) {
        self.workers.insert(worker.id.clone(), worker);
    }

    pub fn heartbeat(&self, id: &WorkerId, now: DateTime<Utc>) -> bool {
        if let Some(mut w) = self.workers.get_mut(id) {
            w.last_heartbeat = now;
            if w.status == WorkerStatus::Unreachable {
                w.status = WorkerStatus::Active;
            }
            true
        } else {
            false
        }
    }

    /// Returns job ids that were assigned to the worker (for surrender to
    /// `FailureHandler`) if deregistration succeeds.
    pub fn deregister(&self, id: &WorkerId, force: bool) -> Result<Vec<JobId>, ReserveError> {
        let has_leases = self
            .workers
            .get(id)
            .map(|w| !w.assigned_jobs.is_empty())
            .ok_or(ReserveError::WorkerNotFound)?;

        if has_leases && !force {
            return Err(ReserveError::Full);
        }

        let (_, worker) = self.workers.remove(id).ok_or(ReserveError::WorkerNotFound)?;
        Ok(worker.assigned_jobs.into_iter().collect())
    }

    pub fn get(&self, id: &WorkerId) -> Option<Worker> {
        self.workers.get(id).map(|w| w.clone())
    }

    pub fn list(&self) -> Vec<Worker> {
        self.workers.iter().map(|e| e.value().clone()).collect()
    }

    /// Filters by status/capabilities/capacity/priority threshold, then ranks
    /// by the weighted scoring formula. Returns worker ids, highest score
    /// first.
    pub fn select_candidates(&self, query: CandidateQuery<'_>) -> Vec<WorkerId> {
        let high_priority = matches!(query.priority, PriorityBand::High);
        let mut ranked: Vec<(WorkerId, f64)> = self
            .workers
            .iter()
            .filter(|entry| {
                let w = entry.value();
                w.status == WorkerStatus::Active
                    && query.capabilities.is_subset(&w.capabilities)
                    && w.available_slots(high_priority) >= 1
                    && priority_meets_threshold(query.priority, w.priority_threshold)
            })
            .map(|entry| {
                let w = entry.value();
                (w.id.clone(), self.score_worker(w, high_priority))
            })
            .collect();

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.into_iter().map(|(id, _)| id).collect()
    }

    fn score_worker(&self, w: &Worker, high_priority: bool) -> f64 {
        let capacity_fraction = if w.max_slots == 0 {
            0.0
        } else {
            w.available_slots(high_priority) as f64 / w.max_slots as f64
        };
        let inverse_load = 1.0 / w.load_factor.max(0.1);
        let success_rate = w.success_rate();
        let inverse_exec_time = 1.0 / w.avg_execution_secs.max(0.001);

        let raw = self.weights.available_capacity * capacity_fraction
            + self.weights.inverse_load * inverse_load
            + self.weights.success_rate * success_rate
            + self.weights.inverse_exec_time * inverse_exec_time;

        if high_priority {
            raw * self.weights.high_priority_multiplier
        } else {
            raw
        }
    }

    /// Atomically reserve one slot on `worker_id` for `job_id`.
    pub fn reserve(&self, worker_id: &WorkerId, job_id: JobId, high_priority: bool) -> Result<(), ReserveError> {
        let mut w = self.workers.get_mut(worker_id).ok_or(ReserveError::WorkerNotFound)?;
        if w.status != WorkerStatus::Active {
            return Err(ReserveError::NotActive);
        }
        if w.available_slots(high_priority) < 1 {
            return Err(ReserveError::Full);
        }
        w.assigned_jobs.insert(job_id);
        w.lifetime_assigned += 1;
        Ok(())
    }

    pub fn release(&self, worker_id: &WorkerId, job_id: JobId) {
        if let Some(mut w) = self.workers.get_mut(worker_id) {
            w.assigned_jobs.remove(&job_id);
        }
    }

    pub fn record_outcome(&self, worker_id: &WorkerId, job_id: JobId, succeeded: bool, exec_secs: f64) {
        if let Some(mut w) = self.workers.get_mut(worker_id) {
            w.assigned_jobs.remove(&job_id);
            if succeeded {
                w.lifetime_succeeded += 1;
            } else {
                w.lifetime_failed += 1;
            }
            // Exponential moving average, alpha = 0.2.
            w.avg_execution_secs = w.avg_execution_secs * 0.8 + exec_secs * 0.2;
        }
    }

    /// Transition any `Active` worker whose last heartbeat predates
    /// `unreachable_cutoff` to `Unreachable`, and any `Unreachable` worker
    /// whose last heartbeat predates `dead_cutoff` to `Dead`. Returns the ids
    /// of workers that just became `Unreachable`, and the ids (and
    /// surrendered jobs) of workers that just became `Dead`.
    pub fn sweep_health(
        &self,
        unreachable_cutoff: DateTime<Utc>,
        dead_cutoff: DateTime<Utc>,
    ) -> (Vec<WorkerId>, Vec<(WorkerId, Vec<JobId>)>) {
        let mut newly_unreachable = Vec::new();
        let mut newly_dead = Vec::new();
        for mut entry in self.workers.iter_mut() {
            let w = entry.value_mut();
            match w.status {
                WorkerStatus::Active if w.last_heartbeat < unreachable_cutoff => {
                    w.status = WorkerStatus::Unreachable;
                    newly_unreachable.push(w.id.clone());
                }
                WorkerStatus::Unreachable if w.last_heartbeat < dead_cutoff => {
                    w.status = WorkerStatus::Dead;
                    newly_dead.push((w.id.clone(), w.assigned_jobs.iter().copied().collect()));
                    w.assigned_jobs.clear();
                }
                _ => {}
            }
        }
        (newly_unreachable, newly_dead)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

fn priority_meets_threshold(job_priority: PriorityBand, worker_threshold: PriorityBand) -> bool {
    fn rank(b: PriorityBand) -> u8 {
        match b {
            PriorityBand::High => 2,
            PriorityBand::Normal => 1,
            PriorityBand::Low => 0,
        }
    }
    rank(job_priority) >= rank(worker_threshold)
}
