//! In-memory `Store`, a manually-advanced `Clock`, and fixture builders for
//! the engine's end-to-end scenarios (spec §4.11).
//!
//! [`InMemoryStore`] enforces the same CAS and idempotency contracts as
//! `scheduler-store-postgres`'s `PgStore` — tests that pass against this fake
//! but would fail against a real CAS-respecting store indicate a bug in the
//! test, not a gap in the fake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use scheduler_core::clock::Clock;
use scheduler_core::error::{StoreError, StoreResult};
use scheduler_core::model::{
    Dependency, DependencyKind, DlqEntry, HistoryEntry, Job, JobId, JobSpec, JobStatus, Lease,
    LeaseId, Outcome, PriorityBand, Worker, WorkerId, WorkerSpec, WorkerStatus,
};
use scheduler_core::store::{DependencyDirection, Store};

/// A `Clock` whose time is advanced explicitly, so backoff/heartbeat/aging
/// behavior is deterministic in tests instead of racing the wall clock.
#[derive(Debug)]
pub struct ManualClock {
    millis_since_epoch: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis_since_epoch: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis_since_epoch.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis_since_epoch.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis_since_epoch.load(Ordering::SeqCst)).unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DependencyKey {
    parent: JobId,
    child: JobId,
}

struct LeaseRecord {
    lease: Lease,
    completed_kind: Option<&'static str>,
}

fn outcome_kind(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Completed => "completed",
        Outcome::Failed { .. } => "failed",
        Outcome::Cancelled => "cancelled",
    }
}

/// Full in-memory [`Store`]. Every CAS method checks `expected` before
/// writing, matching `PgStore::update_job_status`'s `WHERE status = $expected`
/// clause; `complete_lease` is idempotent keyed by `(lease_id, outcome-kind)`,
/// matching `PgStore::complete_lease`'s short-circuit on a repeat.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: DashMap<JobId, Job>,
    dependencies: Mutex<HashMap<DependencyKey, DependencyKind>>,
    workers: DashMap<WorkerId, Worker>,
    leases: DashMap<LeaseId, LeaseRecord>,
    active_lease_by_job: DashMap<JobId, LeaseId>,
    dlq: DashMap<JobId, DlqEntry>,
    history: Mutex<Vec<HistoryEntry>>,
    relayed: Mutex<std::collections::HashSet<u64>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_job(&self, job: &Job) -> StoreResult<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate);
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Job> {
        self.jobs.get(&id).map(|j| j.clone()).ok_or(StoreError::NotFound)
    }

    async fn list_active_jobs(&self) -> StoreResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|e| !e.value().status.is_terminal())
            .map(|e| e.value().clone())
            .collect())
    }

    async fn update_job_status(&self, id: JobId, expected: JobStatus, new: JobStatus) -> StoreResult<()> {
        let mut job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if job.status != expected {
            return Err(StoreError::Conflict);
        }
        job.status = new;
        job.version += 1;
        Ok(())
    }

    async fn add_dependency(&self, dep: Dependency) -> StoreResult<()> {
        let key = DependencyKey { parent: dep.parent, child: dep.child };
        let mut deps = self.dependencies.lock();
        if deps.contains_key(&key) {
            return Err(StoreError::Duplicate);
        }
        deps.insert(key, dep.kind);
        Ok(())
    }

    async fn remove_dependency(&self, parent: JobId, child: JobId) -> StoreResult<()> {
        self.dependencies.lock().remove(&DependencyKey { parent, child });
        Ok(())
    }

    async fn list_dependencies(&self, job_id: JobId, direction: DependencyDirection) -> StoreResult<Vec<Dependency>> {
        let deps = self.dependencies.lock();
        Ok(deps
            .iter()
            .filter(|(key, _)| match direction {
                DependencyDirection::Children => key.parent == job_id,
                DependencyDirection::Parents => key.child == job_id,
            })
            .map(|(key, kind)| Dependency { parent: key.parent, child: key.child, kind: *kind })
            .collect())
    }

    async fn list_all_dependencies(&self) -> StoreResult<Vec<Dependency>> {
        Ok(self
            .dependencies
            .lock()
            .iter()
            .map(|(key, kind)| Dependency { parent: key.parent, child: key.child, kind: *kind })
            .collect())
    }

    async fn put_worker(&self, spec: WorkerSpec, now: DateTime<Utc>) -> StoreResult<Worker> {
        if let Some(mut existing) = self.workers.get_mut(&spec.id) {
            existing.locator = spec.locator;
            existing.capabilities = spec.capabilities;
            existing.max_slots = spec.max_slots.max(1);
            existing.reserved_high_priority_slots = spec.reserved_high_priority_slots;
            existing.load_factor = spec.load_factor;
            existing.priority_threshold = spec.priority_threshold;
            existing.status = WorkerStatus::Active;
            existing.last_heartbeat = now;
            existing.epoch += 1;
            return Ok(existing.clone());
        }
        let worker = Worker::from_spec(spec, now);
        self.workers.insert(worker.id.clone(), worker.clone());
        Ok(worker)
    }

    async fn get_worker(&self, id: &WorkerId) -> StoreResult<Worker> {
        self.workers.get(id).map(|w| w.clone()).ok_or(StoreError::NotFound)
    }

    async fn list_workers(&self) -> StoreResult<Vec<Worker>> {
        Ok(self.workers.iter().map(|e| e.value().clone()).collect())
    }

    async fn update_worker_heartbeat(&self, id: &WorkerId, now: DateTime<Utc>) -> StoreResult<()> {
        let mut w = self.workers.get_mut(id).ok_or(StoreError::NotFound)?;
        w.last_heartbeat = now;
        Ok(())
    }

    async fn update_worker_status(&self, id: &WorkerId, expected: WorkerStatus, new: WorkerStatus) -> StoreResult<()> {
        let mut w = self.workers.get_mut(id).ok_or(StoreError::NotFound)?;
        if w.status != expected {
            return Err(StoreError::Conflict);
        }
        w.status = new;
        Ok(())
    }

    async fn issue_lease(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        attempt: u32,
        issued_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> StoreResult<Lease> {
        {
            let mut job = self.jobs.get_mut(&job_id).ok_or(StoreError::NotFound)?;
            if job.status != JobStatus::Ready {
                return Err(StoreError::Conflict);
            }
            if self.active_lease_by_job.contains_key(&job_id) {
                return Err(StoreError::Conflict);
            }
            job.status = JobStatus::Running;
            job.attempt_count = attempt;
            job.version += 1;
        }

        let lease = Lease {
            id: LeaseId::new_v4(),
            job_id,
            worker_id: worker_id.clone(),
            issued_at,
            deadline,
            attempt,
        };
        self.active_lease_by_job.insert(job_id, lease.id);
        self.leases.insert(
            lease.id,
            LeaseRecord { lease: lease.clone(), completed_kind: None },
        );
        Ok(lease)
    }

    async fn get_active_lease(&self, job_id: JobId) -> StoreResult<Option<Lease>> {
        let Some(lease_id) = self.active_lease_by_job.get(&job_id).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.leases.get(&lease_id).map(|r| r.lease.clone()))
    }

    async fn list_active_leases(&self) -> StoreResult<Vec<Lease>> {
        Ok(self
            .leases
            .iter()
            .filter(|e| e.value().completed_kind.is_none())
            .map(|e| e.value().lease.clone())
            .collect())
    }

    async fn complete_lease(&self, lease_id: LeaseId, outcome: Outcome) -> StoreResult<Job> {
        let kind = outcome_kind(&outcome);
        let job_id = {
            let record = self.leases.get(&lease_id).ok_or(StoreError::NotFound)?;
            if record.completed_kind == Some(kind) {
                return self.jobs.get(&record.lease.job_id).map(|j| j.clone()).ok_or(StoreError::NotFound);
            }
            record.lease.job_id
        };

        let terminal = match &outcome {
            Outcome::Completed => JobStatus::Completed,
            Outcome::Cancelled => JobStatus::Cancelled,
            Outcome::Failed { .. } => JobStatus::Failed,
        };
        let error = match &outcome {
            Outcome::Failed { error, .. } => Some(error.clone()),
            _ => None,
        };

        {
            let mut job = self.jobs.get_mut(&job_id).ok_or(StoreError::NotFound)?;
            job.status = terminal;
            if let Some(error) = error {
                job.last_error = Some(error);
            }
            job.version += 1;
        }
        self.active_lease_by_job.remove(&job_id);
        if let Some(mut record) = self.leases.get_mut(&lease_id) {
            record.completed_kind = Some(kind);
        }

        self.jobs.get(&job_id).map(|j| j.clone()).ok_or(StoreError::NotFound)
    }

    async fn append_history(&self, entry: HistoryEntry) -> StoreResult<()> {
        self.history.lock().push(entry);
        Ok(())
    }

    async fn unrelayed_history(&self, limit: usize) -> StoreResult<Vec<(u64, HistoryEntry)>> {
        let history = self.history.lock();
        let relayed = self.relayed.lock();
        Ok(history
            .iter()
            .enumerate()
            .map(|(i, entry)| (i as u64, entry.clone()))
            .filter(|(seq, _)| !relayed.contains(seq))
            .take(limit)
            .collect())
    }

    async fn mark_history_relayed(&self, sequence: u64) -> StoreResult<()> {
        self.relayed.lock().insert(sequence);
        Ok(())
    }

    async fn put_dlq(&self, entry: DlqEntry) -> StoreResult<()> {
        self.dlq.insert(entry.job_id, entry);
        Ok(())
    }

    async fn list_dlq(&self, offset: usize, limit: usize) -> StoreResult<Vec<DlqEntry>> {
        Ok(self.dlq.iter().map(|e| e.value().clone()).skip(offset).take(limit).collect())
    }

    async fn get_dlq(&self, job_id: JobId) -> StoreResult<DlqEntry> {
        self.dlq.get(&job_id).map(|e| e.clone()).ok_or(StoreError::NotFound)
    }

    async fn remove_dlq(&self, job_id: JobId) -> StoreResult<()> {
        self.dlq.remove(&job_id);
        Ok(())
    }
}

/// Fixtures for the literal end-to-end scenarios, reusable across integration
/// tests so each test states only the part of the scenario it's checking.
pub mod scenarios {
    use super::*;
    use std::collections::HashSet;

    fn caps(tags: &[&str]) -> HashSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    pub fn worker_spec(id: &str, capabilities: &[&str], slots: u32) -> WorkerSpec {
        WorkerSpec {
            id: id.to_string(),
            locator: format!("inproc://{id}"),
            capabilities: caps(capabilities),
            max_slots: slots,
            reserved_high_priority_slots: 0,
            load_factor: 1.0,
            priority_threshold: PriorityBand::Low,
        }
    }

    /// Scenario A fixture: J1 (no deps) -> J2 (depends on J1) -> J3 (depends
    /// on J2), all `Normal` priority, `MustComplete` edges.
    pub fn linear_chain(names: [&str; 3]) -> [JobSpec; 3] {
        names.map(|name| JobSpec::new(name, serde_json::json!({})).with_priority(PriorityBand::Normal))
    }

    /// Scenario D fixture: J1 with no deps, J2 `MustSucceed` on J1, J3
    /// `MustComplete` on J1.
    pub fn must_succeed_and_must_complete_fanout() -> (JobSpec, JobSpec, JobSpec, DependencyKind, DependencyKind) {
        let j1 = JobSpec::new("root", serde_json::json!({})).with_max_attempts(1);
        let j2 = JobSpec::new("must-succeed-child", serde_json::json!({}));
        let j3 = JobSpec::new("must-complete-child", serde_json::json!({}));
        (j1, j2, j3, DependencyKind::MustSucceed, DependencyKind::MustComplete)
    }

    /// Scenario F fixture: two capability pools, `W1={cpu}x2`, `W2={gpu}x1`.
    pub fn capability_pools() -> (WorkerSpec, WorkerSpec, JobSpec, JobSpec, JobSpec, JobSpec) {
        let w1 = worker_spec("w-cpu", &["cpu"], 2);
        let w2 = worker_spec("w-gpu", &["gpu"], 1);
        let jg = JobSpec::new("gpu-job", serde_json::json!({})).with_capabilities(caps(&["gpu"]));
        let jc1 = JobSpec::new("cpu-job-1", serde_json::json!({})).with_capabilities(caps(&["cpu"]));
        let jc2 = JobSpec::new("cpu-job-2", serde_json::json!({})).with_capabilities(caps(&["cpu"]));
        let jc3 = JobSpec::new("cpu-job-3", serde_json::json!({})).with_capabilities(caps(&["cpu"]));
        (w1, w2, jg, jc1, jc2, jc3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_job_status_enforces_cas() {
        let store = InMemoryStore::new();
        let job = Job::new(
            "x",
            serde_json::json!({}),
            PriorityBand::Normal,
            Default::default(),
            3,
            None,
            None,
            Utc::now(),
        );
        let id = job.id;
        store.put_job(&job).await.unwrap();

        assert_eq!(
            store.update_job_status(id, JobStatus::Running, JobStatus::Completed).await,
            Err(StoreError::Conflict)
        );
        store.update_job_status(id, JobStatus::Pending, JobStatus::Ready).await.unwrap();
        assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Ready);
    }

    #[tokio::test]
    async fn complete_lease_is_idempotent_per_outcome_kind() {
        let store = InMemoryStore::new();
        let job = Job::new(
            "x",
            serde_json::json!({}),
            PriorityBand::Normal,
            Default::default(),
            3,
            None,
            None,
            Utc::now(),
        );
        let id = job.id;
        store.put_job(&job).await.unwrap();
        store.update_job_status(id, JobStatus::Pending, JobStatus::Ready).await.unwrap();
        let worker_id = "w1".to_string();
        let now = Utc::now();
        let lease = store.issue_lease(id, &worker_id, 1, now, now + Duration::minutes(5)).await.unwrap();

        let job1 = store.complete_lease(lease.id, Outcome::Completed).await.unwrap();
        let job2 = store.complete_lease(lease.id, Outcome::Completed).await.unwrap();
        assert_eq!(job1.status, JobStatus::Completed);
        assert_eq!(job2.status, JobStatus::Completed);
    }

    #[test]
    fn manual_clock_advances_deterministically() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(90));
        assert_eq!((clock.now() - start).num_seconds(), 90);
    }
}
