//! Transactional storage boundary (spec §4.1).
//!
//! The engine depends only on this trait; `scheduler-store-postgres` provides a
//! concrete implementation and `scheduler-testing` provides an in-memory fake for
//! tests. Every method is atomic from the caller's point of view — if an
//! implementation needs several underlying statements, it wraps them in a
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::model::{
    Dependency, DependencyKind, DlqEntry, HistoryEntry, Job, JobId, JobStatus, Lease, LeaseId,
    Outcome, Worker, WorkerId, WorkerSpec, WorkerStatus,
};

/// Direction for [`Store::list_dependencies`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyDirection {
    /// Edges where the given job is the parent.
    Children,
    /// Edges where the given job is the parent.
    Parents,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn put_job(&self, job: &Job) -> StoreResult<()>;

    async fn get_job(&self, id: JobId) -> StoreResult<Job>;

    /// List every non-terminal job, used by startup recovery.
    async fn list_active_jobs(&self) -> StoreResult<Vec<Job>>;

    /// Compare-and-set status transition. `expected` must match the job's
    /// current status or the call fails with [`crate::error::StoreError::Conflict`].
    async fn update_job_status(
        &self,
        id: JobId,
        expected: JobStatus,
        new: JobStatus,
    ) -> StoreResult<()>;

    /// Add a dependency edge. Fails with `Duplicate` if the edge already exists.
    /// Cycle/unsatisfiability validation happens in [`crate::graph::DependencyGraph`]
    /// before this is called — the store only persists what it's told.
    async fn add_dependency(&self, dep: Dependency) -> StoreResult<()>;

    async fn remove_dependency(&self, parent: JobId, child: JobId) -> StoreResult<()>;

    async fn list_dependencies(
        &self,
        job_id: JobId,
        direction: DependencyDirection,
    ) -> StoreResult<Vec<Dependency>>;

    /// List every dependency edge, used by startup recovery to rebuild the graph.
    async fn list_all_dependencies(&self) -> StoreResult<Vec<Dependency>>;

    async fn put_worker(&self, spec: WorkerSpec, now: DateTime<Utc>) -> StoreResult<Worker>;

    async fn get_worker(&self, id: &WorkerId) -> StoreResult<Worker>;

    async fn list_workers(&self) -> StoreResult<Vec<Worker>>;

    async fn update_worker_heartbeat(&self, id: &WorkerId, now: DateTime<Utc>) -> StoreResult<()>;

    async fn update_worker_status(
        &self,
        id: &WorkerId,
        expected: WorkerStatus,
        new: WorkerStatus,
    ) -> StoreResult<()>;

    /// Succeeds only if `job_id`'s status is `Ready` and it has no active lease;
    /// on success the job's status becomes `Running` atomically with the lease
    /// insertion.
    async fn issue_lease(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        attempt: u32,
        issued_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> StoreResult<Lease>;

    async fn get_active_lease(&self, job_id: JobId) -> StoreResult<Option<Lease>>;

    async fn list_active_leases(&self) -> StoreResult<Vec<Lease>>;

    /// Resolve a lease with an outcome. Idempotent keyed by `(lease_id,
    /// outcome-kind)`: calling this twice with the same lease and the same kind
    /// of outcome is a no-op the second time.
    async fn complete_lease(&self, lease_id: LeaseId, outcome: Outcome) -> StoreResult<Job>;

    async fn append_history(&self, entry: HistoryEntry) -> StoreResult<()>;

    /// History rows not yet acknowledged by the outbox relay, oldest first.
    async fn unrelayed_history(&self, limit: usize) -> StoreResult<Vec<(u64, HistoryEntry)>>;

    async fn mark_history_relayed(&self, sequence: u64) -> StoreResult<()>;

    async fn put_dlq(&self, entry: DlqEntry) -> StoreResult<()>;

    async fn list_dlq(&self, offset: usize, limit: usize) -> StoreResult<Vec<DlqEntry>>;

    async fn get_dlq(&self, job_id: JobId) -> StoreResult<DlqEntry>;

    async fn remove_dlq(&self, job_id: JobId) -> StoreResult<()>;
}

/// Convenience struct mirroring a dependency edge type name, kept here rather
/// than in `model` so `Store` implementors importing `store::*` get it too.
pub type EdgeKind = DependencyKind;
