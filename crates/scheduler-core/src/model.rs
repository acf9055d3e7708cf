//! Plain-record data model for jobs, dependencies, workers and leases.
//!
//! Nothing in this module holds a reference to anything else; every relationship
//! is expressed as an id and lives in the adjacency maps owned by
//! [`crate::graph::DependencyGraph`] and [`crate::registry::WorkerRegistry`]. The
//! [`crate::store::Store`] is the sole authority over these records — the graph,
//! queue and registry only ever hold derived views.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;
pub type WorkerId = String;
pub type LeaseId = Uuid;

/// Coarse priority band. Maps to a disjoint scoring range in [`crate::queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityBand {
    High,
    Normal,
    Low,
}

impl Default for PriorityBand {
    fn default() -> Self {
        PriorityBand::Normal
    }
}

/// Lifecycle status of a job. See spec §3 "Lifecycle".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    DeadLettered,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::DeadLettered
        )
    }
}

/// Directed edge type between a parent and a child job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    /// Parent must reach any terminal "completed" state (Completed or DeadLettered).
    MustComplete,
    /// Parent must reach exactly `Completed`; `Failed`/`DeadLettered` make it
    /// permanently unsatisfiable.
    MustSucceed,
    /// Parent must have at least started running once.
    MustStart,
    /// Informational only; never blocks dispatch.
    Soft,
}

impl DependencyKind {
    /// Whether a parent ending in `terminal` satisfies this edge.
    ///
    /// Per spec §4.6/§9: `DeadLettered` satisfies `MustComplete` (a fixed, if
    /// debated, policy choice) but never satisfies `MustSucceed`.
    pub fn is_satisfied_by(self, terminal: JobStatus) -> bool {
        match self {
            DependencyKind::Soft => true,
            DependencyKind::MustStart => true, // started is tracked separately; see graph.rs
            DependencyKind::MustComplete => {
                matches!(terminal, JobStatus::Completed | JobStatus::DeadLettered)
            }
            DependencyKind::MustSucceed => matches!(terminal, JobStatus::Completed),
        }
    }

    /// Whether a parent ending in `terminal` makes this edge permanently
    /// unsatisfiable (as opposed to simply not-yet-satisfied).
    ///
    /// `Cancelled` is a terminal non-completing state: a `MustSucceed` or
    /// `MustComplete` dependent can never be satisfied by it, so both kinds
    /// propagate unsatisfiability from a cancelled parent (the `MustComplete`
    /// case is not explicitly in spec §4.6's DeadLettered carve-out, but
    /// leaving it unsatisfiable rather than blocking forever matches the
    /// liveness property in spec §8 property 5).
    pub fn is_unsatisfiable_by(self, terminal: JobStatus) -> bool {
        match self {
            DependencyKind::MustSucceed => matches!(
                terminal,
                JobStatus::Failed | JobStatus::DeadLettered | JobStatus::Cancelled
            ),
            DependencyKind::MustComplete => matches!(terminal, JobStatus::Cancelled),
            _ => false,
        }
    }

    /// Soft edges never gate readiness.
    pub fn blocks(self) -> bool {
        !matches!(self, DependencyKind::Soft)
    }
}

/// A single directed dependency edge, as persisted by the Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub parent: JobId,
    pub child: JobId,
    pub kind: DependencyKind,
}

/// A durable job record. The payload is opaque to the engine beyond being
/// serializable JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: PriorityBand,
    pub capabilities: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub estimated_duration_secs: Option<i64>,
    pub last_error: Option<String>,
    /// CAS version, bumped on every Store-side status transition.
    pub version: i64,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        payload: serde_json::Value,
        priority: PriorityBand,
        capabilities: HashSet<String>,
        max_attempts: u32,
        scheduled_at: Option<DateTime<Utc>>,
        estimated_duration_secs: Option<i64>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            payload,
            status: JobStatus::Pending,
            priority,
            capabilities,
            created_at,
            scheduled_at,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            estimated_duration_secs,
            last_error: None,
            version: 0,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Implemented by strongly-typed payload structs that want a one-line
/// conversion into the opaque JSON a [`JobSpec`] carries. See
/// [`crate::auto_payload`] for the derive-style shortcut.
pub trait IntoPayload {
    fn into_payload(&self) -> serde_json::Value;
}

/// A request to submit a new job, prior to id assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub payload: serde_json::Value,
    pub priority: PriorityBand,
    pub capabilities: HashSet<String>,
    pub max_attempts: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub estimated_duration_secs: Option<i64>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            priority: PriorityBand::Normal,
            capabilities: HashSet::new(),
            max_attempts: 3,
            scheduled_at: None,
            estimated_duration_secs: None,
        }
    }

    pub fn with_priority(mut self, priority: PriorityBand) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities(mut self, capabilities: HashSet<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }
}

/// Lifecycle status of a worker. See spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Active,
    Draining,
    Unreachable,
    Dead,
}

/// Registration request for a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub locator: String,
    pub capabilities: HashSet<String>,
    pub max_slots: u32,
    pub reserved_high_priority_slots: u32,
    pub load_factor: f64,
    pub priority_threshold: PriorityBand,
}

/// A durable worker record. The registry is the sole authority for this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub locator: String,
    pub capabilities: HashSet<String>,
    pub max_slots: u32,
    pub reserved_high_priority_slots: u32,
    pub load_factor: f64,
    pub priority_threshold: PriorityBand,
    pub status: WorkerStatus,
    pub assigned_jobs: HashSet<JobId>,
    pub last_heartbeat: DateTime<Utc>,
    pub epoch: u64,
    pub lifetime_assigned: u64,
    pub lifetime_succeeded: u64,
    pub lifetime_failed: u64,
    pub avg_execution_secs: f64,
}

impl Worker {
    pub fn from_spec(spec: WorkerSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: spec.id,
            locator: spec.locator,
            capabilities: spec.capabilities,
            max_slots: spec.max_slots.max(1),
            reserved_high_priority_slots: spec.reserved_high_priority_slots,
            load_factor: spec.load_factor.clamp(0.1, 2.0),
            priority_threshold: spec.priority_threshold,
            status: WorkerStatus::Active,
            assigned_jobs: HashSet::new(),
            last_heartbeat: now,
            epoch: 0,
            lifetime_assigned: 0,
            lifetime_succeeded: 0,
            lifetime_failed: 0,
            avg_execution_secs: 1.0,
        }
    }

    pub fn available_slots(&self, high_priority: bool) -> u32 {
        let usable = if high_priority {
            self.max_slots
        } else {
            self.max_slots.saturating_sub(self.reserved_high_priority_slots)
        };
        usable.saturating_sub(self.assigned_jobs.len() as u32)
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.lifetime_succeeded + self.lifetime_failed;
        if total == 0 {
            1.0
        } else {
            self.lifetime_succeeded as f64 / total as f64
        }
    }
}

/// Outcome reported by a worker for a completed lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    Completed,
    Failed { error: String, retryable: bool },
    Cancelled,
}

/// A time-bounded exclusive right of one worker to execute one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub attempt: u32,
}

/// A dead-letter entry: the final resting place for a job whose retries are
/// exhausted or which failed with a non-retryable error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub job_id: JobId,
    pub final_error: String,
    pub attempt_history: Vec<String>,
    pub payload: serde_json::Value,
    pub dead_lettered_at: DateTime<Utc>,
}

/// An append-only audit/history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub job_id: Option<JobId>,
    pub worker_id: Option<WorkerId>,
    pub event_kind: String,
    pub details: serde_json::Value,
}
