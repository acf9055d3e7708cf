//! # scheduler-core
//!
//! The dependency-aware scheduling engine at the heart of the job system:
//! admission, the priority queue, the worker registry, dispatch and failure
//! handling.
//!
//! ## Core concepts
//!
//! - A [`model::Job`] is a unit of work with a priority band and zero or more
//!   dependency edges onto other jobs.
//! - A [`model::Dependency`] is a directed edge `parent -> child` with a
//!   [`model::DependencyKind`] describing what "parent finished" needs to
//!   mean before the child becomes eligible.
//! - The [`graph::DependencyGraph`] is an in-memory mirror of every edge,
//!   answering "is this job ready" in O(1) instead of a graph walk.
//! - The [`queue::PriorityQueue`] orders ready jobs by a deterministic score
//!   recomputed once per enqueue.
//! - The [`registry::WorkerRegistry`] tracks live workers, their capacity and
//!   their recent success rate.
//! - The [`dispatch::Dispatcher`] matches queued jobs to workers via a
//!   two-phase Reserve+IssueLease commit.
//! - The [`failure::FailureHandler`] decides retry-with-backoff vs.
//!   dead-letter for a failed or abandoned job.
//! - [`core::SchedulerCore`] wires all of the above to a [`store::Store`] and
//!   exposes the engine's public API.
//!
//! ## Architecture
//!
//! ```text
//! submit_job()
//!     │
//!     ▼
//! DependencyGraph.add_edge() ──► ready? ──► PriorityQueue.push()
//!     │                                           │
//!     ▼                                           ▼
//! Store.put_job()                         Dispatcher.dispatch_once()
//!                                                  │
//!                                   WorkerRegistry.select_candidates()
//!                                                  │
//!                                   WorkerRegistry.reserve() + Store.issue_lease()
//!                                                  │
//!                                                  ▼
//!                                            worker executes
//!                                                  │
//!                                report_outcome() ◄┘
//!                                     │
//!                     FailureHandler.handle() (on failure)
//!                                     │
//!                     DependencyGraph.on_job_terminal() cascades readiness
//! ```
//!
//! ## Guarantees
//!
//! - Admission is all-or-nothing: a job and every dependency edge it names
//!   commit together, or none do.
//! - A job is dispatched to at most one worker at a time; a lease is the sole
//!   source of truth for "who owns this job right now".
//! - The engine never leaks an opaque error: every fallible operation
//!   returns a [`error::SchedulerError`] whose variants line up with
//!   Validation / Transient / Fatal handling.
//!
//! ## What this is not
//!
//! `scheduler-core` is **not**:
//! - A distributed consensus system — a single engine instance owns the
//!   graph, queue and registry; horizontal scaling is a `Store`-level
//!   concern.
//! - A workflow/saga engine — dependency edges express "must this finish
//!   first", not branching business logic.
//! - A task execution runtime — workers pull leases and report outcomes;
//!   this crate never runs job payloads itself.

pub mod clock;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod failure;
pub mod graph;
pub mod macros;
pub mod model;
pub mod observer;
pub mod queue;
pub mod registry;
pub mod store;

pub use crate::core::{
    JobFilter, Page, PrioritySubmissionHook, RecoverySeed, SchedulerCore, SchedulerStats,
};
pub use crate::error::{ErrorCategory, Result, SchedulerError, StoreError, StoreResult};
pub use crate::model::{
    Dependency, DependencyKind, DlqEntry, HistoryEntry, IntoPayload, Job, JobId, JobSpec,
    JobStatus, Lease, LeaseId, Outcome, PriorityBand, Worker, WorkerId, WorkerSpec, WorkerStatus,
};
pub use crate::observer::{NullObserver, Observer, SchedulerEvent, TracingObserver};
pub use crate::store::{DependencyDirection, Store};
