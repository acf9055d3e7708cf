//! Observability sink (spec §4.8 / §6).
//!
//! The engine never blocks on an [`Observer`]: every observable transition is
//! first appended to the Store's history log in the same transaction as the
//! state change, and relayed to whatever sink is configured by
//! `scheduler-outbox`'s relay task. `Observer` itself stays a simple
//! synchronous trait so embedding applications can plug in a metrics/log
//! forwarder without pulling in this crate's async runtime choices.

use serde::{Deserialize, Serialize};

use crate::model::{JobId, WorkerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerEvent {
    JobSubmitted { job_id: JobId },
    JobReady { job_id: JobId },
    JobDispatched { job_id: JobId, worker_id: WorkerId, attempt: u32 },
    JobCompleted { job_id: JobId },
    JobFailed { job_id: JobId, error: String, retryable: bool },
    JobDeadLettered { job_id: JobId, error: String },
    JobCancelled { job_id: JobId },
    WorkerRegistered { worker_id: WorkerId, epoch: u64 },
    WorkerUnreachable { worker_id: WorkerId },
    WorkerDead { worker_id: WorkerId },
    QueueBlocked { job_id: JobId, consecutive_misses: u32 },
}

impl SchedulerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::JobSubmitted { .. } => "job-submitted",
            SchedulerEvent::JobReady { .. } => "job-ready",
            SchedulerEvent::JobDispatched { .. } => "job-dispatched",
            SchedulerEvent::JobCompleted { .. } => "job-completed",
            SchedulerEvent::JobFailed { .. } => "job-failed",
            SchedulerEvent::JobDeadLettered { .. } => "job-dead-lettered",
            SchedulerEvent::JobCancelled { .. } => "job-cancelled",
            SchedulerEvent::WorkerRegistered { .. } => "worker-registered",
            SchedulerEvent::WorkerUnreachable { .. } => "worker-unreachable",
            SchedulerEvent::WorkerDead { .. } => "worker-dead",
            SchedulerEvent::QueueBlocked { .. } => "queue-blocked",
        }
    }
}

/// Abstract destination for scheduler events. Implementations forward to
/// metrics/log systems; the default is a no-op.
pub trait Observer: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: &SchedulerEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn emit(&self, _event: &SchedulerEvent) {}
}

/// Forwards events as structured `tracing` events, for local development and
/// as a baseline sink when no metrics backend is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn emit(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::JobFailed { job_id, error, retryable } => {
                tracing::warn!(%job_id, error, retryable, kind = event.kind(), "scheduler event");
            }
            SchedulerEvent::JobDeadLettered { job_id, error } => {
                tracing::error!(%job_id, error, kind = event.kind(), "scheduler event");
            }
            SchedulerEvent::WorkerUnreachable { worker_id } | SchedulerEvent::WorkerDead { worker_id } => {
                tracing::warn!(worker_id = %worker_id, kind = event.kind(), "scheduler event");
            }
            _ => {
                tracing::info!(kind = event.kind(), "scheduler event");
            }
        }
    }
}
