//! Typed error taxonomy for the engine's public surface.
//!
//! The engine never leaks an opaque/boxed error to a caller. Every fallible
//! operation returns a [`SchedulerError`] (or a [`StoreError`] at the storage
//! boundary) whose variants line up with spec §7's Validation / Conflict /
//! Transient / Fatal kinds, so callers can match rather than parse strings.

use crate::model::{JobId, LeaseId, WorkerId};
use thiserror::Error;

/// Failures surfaced by a [`crate::store::Store`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no such record")]
    NotFound,
    /// CAS mismatch: the caller's expected state was stale.
    #[error("conflicting concurrent update")]
    Conflict,
    /// Transient backend failure; the caller may retry with backoff.
    #[error("store temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate record")]
    Duplicate,
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// The engine's public error type, returned from [`crate::core::SchedulerCore`]'s
/// API and from internal components as appropriate.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    // --- Validation: reported synchronously, never retried ---
    #[error("job {0} not found")]
    UnknownJob(JobId),
    #[error("worker {0} not found")]
    UnknownWorker(WorkerId),
    #[error("lease {0} not found")]
    UnknownLease(LeaseId),
    #[error("adding this dependency would introduce a cycle")]
    Cycle,
    #[error("dependency already exists")]
    Duplicate,
    #[error("job {0} already exists")]
    DuplicateJob(JobId),
    #[error("dependency can never be satisfied")]
    Unsatisfiable,
    #[error("dependency references an unknown job")]
    UnknownDependency,
    #[error("job {0} is already in a terminal state")]
    AlreadyTerminal(JobId),
    #[error("outcome for lease {0} was already reported")]
    AlreadyReported(LeaseId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("worker {0} has active leases; pass force=true to deregister anyway")]
    WorkerHasActiveLeases(WorkerId),
    #[error("no dead-letter entry for job {0}")]
    UnknownDlqEntry(JobId),

    // --- Transient: retried internally, surfaced only on exhaustion ---
    #[error("operation timed out after internal retries")]
    Timeout,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    // --- Fatal: halts admission ---
    #[error("dependency graph invariant violated: {0}")]
    GraphCorrupted(String),
    #[error("storage corruption detected: {0}")]
    StorageCorrupted(String),
}

impl SchedulerError {
    /// Coarse error category, for metrics/logging without matching every variant.
    pub fn category(&self) -> ErrorCategory {
        match self {
            SchedulerError::UnknownJob(_)
            | SchedulerError::UnknownWorker(_)
            | SchedulerError::UnknownLease(_)
            | SchedulerError::Cycle
            | SchedulerError::Duplicate
            | SchedulerError::DuplicateJob(_)
            | SchedulerError::Unsatisfiable
            | SchedulerError::UnknownDependency
            | SchedulerError::AlreadyTerminal(_)
            | SchedulerError::AlreadyReported(_)
            | SchedulerError::InvalidArgument(_)
            | SchedulerError::WorkerHasActiveLeases(_)
            | SchedulerError::UnknownDlqEntry(_) => ErrorCategory::Validation,

            SchedulerError::Timeout | SchedulerError::StoreUnavailable(_) => {
                ErrorCategory::Transient
            }

            SchedulerError::GraphCorrupted(_) | SchedulerError::StorageCorrupted(_) => {
                ErrorCategory::Fatal
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Conflict,
    Transient,
    Fatal,
}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => SchedulerError::InvalidArgument("not found".into()),
            StoreError::Conflict => SchedulerError::Timeout,
            StoreError::Unavailable(msg) => SchedulerError::StoreUnavailable(msg),
            StoreError::Duplicate => SchedulerError::Duplicate,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
