//! Matches ready jobs to workers and owns lease issuance (spec §4.5).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::model::{JobId, JobStatus, PriorityBand};
use crate::observer::{Observer, SchedulerEvent};
use crate::queue::PriorityQueue;
use crate::registry::{CandidateQuery, ReserveError, WorkerRegistry};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The queue was empty; nothing to do this tick.
    Idle,
    /// A job was leased to a worker.
    Dispatched { job_id: JobId, worker_id: String },
    /// No viable candidate existed; the job was requeued with a penalty.
    NoCandidate { job_id: JobId },
    /// The job was requeued after exhausting the Reserve/IssueLease retry
    /// budget for this tick.
    ReserveRaced { job_id: JobId },
}

/// Everything the dispatcher needs to know about the job it popped, without
/// pulling in the full `Job` record for every candidate lookup.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub job_id: JobId,
    pub priority: PriorityBand,
    pub capabilities: std::collections::HashSet<String>,
    pub estimated_duration_secs: Option<i64>,
    pub attempt: u32,
}

/// Looked up by the dispatcher for each popped job id; kept as a trait so
/// `SchedulerCore` can supply it from its own in-memory job cache without the
/// dispatcher depending on that cache's shape directly.
#[async_trait::async_trait]
pub trait JobLookup: Send + Sync {
    async fn lookup(&self, job_id: JobId) -> Option<DispatchContext>;
}

pub struct Dispatcher<S: Store, L: JobLookup> {
    store: Arc<S>,
    queue: Arc<PriorityQueue>,
    registry: Arc<WorkerRegistry>,
    lookup: Arc<L>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn Observer>,
    config: SchedulerConfig,
    consecutive_misses: DashMap<JobId, u32>,
    requeue_penalty: i64,
    wake: Notify,
    tick_counter: AtomicU32,
}

impl<S: Store, L: JobLookup> Dispatcher<S, L> {
    pub fn new(
        store: Arc<S>,
        queue: Arc<PriorityQueue>,
        registry: Arc<WorkerRegistry>,
        lookup: Arc<L>,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn Observer>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            lookup,
            clock,
            observer,
            config,
            consecutive_misses: DashMap::new(),
            requeue_penalty: 50,
            wake: Notify::new(),
            tick_counter: AtomicU32::new(0),
        }
    }

    /// Called whenever new work might be dispatchable (a job became ready, a
    /// worker freed a slot) to avoid waiting out the idle tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    fn lease_deadline(&self, now: DateTime<Utc>, estimated_duration_secs: Option<i64>) -> DateTime<Utc> {
        let slack = self.config.default_lease_slack;
        let estimated = estimated_duration_secs.unwrap_or(0) as f64 * slack;
        let min = self.config.min_lease.as_secs_f64();
        let max = self.config.max_lease.as_secs_f64();
        let secs = estimated.max(min).min(max);
        now + chrono::Duration::milliseconds((secs * 1000.0) as i64)
    }

    /// One bounded unit of work: pop the top job, find a candidate, attempt
    /// the Reserve+IssueLease two-phase commit with a bounded retry budget.
    pub async fn dispatch_once(&self) -> DispatchOutcome {
        let Some(job_id) = self.queue.pop() else {
            return DispatchOutcome::Idle;
        };

        let Some(ctx) = self.lookup.lookup(job_id).await else {
            // Job vanished between pop and lookup (e.g. cancelled); drop it.
            return DispatchOutcome::Idle;
        };

        let query = CandidateQuery {
            capabilities: &ctx.capabilities,
            priority: ctx.priority,
        };
        let candidates = self.registry.select_candidates(query);

        if candidates.is_empty() {
            let misses = {
                let mut entry = self.consecutive_misses.entry(job_id).or_insert(0);
                *entry += 1;
                *entry
            };
            // Requeue with a small penalty so other ready jobs get a turn.
            self.queue.push(job_id, self.requeue_score(&ctx) + self.requeue_penalty);
            if misses >= self.config.no_capacity_event_threshold {
                self.observer.emit(&SchedulerEvent::QueueBlocked {
                    job_id,
                    consecutive_misses: misses,
                });
            }
            return DispatchOutcome::NoCandidate { job_id };
        }

        let high_priority = matches!(ctx.priority, PriorityBand::High);
        let now = self.clock.now();
        let deadline = self.lease_deadline(now, ctx.estimated_duration_secs);

        for worker_id in &candidates {
            let mut attempts_left = self.config.dispatch_retry_attempts;
            while attempts_left > 0 {
                attempts_left -= 1;
                if self.registry.reserve(worker_id, job_id, high_priority).is_err() {
                    break; // try the next candidate
                }
                match self
                    .store
                    .issue_lease(job_id, worker_id, ctx.attempt + 1, now, deadline)
                    .await
                {
                    Ok(_) => {
                        self.consecutive_misses.remove(&job_id);
                        self.observer.emit(&SchedulerEvent::JobDispatched {
                            job_id,
                            worker_id: worker_id.clone(),
                            attempt: ctx.attempt + 1,
                        });
                        return DispatchOutcome::Dispatched {
                            job_id,
                            worker_id: worker_id.clone(),
                        };
                    }
                    Err(_) => {
                        self.registry.release(worker_id, job_id);
                        // Conflict: someone else raced us onto this job or
                        // worker. Retry within budget before moving on.
                        continue;
                    }
                }
            }
        }

        // Exhausted candidates/attempts; requeue for the next tick.
        self.queue.push(job_id, self.requeue_score(&ctx));
        DispatchOutcome::ReserveRaced { job_id }
    }

    fn requeue_score(&self, ctx: &DispatchContext) -> i64 {
        // Re-score from scratch rather than reusing a stale score, matching
        // spec §4.3: score is recomputed on enqueue/re-enqueue only.
        let params = self.config.score_params();
        params.score(ctx.priority, self.clock.now(), None, ctx.attempt, self.clock.now())
    }

    /// Runs until `cancel` is triggered. Ticks at `dispatch_tick_active` while
    /// there was dispatchable work last tick, `dispatch_tick_idle` otherwise,
    /// and can be woken early via [`Dispatcher::wake`].
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let outcome = self.dispatch_once().await;
            self.tick_counter.fetch_add(1, Ordering::Relaxed);

            let sleep_for = match outcome {
                DispatchOutcome::Idle => self.config.dispatch_tick_idle,
                _ => self.config.dispatch_tick_active,
            };

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    pub fn ticks(&self) -> u32 {
        self.tick_counter.load(Ordering::Relaxed)
    }
}

pub use crate::registry::ReserveError as DispatchReserveError;
