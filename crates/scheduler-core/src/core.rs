//! Ties the engine together and exposes its public API (spec §4.7).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::dispatch::{DispatchContext, Dispatcher, JobLookup};
use crate::error::{Result, SchedulerError};
use crate::failure::{default_retryable_predicate, FailureDisposition, FailureHandler, FailurePolicy, FailureReason};
use crate::graph::{AddEdgeOutcome, DependencyGraph};
use crate::model::{
    Dependency, DependencyKind, DlqEntry, Job, JobId, JobSpec, JobStatus, Outcome, PriorityBand,
    Worker, WorkerId, WorkerSpec, WorkerStatus,
};
use crate::observer::{Observer, SchedulerEvent};
use crate::queue::PriorityQueue;
use crate::registry::WorkerRegistry;
use crate::store::Store;

/// A pre-submission hook that may adjust a job's priority band before it is
/// admitted. The spec's priority-inheritance idea (children boosted by max
/// parent priority) is deliberately not built into the core's scoring
/// formula; a deployment that wants it implements this trait instead.
pub trait PrioritySubmissionHook: Send + Sync {
    fn adjust(&self, spec: &JobSpec, parents: &[(JobId, DependencyKind)]) -> PriorityBand;
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub pending: u64,
    pub ready: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dead_lettered: u64,
    pub queue_len: u64,
    pub worker_count: u64,
}

/// In-memory mirror of jobs, shared between `SchedulerCore` and the
/// `Dispatcher` (which only needs the slice of fields in [`DispatchContext`]).
#[derive(Debug, Default)]
struct JobCache {
    jobs: DashMap<JobId, Job>,
}

#[async_trait::async_trait]
impl JobLookup for JobCache {
    async fn lookup(&self, job_id: JobId) -> Option<DispatchContext> {
        self.jobs.get(&job_id).map(|j| DispatchContext {
            job_id: j.id,
            priority: j.priority,
            capabilities: j.capabilities.clone(),
            estimated_duration_secs: j.estimated_duration_secs,
            attempt: j.attempt_count,
        })
    }
}

pub struct SchedulerCore<S: Store + 'static> {
    store: Arc<S>,
    graph: Arc<DependencyGraph>,
    queue: Arc<PriorityQueue>,
    registry: Arc<WorkerRegistry>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn Observer>,
    config: SchedulerConfig,
    jobs: Arc<JobCache>,
    dispatcher: Arc<Dispatcher<S, JobCache>>,
    priority_hook: Option<Arc<dyn PrioritySubmissionHook>>,
    cancel: CancellationToken,
}

impl<S: Store + 'static> SchedulerCore<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, observer: Arc<dyn Observer>, config: SchedulerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SchedulerError::InvalidArgument(e.to_string()))?;

        let graph = Arc::new(DependencyGraph::with_max_depth(config.dependency_max_depth));
        let queue = Arc::new(PriorityQueue::new());
        let registry = Arc::new(WorkerRegistry::with_weights(config.candidate_weights));
        let jobs = Arc::new(JobCache::default());

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            jobs.clone(),
            clock.clone(),
            observer.clone(),
            config.clone(),
        ));

        Ok(Self {
            store,
            graph,
            queue,
            registry,
            clock,
            observer,
            config,
            jobs,
            dispatcher,
            priority_hook: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_priority_hook(mut self, hook: Arc<dyn PrioritySubmissionHook>) -> Self {
        self.priority_hook = Some(hook);
        self
    }

    fn score_for(&self, job: &Job) -> i64 {
        self.config.score_params().score(
            job.priority,
            job.created_at,
            job.scheduled_at,
            job.attempt_count,
            self.clock.now(),
        )
    }

    fn emit_history(&self, job_id: Option<JobId>, worker_id: Option<WorkerId>, event: &SchedulerEvent) {
        self.observer.emit(event);
        // History append is best-effort from the perspective of the
        // in-memory API call: if the Store is briefly unavailable, the
        // in-memory state has already moved and the caller should not be
        // blocked retrying an audit write. The outbox relay and periodic
        // reconciliation are responsible for durability of observability
        // data, not of scheduling decisions.
        let store = self.store.clone();
        let entry = crate::model::HistoryEntry {
            timestamp: self.clock.now(),
            actor: "scheduler-core".to_string(),
            job_id,
            worker_id,
            event_kind: event.kind().to_string(),
            details: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
        };
        tokio::spawn(async move {
            let _ = store.append_history(entry).await;
        });
    }

    // ---- Submission & dependency admin --------------------------------

    /// All-or-nothing: either the job and every requested dependency edge
    /// commit, or none do (spec §4.7).
    pub async fn submit_job(&self, mut spec: JobSpec, parents: Vec<(JobId, DependencyKind)>) -> Result<JobId> {
        if let Some(hook) = &self.priority_hook {
            spec.priority = hook.adjust(&spec, &parents);
        }

        let now = self.clock.now();
        let job = Job::new(
            spec.name,
            spec.payload,
            spec.priority,
            spec.capabilities,
            spec.max_attempts,
            spec.scheduled_at,
            spec.estimated_duration_secs,
            now,
        );
        let job_id = job.id;
        self.graph.register_job(job_id);

        let mut added_edges: Vec<(JobId, JobId)> = Vec::new();
        for (parent, kind) in &parents {
            if !self.graph.is_known(*parent) {
                self.rollback_submission(job_id, &added_edges);
                return Err(SchedulerError::UnknownDependency);
            }
            match self.graph.add_edge(*parent, job_id, *kind) {
                AddEdgeOutcome::Ok => added_edges.push((*parent, job_id)),
                AddEdgeOutcome::Cycle => {
                    self.rollback_submission(job_id, &added_edges);
                    return Err(SchedulerError::Cycle);
                }
                AddEdgeOutcome::UnknownJob => {
                    self.rollback_submission(job_id, &added_edges);
                    return Err(SchedulerError::UnknownDependency);
                }
                AddEdgeOutcome::Duplicate => {
                    self.rollback_submission(job_id, &added_edges);
                    return Err(SchedulerError::Duplicate);
                }
                AddEdgeOutcome::Unsatisfiable => {
                    self.rollback_submission(job_id, &added_edges);
                    return Err(SchedulerError::Unsatisfiable);
                }
            }
        }

        let is_ready = self.graph.unsatisfied_count(job_id) == 0;
        let mut job = job;
        job.status = if is_ready { JobStatus::Ready } else { JobStatus::Pending };

        if let Err(e) = self.store.put_job(&job).await {
            self.rollback_submission(job_id, &added_edges);
            return Err(e.into());
        }
        for (parent, kind) in &parents {
            let dep = Dependency { parent: *parent, child: job_id, kind: *kind };
            if let Err(e) = self.store.add_dependency(dep).await {
                self.rollback_submission(job_id, &added_edges);
                return Err(e.into());
            }
        }

        self.jobs.jobs.insert(job_id, job.clone());
        self.emit_history(Some(job_id), None, &SchedulerEvent::JobSubmitted { job_id });

        if is_ready {
            self.queue.push(job_id, self.score_for(&job));
            self.emit_history(Some(job_id), None, &SchedulerEvent::JobReady { job_id });
            self.dispatcher.wake();
        }

        Ok(job_id)
    }

    fn rollback_submission(&self, job_id: JobId, added_edges: &[(JobId, JobId)]) {
        for (parent, child) in added_edges {
            self.graph.remove_edge(*parent, *child);
        }
        self.graph.unregister_job(job_id);
    }

    pub async fn add_dependency(&self, parent: JobId, child: JobId, kind: DependencyKind) -> Result<()> {
        if !self.graph.is_known(parent) || !self.graph.is_known(child) {
            return Err(SchedulerError::UnknownJob(if self.graph.is_known(parent) { child } else { parent }));
        }
        match self.graph.add_edge(parent, child, kind) {
            AddEdgeOutcome::Ok => {}
            AddEdgeOutcome::Cycle => return Err(SchedulerError::Cycle),
            AddEdgeOutcome::UnknownJob => return Err(SchedulerError::UnknownDependency),
            AddEdgeOutcome::Duplicate => return Err(SchedulerError::Duplicate),
            AddEdgeOutcome::Unsatisfiable => return Err(SchedulerError::Unsatisfiable),
        }

        self.store
            .add_dependency(Dependency { parent, child, kind })
            .await
            .map_err(|e| {
                self.graph.remove_edge(parent, child);
                e
            })?;

        // If the child was Ready/in-queue and this new edge now blocks it,
        // demote it back to Pending (invariant 2/3).
        if self.graph.unsatisfied_count(child) > 0 {
            if let Some(mut job) = self.jobs.jobs.get_mut(&child) {
                if job.status == JobStatus::Ready {
                    job.status = JobStatus::Pending;
                    self.queue.remove(child);
                    if let Err(e) = self
                        .store
                        .update_job_status(child, JobStatus::Ready, JobStatus::Pending)
                        .await
                    {
                        tracing::error!(error = %e, job_id = %child, "failed to persist Ready->Pending demotion after late dependency");
                    }
                }
            }
        }

        Ok(())
    }

    // ---- Cancellation ---------------------------------------------------

    pub async fn cancel_job(&self, id: JobId) -> Result<()> {
        let mut job = self
            .jobs
            .jobs
            .get(&id)
            .map(|j| j.clone())
            .ok_or(SchedulerError::UnknownJob(id))?;

        if job.status.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(id));
        }

        let previous = job.status;
        // Running jobs are only considered Cancelled once the worker reports
        // back or the lease expires (spec §4.7); for Pending/Ready jobs we
        // can cancel immediately since no worker holds a lease.
        if previous == JobStatus::Running {
            // Best-effort signal; the actual transition happens in
            // `report_outcome`/the stuck-job sweep once the lease resolves.
            // We still record the request so a subsequent outcome report
            // knows to finalize as Cancelled rather than Completed/Failed.
            self.jobs.jobs.alter(&id, |_, mut j| {
                j.last_error = Some("cancel-requested".to_string());
                j
            });
            return Ok(());
        }

        self.store
            .update_job_status(id, previous, JobStatus::Cancelled)
            .await?;
        if previous == JobStatus::Ready {
            self.queue.remove(id);
        }
        job.status = JobStatus::Cancelled;
        self.jobs.jobs.insert(id, job);
        self.propagate_terminal(id, JobStatus::Cancelled).await;
        self.emit_history(Some(id), None, &SchedulerEvent::JobCancelled { job_id: id });
        Ok(())
    }

    // ---- Queries ----------------------------------------------------------

    pub fn get_job(&self, id: JobId) -> Result<Job> {
        self.jobs.jobs.get(&id).map(|j| j.clone()).ok_or(SchedulerError::UnknownJob(id))
    }

    pub fn list_jobs(&self, filter: JobFilter, page: Page) -> Vec<Job> {
        let mut matching: Vec<Job> = self
            .jobs
            .jobs
            .iter()
            .filter(|e| filter.status.map(|s| s == e.value().status).unwrap_or(true))
            .map(|e| e.value().clone())
            .collect();
        matching.sort_by_key(|j| j.created_at);
        let limit = if page.limit == 0 { matching.len() } else { page.limit };
        matching.into_iter().skip(page.offset).take(limit).collect()
    }

    pub fn get_stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            queue_len: self.queue.len() as u64,
            worker_count: self.registry.len() as u64,
            ..Default::default()
        };
        for entry in self.jobs.jobs.iter() {
            match entry.value().status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Ready => stats.ready += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }
        stats
    }

    // ---- Workers ------------------------------------------------------

    pub async fn register_worker(&self, spec: WorkerSpec) -> Result<u64> {
        let now = self.clock.now();
        let id = spec.id.clone();
        let worker = self.store.put_worker(spec.clone(), now).await?;
        let epoch = self.registry.register(spec, now);
        debug_assert_eq!(worker.epoch, epoch);
        self.emit_history(None, Some(id.clone()), &SchedulerEvent::WorkerRegistered { worker_id: id, epoch });
        self.dispatcher.wake();
        Ok(epoch)
    }

    pub async fn heartbeat(&self, worker_id: &WorkerId) -> Result<()> {
        let now = self.clock.now();
        self.store.update_worker_heartbeat(worker_id, now).await?;
        if self.registry.heartbeat(worker_id, now) {
            Ok(())
        } else {
            Err(SchedulerError::UnknownWorker(worker_id.clone()))
        }
    }

    pub async fn deregister_worker(&self, worker_id: &WorkerId, force: bool) -> Result<()> {
        match self.registry.deregister(worker_id, force) {
            Ok(surrendered) => {
                for job_id in surrendered {
                    self.surrender_job(job_id, FailureReason::WorkerDead).await;
                }
                Ok(())
            }
            Err(crate::registry::ReserveError::WorkerNotFound) => Err(SchedulerError::UnknownWorker(worker_id.clone())),
            Err(_) => Err(SchedulerError::WorkerHasActiveLeases(worker_id.clone())),
        }
    }

    // ---- Outcomes & failure handling ------------------------------------

    pub async fn report_outcome(&self, lease_id: crate::model::LeaseId, outcome: Outcome) -> Result<()> {
        let job = self
            .store
            .complete_lease(lease_id, outcome.clone())
            .await
            .map_err(|e| match e {
                crate::error::StoreError::NotFound => SchedulerError::UnknownLease(lease_id),
                crate::error::StoreError::Duplicate => SchedulerError::AlreadyReported(lease_id),
                other => other.into(),
            })?;

        self.jobs.jobs.insert(job.id, job.clone());

        match outcome {
            Outcome::Completed => self.finish_job(job, JobStatus::Completed).await,
            Outcome::Cancelled => self.finish_job(job, JobStatus::Cancelled).await,
            Outcome::Failed { error, retryable } => {
                self.fail_job(job, FailureReason::ReportedError { error, retryable }).await
            }
        }
        Ok(())
    }

    async fn finish_job(&self, mut job: Job, terminal: JobStatus) {
        job.status = terminal;
        self.jobs.jobs.insert(job.id, job.clone());
        match terminal {
            JobStatus::Completed => {
                self.emit_history(Some(job.id), None, &SchedulerEvent::JobCompleted { job_id: job.id });
            }
            JobStatus::Cancelled => {
                self.emit_history(Some(job.id), None, &SchedulerEvent::JobCancelled { job_id: job.id });
            }
            _ => {}
        }
        self.propagate_terminal(job.id, terminal).await;
        self.dispatcher.wake();
    }

    async fn fail_job(&self, job: Job, reason: FailureReason) {
        let mut rng = StdRng::from_entropy();
        let mut fh = FailureHandler::new(FailurePolicy::from(&self.config), &mut rng);
        let now = self.clock.now();
        let disposition = fh.handle(&job, reason.clone(), now, &default_retryable_predicate);
        drop(fh);

        match disposition {
            FailureDisposition::RetryAt { run_at, attempt } => {
                let mut retried = job.clone();
                retried.attempt_count = attempt;
                retried.scheduled_at = Some(run_at);
                retried.status = JobStatus::Ready;
                retried.last_error = Some(format_reason(&reason));
                if let Err(e) = self
                    .store
                    .update_job_status(job.id, JobStatus::Running, JobStatus::Ready)
                    .await
                {
                    tracing::error!(error = %e, job_id = %job.id, "failed to persist Running->Ready retry transition");
                }
                self.jobs.jobs.insert(job.id, retried.clone());
                self.queue.push(job.id, self.score_for(&retried));
                self.emit_history(
                    Some(job.id),
                    None,
                    &SchedulerEvent::JobFailed {
                        job_id: job.id,
                        error: format_reason(&reason),
                        retryable: true,
                    },
                );
                self.dispatcher.wake();
            }
            FailureDisposition::DeadLetter { entry } => {
                if let Err(e) = self.store.put_dlq(entry.clone()).await {
                    tracing::error!(error = %e, job_id = %job.id, "failed to persist DLQ entry; leaving job Running rather than declaring it dead-lettered without a DLQ record");
                    return;
                }
                if let Err(e) = self
                    .store
                    .update_job_status(job.id, JobStatus::Running, JobStatus::DeadLettered)
                    .await
                {
                    tracing::error!(error = %e, job_id = %job.id, "DLQ entry persisted but status transition to DeadLettered failed; rolling back DLQ entry");
                    if let Err(e) = self.store.remove_dlq(job.id).await {
                        tracing::error!(error = %e, job_id = %job.id, "failed to roll back orphaned DLQ entry");
                    }
                    return;
                }
                let mut dead = job.clone();
                dead.status = JobStatus::DeadLettered;
                dead.last_error = Some(entry.final_error.clone());
                self.jobs.jobs.insert(job.id, dead);
                self.emit_history(
                    Some(job.id),
                    None,
                    &SchedulerEvent::JobDeadLettered { job_id: job.id, error: entry.final_error },
                );
                self.propagate_terminal(job.id, JobStatus::DeadLettered).await;
            }
            FailureDisposition::Cancel => {
                self.finish_job(job, JobStatus::Cancelled).await;
            }
        }
    }

    /// Surrender a job that was in flight on a worker that is gone, routing
    /// it through the same failure pipeline as an explicit failure report.
    async fn surrender_job(&self, job_id: JobId, reason: FailureReason) {
        if let Some(job) = self.jobs.jobs.get(&job_id).map(|j| j.clone()) {
            if job.status == JobStatus::Running {
                self.fail_job(job, reason).await;
            }
        }
    }

    /// Boxed manually (rather than as a plain `async fn`) because it calls
    /// itself to cascade cancellation through a chain of unsatisfiable
    /// dependents — an `async fn` can't recurse into itself without this.
    fn propagate_terminal<'a>(
        &'a self,
        job_id: JobId,
        terminal: JobStatus,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let (newly_ready, newly_unsatisfiable) = self.graph.on_job_terminal(job_id, terminal);

            for ready_id in newly_ready {
                if let Some(mut job) = self.jobs.jobs.get_mut(&ready_id) {
                    if job.status == JobStatus::Pending {
                        job.status = JobStatus::Ready;
                        let score = self.score_for(&job);
                        if let Err(e) = self
                            .store
                            .update_job_status(ready_id, JobStatus::Pending, JobStatus::Ready)
                            .await
                        {
                            tracing::error!(error = %e, job_id = %ready_id, "failed to persist Pending->Ready transition during terminal propagation");
                        }
                        self.queue.push(ready_id, score);
                        self.emit_history(Some(ready_id), None, &SchedulerEvent::JobReady { job_id: ready_id });
                    }
                }
            }

            for unsat_id in newly_unsatisfiable {
                if let Some(job) = self.jobs.jobs.get(&unsat_id).map(|j| j.clone()) {
                    if !job.status.is_terminal() {
                        if let Err(e) = self
                            .store
                            .update_job_status(unsat_id, job.status, JobStatus::Cancelled)
                            .await
                        {
                            tracing::error!(error = %e, job_id = %unsat_id, "failed to persist Cancelled transition for job with unsatisfiable dependency");
                        }
                        self.queue.remove(unsat_id);
                        self.jobs.jobs.alter(&unsat_id, |_, mut j| {
                            j.status = JobStatus::Cancelled;
                            j
                        });
                        self.emit_history(Some(unsat_id), None, &SchedulerEvent::JobCancelled { job_id: unsat_id });
                        self.propagate_terminal(unsat_id, JobStatus::Cancelled).await;
                    }
                }
            }

            self.dispatcher.wake();
        })
    }

    // ---- Background loops & recovery -----------------------------------

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn run_dispatch_loop(&self) {
        self.dispatcher.run(self.cancel.clone()).await;
    }

    /// Health monitor loop (spec §4.4): periodically sweeps worker
    /// heartbeats and surrenders leases held by newly-dead workers.
    pub async fn run_health_monitor(&self) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let now = self.clock.now();
            let unreachable_cutoff =
                now - chrono::Duration::from_std(self.config.heartbeat_timeout).unwrap_or_else(|_| chrono::Duration::zero());
            let dead_cutoff =
                now - chrono::Duration::from_std(self.config.worker_dead_threshold).unwrap_or_else(|_| chrono::Duration::zero());
            let (newly_unreachable, newly_dead) = self.registry.sweep_health(unreachable_cutoff, dead_cutoff);
            for worker_id in newly_unreachable {
                self.emit_history(None, Some(worker_id.clone()), &SchedulerEvent::WorkerUnreachable { worker_id: worker_id.clone() });
                if let Err(e) = self
                    .store
                    .update_worker_status(&worker_id, WorkerStatus::Active, WorkerStatus::Unreachable)
                    .await
                {
                    tracing::error!(error = %e, worker_id = %worker_id, "failed to persist Active->Unreachable transition");
                }
            }
            for (worker_id, jobs) in newly_dead {
                self.emit_history(None, Some(worker_id.clone()), &SchedulerEvent::WorkerDead { worker_id: worker_id.clone() });
                if let Err(e) = self
                    .store
                    .update_worker_status(&worker_id, WorkerStatus::Unreachable, WorkerStatus::Dead)
                    .await
                {
                    tracing::error!(error = %e, worker_id = %worker_id, "failed to persist Unreachable->Dead transition");
                }
                for job_id in jobs {
                    self.surrender_job(job_id, FailureReason::WorkerDead).await;
                }
            }
        }
    }

    /// Stuck-job sweep (spec §4.6): Running jobs whose lease deadline has
    /// passed without an outcome are treated as failed with reason
    /// "lease-expired".
    pub async fn run_stuck_job_sweep(&self) {
        let mut interval = tokio::time::interval(self.config.stuck_job_sweep_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let now = self.clock.now();
            if let Ok(leases) = self.store.list_active_leases().await {
                for lease in leases {
                    if lease.deadline < now {
                        self.surrender_job(lease.job_id, FailureReason::LeaseExpired).await;
                    }
                }
            }
        }
    }

    /// Startup recovery (spec §4.7): rebuild in-memory state from the Store
    /// and reconcile Running jobs against their leases.
    pub async fn recover(&self) -> Result<()> {
        self.recover_seeded(None).await
    }

    /// Same as [`Self::recover`], but when `seed` carries a non-empty
    /// dependency/worker set (loaded from a persistence snapshot, spec §4.9)
    /// it rebuilds the dependency graph and worker registry from the seed
    /// instead of scanning the Store's dependency and worker tables — the
    /// part of recovery that scales with history rather than active-job
    /// count. Job status is always re-read from the Store regardless of the
    /// seed, since a stale snapshot must never resurrect a job that has since
    /// reached a different terminal state.
    pub async fn recover_seeded(&self, seed: Option<RecoverySeed>) -> Result<()> {
        let jobs = self.store.list_active_jobs().await?;
        for job in &jobs {
            self.graph.register_job(job.id);
        }
        for job in &jobs {
            if job.status.is_terminal() {
                self.graph.mark_terminal_no_edges(job.id, job.status);
            }
        }

        match seed.filter(|s| !s.dependencies.is_empty() || !s.workers.is_empty()) {
            Some(seed) => {
                tracing::info!(
                    dependencies = seed.dependencies.len(),
                    workers = seed.workers.len(),
                    "seeding dependency graph and worker registry from persistence snapshot"
                );
                for dep in seed.dependencies {
                    self.graph.add_edge(dep.parent, dep.child, dep.kind);
                }
                for worker in seed.workers {
                    self.registry.restore(worker);
                }
            }
            None => {
                let deps = self.store.list_all_dependencies().await?;
                for dep in deps {
                    self.graph.add_edge(dep.parent, dep.child, dep.kind);
                }
                let workers = self.store.list_workers().await?;
                for worker in workers {
                    self.registry.restore(worker);
                }
            }
        }

        self.graph
            .validate_acyclic()
            .map_err(|job_id| SchedulerError::GraphCorrupted(format!("cycle detected at job {job_id}")))?;

        for job in jobs {
            let id = job.id;
            let status = job.status;
            self.jobs.jobs.insert(id, job);
            if status == JobStatus::Ready {
                if let Some(job) = self.jobs.jobs.get(&id) {
                    self.queue.push(id, self.score_for(&job));
                }
            }
        }

        let now = self.clock.now();
        let leases = self.store.list_active_leases().await?;
        for lease in leases {
            let worker_present = self.registry.get(&lease.worker_id).is_some();
            if !worker_present || lease.deadline < now {
                self.surrender_job(lease.job_id, FailureReason::LeaseOrphaned).await;
            }
        }

        Ok(())
    }

    // ---- Dead-letter queue ---------------------------------------------

    /// List dead-lettered jobs, most recently dead-lettered first (spec
    /// §4.6 `ListDLQ`). A `page.limit` of 0 defaults to 100 rather than
    /// meaning "all", since an unbounded DLQ scan is unbounded query cost.
    pub async fn list_dlq(&self, page: Page) -> Result<Vec<DlqEntry>> {
        let limit = if page.limit == 0 { 100 } else { page.limit };
        Ok(self.store.list_dlq(page.offset, limit).await?)
    }

    /// Re-admit a dead-lettered job to the ready queue (spec §4.6 `Retry`).
    /// With `reset_attempts`, the job's attempt counter returns to zero, as
    /// the round-trip law in spec §8 requires; otherwise it resumes at its
    /// attempt count when it was dead-lettered, so a caller that wants
    /// further retries out of it must also raise `max_attempts`.
    pub async fn retry_dlq(&self, job_id: JobId, reset_attempts: bool) -> Result<()> {
        self.store.get_dlq(job_id).await.map_err(|e| match e {
            crate::error::StoreError::NotFound => SchedulerError::UnknownDlqEntry(job_id),
            other => other.into(),
        })?;

        let mut job = self.store.get_job(job_id).await?;
        if job.status != JobStatus::DeadLettered {
            return Err(SchedulerError::InvalidArgument(format!(
                "job {job_id} is not dead-lettered"
            )));
        }

        self.store
            .update_job_status(job_id, JobStatus::DeadLettered, JobStatus::Ready)
            .await?;

        job.status = JobStatus::Ready;
        job.last_error = None;
        if reset_attempts {
            job.attempt_count = 0;
        }

        self.jobs.jobs.insert(job_id, job.clone());
        self.queue.push(job_id, self.score_for(&job));

        if let Err(e) = self.store.remove_dlq(job_id).await {
            tracing::error!(error = %e, %job_id, "job retried but its DLQ entry could not be removed; it will reappear in ListDLQ");
        }

        self.emit_history(Some(job_id), None, &SchedulerEvent::JobReady { job_id });
        self.dispatcher.wake();
        Ok(())
    }

    /// Permanently discard a dead-lettered job's DLQ entry (spec §4.6
    /// `Discard`). The job record itself stays DeadLettered and queryable via
    /// `get_job` — only the DLQ entry is removed.
    pub async fn discard_dlq(&self, job_id: JobId) -> Result<()> {
        self.store.get_dlq(job_id).await.map_err(|e| match e {
            crate::error::StoreError::NotFound => SchedulerError::UnknownDlqEntry(job_id),
            other => other.into(),
        })?;
        self.store.remove_dlq(job_id).await?;
        Ok(())
    }

    /// DLQ retention sweep (spec §4.6 / §5): periodically discards entries
    /// older than `dlq_retention`. Reuses the stuck-job sweep's tick interval
    /// rather than adding a dedicated config knob for a sweep this cheap.
    pub async fn run_dlq_cleanup(&self) {
        const SWEEP_LIMIT: usize = 10_000;
        let mut interval = tokio::time::interval(self.config.stuck_job_sweep_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let now = self.clock.now();
            let cutoff =
                now - chrono::Duration::from_std(self.config.dlq_retention).unwrap_or_else(|_| chrono::Duration::zero());

            let entries = match self.store.list_dlq(0, SWEEP_LIMIT).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, "dlq cleanup: failed to list entries");
                    continue;
                }
            };
            for entry in entries {
                if entry.dead_lettered_at < cutoff {
                    match self.store.remove_dlq(entry.job_id).await {
                        Ok(()) => tracing::debug!(job_id = %entry.job_id, "dlq cleanup: discarded expired entry"),
                        Err(e) => tracing::warn!(error = %e, job_id = %entry.job_id, "dlq cleanup: failed to remove expired entry"),
                    }
                }
            }
        }
    }
}

/// Persistence-agnostic seed for [`SchedulerCore::recover_seeded`]. Lives
/// here rather than in `scheduler-persistence` because that crate depends on
/// this one, not the other way around: `scheduler-persistence` converts its
/// `EngineSnapshot` into this shape before calling `recover_seeded`.
#[derive(Debug, Clone, Default)]
pub struct RecoverySeed {
    pub dependencies: Vec<Dependency>,
    pub workers: Vec<Worker>,
}

fn format_reason(reason: &FailureReason) -> String {
    match reason {
        FailureReason::ReportedError { error, .. } => error.clone(),
        FailureReason::LeaseExpired => "lease-expired".to_string(),
        FailureReason::WorkerDead => "worker-dead".to_string(),
        FailureReason::LeaseOrphaned => "lease-orphaned".to_string(),
        FailureReason::Cancelled => "cancelled".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use scheduler_testing::{InMemoryStore, ManualClock};

    fn sample_job(max_attempts: u32) -> Job {
        Job::new(
            "job",
            serde_json::json!({}),
            PriorityBand::Normal,
            Default::default(),
            max_attempts,
            None,
            None,
            Utc::now(),
        )
    }

    fn worker_spec(id: &str) -> WorkerSpec {
        WorkerSpec {
            id: id.to_string(),
            locator: format!("locator:{id}"),
            capabilities: Default::default(),
            max_slots: 2,
            reserved_high_priority_slots: 0,
            load_factor: 1.0,
            priority_threshold: PriorityBand::Low,
        }
    }

    /// Wraps an [`InMemoryStore`] to inject failures on specific calls, so
    /// the error-handling paths that only run when the Store misbehaves
    /// (rather than every other unit test's happy path) can be exercised.
    struct FaultyStore {
        inner: InMemoryStore,
        fail_put_dlq: AtomicBool,
        fail_dead_letter_transition: AtomicBool,
        remove_dlq_calls: AtomicUsize,
    }

    impl FaultyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::new(),
                fail_put_dlq: AtomicBool::new(false),
                fail_dead_letter_transition: AtomicBool::new(false),
                remove_dlq_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Store for FaultyStore {
        async fn put_job(&self, job: &Job) -> crate::error::StoreResult<()> {
            self.inner.put_job(job).await
        }

        async fn get_job(&self, id: JobId) -> crate::error::StoreResult<Job> {
            self.inner.get_job(id).await
        }

        async fn list_active_jobs(&self) -> crate::error::StoreResult<Vec<Job>> {
            self.inner.list_active_jobs().await
        }

        async fn update_job_status(&self, id: JobId, expected: JobStatus, new: JobStatus) -> crate::error::StoreResult<()> {
            if new == JobStatus::DeadLettered && self.fail_dead_letter_transition.load(Ordering::SeqCst) {
                return Err(crate::error::StoreError::Unavailable("injected".into()));
            }
            self.inner.update_job_status(id, expected, new).await
        }

        async fn add_dependency(&self, dep: Dependency) -> crate::error::StoreResult<()> {
            self.inner.add_dependency(dep).await
        }

        async fn remove_dependency(&self, parent: JobId, child: JobId) -> crate::error::StoreResult<()> {
            self.inner.remove_dependency(parent, child).await
        }

        async fn list_dependencies(
            &self,
            job_id: JobId,
            direction: crate::store::DependencyDirection,
        ) -> crate::error::StoreResult<Vec<Dependency>> {
            self.inner.list_dependencies(job_id, direction).await
        }

        async fn list_all_dependencies(&self) -> crate::error::StoreResult<Vec<Dependency>> {
            self.inner.list_all_dependencies().await
        }

        async fn put_worker(&self, spec: WorkerSpec, now: chrono::DateTime<chrono::Utc>) -> crate::error::StoreResult<Worker> {
            self.inner.put_worker(spec, now).await
        }

        async fn get_worker(&self, id: &WorkerId) -> crate::error::StoreResult<Worker> {
            self.inner.get_worker(id).await
        }

        async fn list_workers(&self) -> crate::error::StoreResult<Vec<Worker>> {
            self.inner.list_workers().await
        }

        async fn update_worker_heartbeat(&self, id: &WorkerId, now: chrono::DateTime<chrono::Utc>) -> crate::error::StoreResult<()> {
            self.inner.update_worker_heartbeat(id, now).await
        }

        async fn update_worker_status(&self, id: &WorkerId, expected: WorkerStatus, new: WorkerStatus) -> crate::error::StoreResult<()> {
            self.inner.update_worker_status(id, expected, new).await
        }

        async fn issue_lease(
            &self,
            job_id: JobId,
            worker_id: &WorkerId,
            attempt: u32,
            issued_at: chrono::DateTime<chrono::Utc>,
            deadline: chrono::DateTime<chrono::Utc>,
        ) -> crate::error::StoreResult<crate::model::Lease> {
            self.inner.issue_lease(job_id, worker_id, attempt, issued_at, deadline).await
        }

        async fn get_active_lease(&self, job_id: JobId) -> crate::error::StoreResult<Option<crate::model::Lease>> {
            self.inner.get_active_lease(job_id).await
        }

        async fn list_active_leases(&self) -> crate::error::StoreResult<Vec<crate::model::Lease>> {
            self.inner.list_active_leases().await
        }

        async fn complete_lease(&self, lease_id: crate::model::LeaseId, outcome: Outcome) -> crate::error::StoreResult<Job> {
            self.inner.complete_lease(lease_id, outcome).await
        }

        async fn append_history(&self, entry: crate::model::HistoryEntry) -> crate::error::StoreResult<()> {
            self.inner.append_history(entry).await
        }

        async fn unrelayed_history(&self, limit: usize) -> crate::error::StoreResult<Vec<(u64, crate::model::HistoryEntry)>> {
            self.inner.unrelayed_history(limit).await
        }

        async fn mark_history_relayed(&self, sequence: u64) -> crate::error::StoreResult<()> {
            self.inner.mark_history_relayed(sequence).await
        }

        async fn put_dlq(&self, entry: DlqEntry) -> crate::error::StoreResult<()> {
            if self.fail_put_dlq.load(Ordering::SeqCst) {
                return Err(crate::error::StoreError::Unavailable("injected".into()));
            }
            self.inner.put_dlq(entry).await
        }

        async fn list_dlq(&self, offset: usize, limit: usize) -> crate::error::StoreResult<Vec<DlqEntry>> {
            self.inner.list_dlq(offset, limit).await
        }

        async fn get_dlq(&self, job_id: JobId) -> crate::error::StoreResult<DlqEntry> {
            self.inner.get_dlq(job_id).await
        }

        async fn remove_dlq(&self, job_id: JobId) -> crate::error::StoreResult<()> {
            self.remove_dlq_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.remove_dlq(job_id).await
        }
    }

    #[tokio::test]
    async fn recover_preserves_persisted_worker_epoch() {
        let store = Arc::new(InMemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let spec = worker_spec("w1");
        let now = clock.now();

        // Simulate a worker that re-registered twice in a prior incarnation
        // of the engine, before this process restarted.
        store.put_worker(spec.clone(), now).await.unwrap();
        let persisted = store.put_worker(spec.clone(), now).await.unwrap();
        assert_eq!(persisted.epoch, 1);

        let core = SchedulerCore::new(
            store.clone(),
            clock.clone(),
            Arc::new(crate::observer::NullObserver),
            SchedulerConfig::default(),
        )
        .unwrap();
        core.recover().await.unwrap();

        // A live re-registration after recovery must continue the persisted
        // epoch sequence, not restart it from 0.
        let epoch = core.register_worker(spec).await.unwrap();
        assert_eq!(epoch, 2);
    }

    #[tokio::test]
    async fn dead_letter_store_failure_leaves_job_running_in_memory() {
        let store = Arc::new(FaultyStore::new());
        store.fail_put_dlq.store(true, Ordering::SeqCst);
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let core = SchedulerCore::new(
            store.clone(),
            clock.clone(),
            Arc::new(crate::observer::NullObserver),
            SchedulerConfig::default(),
        )
        .unwrap();

        let mut job = sample_job(1);
        job.status = JobStatus::Running;
        store.put_job(&job).await.unwrap();
        core.jobs.jobs.insert(job.id, job.clone());

        core.fail_job(job.clone(), FailureReason::ReportedError { error: "boom".into(), retryable: false }).await;

        let cached = core.jobs.jobs.get(&job.id).unwrap().clone();
        assert_eq!(cached.status, JobStatus::Running);
        assert!(store.inner.get_dlq(job.id).await.is_err());
    }

    #[tokio::test]
    async fn dead_letter_status_transition_failure_rolls_back_dlq_entry() {
        let store = Arc::new(FaultyStore::new());
        store.fail_dead_letter_transition.store(true, Ordering::SeqCst);
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let core = SchedulerCore::new(
            store.clone(),
            clock.clone(),
            Arc::new(crate::observer::NullObserver),
            SchedulerConfig::default(),
        )
        .unwrap();

        let mut job = sample_job(1);
        job.status = JobStatus::Running;
        store.put_job(&job).await.unwrap();
        core.jobs.jobs.insert(job.id, job.clone());

        core.fail_job(job.clone(), FailureReason::ReportedError { error: "boom".into(), retryable: false }).await;

        let cached = core.jobs.jobs.get(&job.id).unwrap().clone();
        assert_eq!(cached.status, JobStatus::Running);
        assert_eq!(store.remove_dlq_calls.load(Ordering::SeqCst), 1);
        assert!(store.inner.get_dlq(job.id).await.is_err());
    }
}
