//! End-to-end scenarios A-F (spec.md §8), driven against `InMemoryStore` +
//! `ManualClock` with the real dispatch/health/sweep loops running in the
//! background exactly as `SchedulerCore` exposes them.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use scheduler_core::clock::Clock;
use scheduler_core::config::SchedulerConfig;
use scheduler_core::{
    DependencyKind, JobId, JobSpec, JobStatus, Outcome, PriorityBand, SchedulerCore, Store,
    WorkerId, WorkerStatus,
};
use scheduler_testing::{scenarios, InMemoryStore, ManualClock};

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        dispatch_tick_active: StdDuration::from_millis(5),
        dispatch_tick_idle: StdDuration::from_millis(15),
        heartbeat_interval: StdDuration::from_millis(20),
        heartbeat_timeout: StdDuration::from_millis(200),
        worker_dead_threshold: StdDuration::from_millis(400),
        stuck_job_sweep_interval: StdDuration::from_millis(20),
        retry_initial_delay: StdDuration::from_millis(1),
        retry_max_delay: StdDuration::from_millis(5),
        ..SchedulerConfig::default()
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
    core: Arc<SchedulerCore<InMemoryStore>>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let core = SchedulerCore::new(
            store.clone(),
            clock.clone() as Arc<dyn Clock>,
            Arc::new(scheduler_core::NullObserver),
            fast_config(),
        )
        .expect("fast_config is internally consistent");
        Self { store, clock, core: Arc::new(core) }
    }

    /// Runs the dispatch, health and stuck-job loops in the background for
    /// the lifetime of the test; `SchedulerCore::shutdown` stops all three.
    fn spawn_background_loops(&self) {
        let dispatch = self.core.clone();
        tokio::spawn(async move { dispatch.run_dispatch_loop().await });
        let health = self.core.clone();
        tokio::spawn(async move { health.run_health_monitor().await });
        let sweep = self.core.clone();
        tokio::spawn(async move { sweep.run_stuck_job_sweep().await });
        let dlq = self.core.clone();
        tokio::spawn(async move { dlq.run_dlq_cleanup().await });
    }

    /// Reports an outcome for whatever lease is currently active on `job_id`,
    /// the same call a worker makes after finishing its assigned job.
    async fn complete_active_lease(&self, job_id: JobId, outcome: Outcome) {
        let lease = self
            .store
            .get_active_lease(job_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("job {job_id} has no active lease"));
        self.core.report_outcome(lease.id, outcome).await.unwrap();
    }
}

async fn wait_until(mut pred: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    while !pred() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
}

async fn wait_worker_status(store: &InMemoryStore, worker_id: &WorkerId, expected: WorkerStatus, what: &str) {
    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    loop {
        let status = store.get_worker(worker_id).await.unwrap().status;
        if status == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what} (last status: {status:?})");
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn scenario_a_linear_chain_succeeds() {
    let h = Harness::new();
    h.spawn_background_loops();

    let [j1_spec, j2_spec, j3_spec] = scenarios::linear_chain(["j1", "j2", "j3"]);
    let j1 = h.core.submit_job(j1_spec, vec![]).await.unwrap();
    let j2 = h.core.submit_job(j2_spec, vec![(j1, DependencyKind::MustComplete)]).await.unwrap();
    let j3 = h.core.submit_job(j3_spec, vec![(j2, DependencyKind::MustComplete)]).await.unwrap();

    h.core.register_worker(scenarios::worker_spec("w1", &[], 1)).await.unwrap();

    // J2/J3 start out Pending; only J1 is Ready and can dispatch first.
    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::Running, "j1 running").await;
    assert_eq!(h.core.get_job(j2).unwrap().status, JobStatus::Pending);
    assert_eq!(h.core.get_job(j3).unwrap().status, JobStatus::Pending);

    h.complete_active_lease(j1, Outcome::Completed).await;
    wait_until(|| h.core.get_job(j2).unwrap().status == JobStatus::Running, "j2 running").await;

    h.complete_active_lease(j2, Outcome::Completed).await;
    wait_until(|| h.core.get_job(j3).unwrap().status == JobStatus::Running, "j3 running").await;

    h.complete_active_lease(j3, Outcome::Completed).await;
    wait_until(|| h.core.get_job(j3).unwrap().status == JobStatus::Completed, "j3 completed").await;
    assert_eq!(h.core.get_stats().queue_len, 0);
    h.core.shutdown();
}

#[tokio::test]
async fn scenario_b_cycle_rejected() {
    let h = Harness::new();

    let j1 = h
        .core
        .submit_job(JobSpec::new("j1", serde_json::json!({})), vec![])
        .await
        .unwrap();
    let j2 = h
        .core
        .submit_job(
            JobSpec::new("j2", serde_json::json!({})),
            vec![(j1, DependencyKind::MustComplete)],
        )
        .await
        .unwrap();

    // j2 already depends on j1; adding j1 -> depends on j2 closes a cycle.
    let result = h.core.add_dependency(j2, j1, DependencyKind::MustComplete).await;
    assert!(matches!(result, Err(scheduler_core::SchedulerError::Cycle)));

    // Graph is unchanged: j1 is still Ready (no deps), j2 still Pending.
    assert_eq!(h.core.get_job(j1).unwrap().status, JobStatus::Ready);
    assert_eq!(h.core.get_job(j2).unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn scenario_d_must_succeed_propagation() {
    let h = Harness::new();
    h.spawn_background_loops();

    let (j1_spec, j2_spec, j3_spec, must_succeed, must_complete) =
        scenarios::must_succeed_and_must_complete_fanout();
    let j1 = h.core.submit_job(j1_spec, vec![]).await.unwrap();
    let j2 = h.core.submit_job(j2_spec, vec![(j1, must_succeed)]).await.unwrap();
    let j3 = h.core.submit_job(j3_spec, vec![(j1, must_complete)]).await.unwrap();

    h.core.register_worker(scenarios::worker_spec("w1", &[], 1)).await.unwrap();

    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::Running, "j1 running").await;
    // j1 has max_attempts=1, so one non-retryable failure exhausts retries and dead-letters it.
    h.complete_active_lease(j1, Outcome::Failed { error: "boom".to_string(), retryable: false }).await;

    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::DeadLettered, "j1 dead-lettered").await;
    wait_until(|| h.core.get_job(j2).unwrap().status == JobStatus::Cancelled, "j2 cancelled").await;
    wait_until(|| h.core.get_job(j3).unwrap().status == JobStatus::Running, "j3 running").await;

    h.complete_active_lease(j3, Outcome::Completed).await;
    wait_until(|| h.core.get_job(j3).unwrap().status == JobStatus::Completed, "j3 completed").await;
    h.core.shutdown();
}

#[tokio::test]
async fn scenario_e_priority_band_dominates_age() {
    let h = Harness::new();
    h.spawn_background_loops();

    h.core.register_worker(scenarios::worker_spec("w1", &[], 1)).await.unwrap();

    let j_low = h
        .core
        .submit_job(
            JobSpec::new("j-low", serde_json::json!({})).with_priority(PriorityBand::Low),
            vec![],
        )
        .await
        .unwrap();
    let j_high = h
        .core
        .submit_job(
            JobSpec::new("j-high", serde_json::json!({})).with_priority(PriorityBand::High),
            vec![],
        )
        .await
        .unwrap();

    // Both scores are computed fresh at enqueue time (age ~0 for both), so
    // the 2000-vs-0 band gap alone decides: High dispatches first even
    // though Low was queued earlier.
    wait_until(|| h.core.get_job(j_high).unwrap().status == JobStatus::Running, "j-high running first").await;
    assert_eq!(h.core.get_job(j_low).unwrap().status, JobStatus::Ready);

    h.complete_active_lease(j_high, Outcome::Completed).await;
    wait_until(|| h.core.get_job(j_low).unwrap().status == JobStatus::Running, "j-low running").await;
    h.complete_active_lease(j_low, Outcome::Completed).await;
    h.core.shutdown();
}

#[tokio::test]
async fn scenario_f_capacity_and_capability_filtering() {
    let h = Harness::new();
    h.spawn_background_loops();

    let (w1, w2, jg, jc1, jc2, jc3) = scenarios::capability_pools();
    h.core.register_worker(w1).await.unwrap();
    h.core.register_worker(w2).await.unwrap();

    let gpu_job = h.core.submit_job(jg, vec![]).await.unwrap();
    let cpu_job1 = h.core.submit_job(jc1, vec![]).await.unwrap();
    let cpu_job2 = h.core.submit_job(jc2, vec![]).await.unwrap();
    let cpu_job3 = h.core.submit_job(jc3, vec![]).await.unwrap();

    wait_until(|| h.core.get_job(gpu_job).unwrap().status == JobStatus::Running, "gpu job running").await;
    wait_until(|| h.core.get_job(cpu_job1).unwrap().status == JobStatus::Running, "cpu job1 running").await;
    wait_until(|| h.core.get_job(cpu_job2).unwrap().status == JobStatus::Running, "cpu job2 running").await;
    // Only 2 cpu slots exist; the third cpu job queues behind them.
    assert_eq!(h.core.get_job(cpu_job3).unwrap().status, JobStatus::Ready);

    h.complete_active_lease(cpu_job1, Outcome::Completed).await;
    wait_until(|| h.core.get_job(cpu_job3).unwrap().status == JobStatus::Running, "cpu job3 running").await;

    h.complete_active_lease(cpu_job2, Outcome::Completed).await;
    h.complete_active_lease(cpu_job3, Outcome::Completed).await;
    h.complete_active_lease(gpu_job, Outcome::Completed).await;
    h.core.shutdown();
}

#[tokio::test]
async fn scenario_c_worker_dies_mid_flight_job_retries_on_new_worker() {
    let h = Harness::new();
    h.spawn_background_loops();

    h.core.register_worker(scenarios::worker_spec("w1", &[], 1)).await.unwrap();
    let j1 = h.core.submit_job(JobSpec::new("j1", serde_json::json!({})), vec![]).await.unwrap();

    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::Running, "j1 running on w1").await;

    let w1: WorkerId = "w1".to_string();
    // w1 stops heartbeating; advance the clock past heartbeat_timeout, then
    // past worker_dead_threshold, giving the background health monitor's
    // real-time ticks a chance to observe each cutoff in turn.
    h.clock.advance(Duration::milliseconds(250));
    wait_worker_status(&h.store, &w1, WorkerStatus::Unreachable, "w1 unreachable").await;

    h.clock.advance(Duration::milliseconds(500));
    wait_worker_status(&h.store, &w1, WorkerStatus::Dead, "w1 dead").await;

    // j1 is surrendered and, after its short backoff, becomes Ready again
    // with attempt=1; register a second worker to pick it up.
    wait_until(
        || {
            let job = h.core.get_job(j1).unwrap();
            job.status == JobStatus::Ready && job.attempt_count == 1
        },
        "j1 back to Ready with attempt=1",
    )
    .await;

    h.core.register_worker(scenarios::worker_spec("w2", &[], 1)).await.unwrap();
    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::Running, "j1 running on w2").await;
    h.complete_active_lease(j1, Outcome::Completed).await;
    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::Completed, "j1 completed").await;
    h.core.shutdown();
}

#[tokio::test]
async fn dlq_retry_with_reset_attempts_returns_to_ready_at_attempt_zero() {
    let h = Harness::new();
    h.spawn_background_loops();

    h.core.register_worker(scenarios::worker_spec("w1", &[], 1)).await.unwrap();
    // max_attempts=1 so a single non-retryable failure dead-letters it.
    let j1 = h
        .core
        .submit_job(JobSpec::new("j1", serde_json::json!({})).with_max_attempts(1), vec![])
        .await
        .unwrap();

    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::Running, "j1 running").await;
    h.complete_active_lease(j1, Outcome::Failed { error: "boom".to_string(), retryable: false }).await;
    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::DeadLettered, "j1 dead-lettered").await;

    let dlq = h.core.list_dlq(scheduler_core::Page::default()).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].job_id, j1);

    h.core.retry_dlq(j1, true).await.unwrap();
    let job = h.core.get_job(j1).unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.attempt_count, 0);
    assert!(h.core.list_dlq(scheduler_core::Page::default()).await.unwrap().is_empty());

    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::Running, "j1 running again").await;
    h.complete_active_lease(j1, Outcome::Completed).await;
    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::Completed, "j1 completed").await;
    h.core.shutdown();
}

#[tokio::test]
async fn dlq_discard_drops_entry_but_leaves_job_dead_lettered() {
    let h = Harness::new();
    h.spawn_background_loops();

    h.core.register_worker(scenarios::worker_spec("w1", &[], 1)).await.unwrap();
    let j1 = h
        .core
        .submit_job(JobSpec::new("j1", serde_json::json!({})).with_max_attempts(1), vec![])
        .await
        .unwrap();

    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::Running, "j1 running").await;
    h.complete_active_lease(j1, Outcome::Failed { error: "boom".to_string(), retryable: false }).await;
    wait_until(|| h.core.get_job(j1).unwrap().status == JobStatus::DeadLettered, "j1 dead-lettered").await;

    h.core.discard_dlq(j1).await.unwrap();
    assert!(h.core.list_dlq(scheduler_core::Page::default()).await.unwrap().is_empty());
    assert_eq!(h.core.get_job(j1).unwrap().status, JobStatus::DeadLettered);

    let missing = JobId::new_v4();
    assert!(matches!(
        h.core.discard_dlq(missing).await,
        Err(scheduler_core::SchedulerError::UnknownDlqEntry(_))
    ));
    h.core.shutdown();
}
