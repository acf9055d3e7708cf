//! Retries, worker-failure reassignment and dead-letter routing (spec §4.6).

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::SchedulerConfig;
use crate::model::{DlqEntry, Job, JobId, JobStatus};

/// Why a job is being handed to the failure handler.
#[derive(Debug, Clone)]
pub enum FailureReason {
    /// Explicit failure report from a worker.
    ReportedError { error: String, retryable: bool },
    /// The lease deadline passed with no outcome reported.
    LeaseExpired,
    /// The worker holding the lease transitioned to `Dead`.
    WorkerDead,
    /// Recovered at startup: the lease's worker is gone or the lease expired
    /// while the engine was down.
    LeaseOrphaned,
    /// External cancellation request.
    Cancelled,
}

impl FailureReason {
    fn error_message(&self) -> String {
        match self {
            FailureReason::ReportedError { error, .. } => error.clone(),
            FailureReason::LeaseExpired => "lease-expired".to_string(),
            FailureReason::WorkerDead => "worker-dead".to_string(),
            FailureReason::LeaseOrphaned => "lease-orphaned".to_string(),
            FailureReason::Cancelled => "cancelled".to_string(),
        }
    }

    fn is_retryable(&self, retryable_predicate: &dyn Fn(&str) -> bool) -> bool {
        match self {
            FailureReason::ReportedError { retryable, error } => {
                *retryable && retryable_predicate(error)
            }
            FailureReason::Cancelled => false,
            _ => true,
        }
    }
}

/// What the caller (`SchedulerCore`) should do as a result of handling a
/// failure. The failure handler itself never touches the Store, the graph or
/// the queue directly — it only computes the decision, so it stays free of
/// the lock-ordering constraints those components impose.
#[derive(Debug, Clone)]
pub enum FailureDisposition {
    /// Re-enqueue at `run_at` with the given (already-incremented) attempt
    /// count and freshly-computed score inputs.
    RetryAt { run_at: DateTime<Utc>, attempt: u32 },
    /// Move to the dead-letter queue.
    DeadLetter { entry: DlqEntry },
    /// The job is cancelled outright (e.g. explicit cancellation, or a
    /// `MustSucceed` dependent of a job that was just dead-lettered).
    Cancel,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FailurePolicy {
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl From<&SchedulerConfig> for FailurePolicy {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            initial_delay_secs: cfg.retry_initial_delay.as_secs_f64(),
            max_delay_secs: cfg.retry_max_delay.as_secs_f64(),
            multiplier: cfg.retry_multiplier,
            jitter: cfg.retry_jitter,
        }
    }
}

/// Computes retry/DLQ decisions. Stateless beyond its policy and an injected
/// RNG source for jitter, so it can be exercised with a deterministic RNG in
/// tests.
pub struct FailureHandler<R: Rng> {
    policy: FailurePolicy,
    rng: R,
}

impl<R: Rng> FailureHandler<R> {
    pub fn new(policy: FailurePolicy, rng: R) -> Self {
        Self { policy, rng }
    }

    fn backoff(&mut self, attempt: u32) -> chrono::Duration {
        let base = self.policy.initial_delay_secs * self.policy.multiplier.powi(attempt as i32);
        let capped = base.min(self.policy.max_delay_secs);
        let jitter_span = capped * self.policy.jitter;
        let jittered = if jitter_span > 0.0 {
            capped + self.rng.gen_range(-jitter_span..=jitter_span)
        } else {
            capped
        };
        chrono::Duration::milliseconds((jittered.max(0.0) * 1000.0) as i64)
    }

    /// Decide what happens to `job` given `reason`, using a retryable
    /// predicate (default: everything except an explicit `retryable: false`
    /// report is retryable, per spec §4.6).
    pub fn handle(
        &mut self,
        job: &Job,
        reason: FailureReason,
        now: DateTime<Utc>,
        retryable_predicate: &dyn Fn(&str) -> bool,
    ) -> FailureDisposition {
        if matches!(reason, FailureReason::Cancelled) {
            return FailureDisposition::Cancel;
        }

        let retryable = reason.is_retryable(retryable_predicate);
        let next_attempt = job.attempt_count + 1;

        if retryable && next_attempt <= job.max_attempts {
            let delay = self.backoff(next_attempt);
            return FailureDisposition::RetryAt {
                run_at: now + delay,
                attempt: next_attempt,
            };
        }

        FailureDisposition::DeadLetter {
            entry: DlqEntry {
                job_id: job.id,
                final_error: reason.error_message(),
                attempt_history: vec![job
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "no prior error recorded".to_string())],
                payload: job.payload.clone(),
                dead_lettered_at: now,
            },
        }
    }

    /// Whether a Running job whose lease deadline is in the past should be
    /// considered stuck (spec §4.6 "Stuck-job sweep").
    pub fn is_stuck(job_status: JobStatus, deadline: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        job_status == JobStatus::Running && deadline < now
    }
}

/// Default retryable predicate: every error is retryable except one tagged
/// `NonRetryable` by the caller via [`FailureReason::ReportedError`]'s
/// `retryable` flag — this predicate exists for *message-based* overrides
/// (e.g. classifying a known fatal error string) on top of that flag.
pub fn default_retryable_predicate(_error: &str) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    fn sample_job(attempt_count: u32, max_attempts: u32) -> Job {
        let mut job = Job::new(
            "test",
            serde_json::json!({}),
            crate::model::PriorityBand::Normal,
            HashSet::new(),
            max_attempts,
            None,
            None,
            Utc::now(),
        );
        job.attempt_count = attempt_count;
        job
    }

    #[test]
    fn retries_while_attempts_remain() {
        let mut fh = FailureHandler::new(FailurePolicy::from(&SchedulerConfig::default()), StdRng::seed_from_u64(1));
        let job = sample_job(0, 3);
        let now = Utc::now();
        let disposition = fh.handle(
            &job,
            FailureReason::ReportedError { error: "boom".into(), retryable: true },
            now,
            &default_retryable_predicate,
        );
        match disposition {
            FailureDisposition::RetryAt { run_at, attempt } => {
                assert_eq!(attempt, 1);
                assert!(run_at > now);
            }
            other => panic!("expected RetryAt, got {other:?}"),
        }
    }

    #[test]
    fn dead_letters_once_attempts_exhausted() {
        let mut fh = FailureHandler::new(FailurePolicy::from(&SchedulerConfig::default()), StdRng::seed_from_u64(1));
        let job = sample_job(3, 3);
        let now = Utc::now();
        let disposition = fh.handle(
            &job,
            FailureReason::ReportedError { error: "boom".into(), retryable: true },
            now,
            &default_retryable_predicate,
        );
        assert!(matches!(disposition, FailureDisposition::DeadLetter { .. }));
    }

    #[test]
    fn non_retryable_goes_straight_to_dlq() {
        let mut fh = FailureHandler::new(FailurePolicy::from(&SchedulerConfig::default()), StdRng::seed_from_u64(1));
        let job = sample_job(0, 3);
        let now = Utc::now();
        let disposition = fh.handle(
            &job,
            FailureReason::ReportedError { error: "fatal".into(), retryable: false },
            now,
            &default_retryable_predicate,
        );
        assert!(matches!(disposition, FailureDisposition::DeadLetter { .. }));
    }

    #[test]
    fn cancellation_is_never_retried() {
        let mut fh = FailureHandler::new(FailurePolicy::from(&SchedulerConfig::default()), StdRng::seed_from_u64(1));
        let job = sample_job(0, 3);
        let disposition = fh.handle(&job, FailureReason::Cancelled, Utc::now(), &default_retryable_predicate);
        assert!(matches!(disposition, FailureDisposition::Cancel));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut fh = FailureHandler::new(FailurePolicy::from(&SchedulerConfig::default()), StdRng::seed_from_u64(7));
        let d1 = fh.backoff(1);
        let d2 = fh.backoff(2);
        assert!(d2 >= d1 || d2.num_milliseconds() > 0);
        let huge = fh.backoff(100);
        let max_millis = (fh.policy.max_delay_secs * (1.0 + fh.policy.jitter) * 1000.0) as i64;
        assert!(huge.num_milliseconds() <= max_millis);
    }
}
