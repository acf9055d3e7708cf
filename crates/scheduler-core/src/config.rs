//! Layered engine configuration (spec §4.10 / §6).
//!
//! Compiled-in defaults are overridden by an optional config file, in turn
//! overridden by environment variables prefixed `SCHEDULER_` — the last layer
//! to set a field wins. `SchedulerConfig::validate` rejects inconsistent
//! values at load time so the engine never starts half-configured.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::ScoreParams;
use crate::registry::CandidateWeights;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub worker_dead_threshold: Duration,
    pub dispatch_tick_active: Duration,
    pub dispatch_tick_idle: Duration,
    pub stuck_job_sweep_interval: Duration,
    pub default_lease_slack: f64,
    pub min_lease: Duration,
    pub max_lease: Duration,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_multiplier: f64,
    pub retry_jitter: f64,
    pub priority_band_high: i64,
    pub priority_band_normal: i64,
    pub priority_band_low: i64,
    pub age_weight: i64,
    pub retry_penalty: i64,
    pub dependency_max_depth: usize,
    pub dlq_retention: Duration,
    pub outbox_relay_interval: Duration,
    pub snapshot_interval: Duration,
    pub graph_validation_interval: Duration,
    pub candidate_weights: CandidateWeights,
    /// Bounded attempts for the Dispatcher's Reserve+IssueLease two-phase
    /// commit loop before re-queueing (spec §4.5 step 4).
    pub dispatch_retry_attempts: u32,
    /// Consecutive no-candidate requeues before a "no-capacity" event fires
    /// (spec §4.5 step 3).
    pub no_capacity_event_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
            worker_dead_threshold: Duration::from_secs(600),
            dispatch_tick_active: Duration::from_millis(50),
            dispatch_tick_idle: Duration::from_secs(1),
            stuck_job_sweep_interval: Duration::from_secs(600),
            default_lease_slack: 2.0,
            min_lease: Duration::from_secs(30),
            max_lease: Duration::from_secs(24 * 3600),
            retry_initial_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(3600),
            retry_multiplier: 2.0,
            retry_jitter: 0.25,
            priority_band_high: 0,
            priority_band_normal: 1000,
            priority_band_low: 2000,
            age_weight: 1,
            retry_penalty: 100,
            dependency_max_depth: 10_000,
            dlq_retention: Duration::from_secs(7 * 24 * 3600),
            outbox_relay_interval: Duration::from_secs(5),
            snapshot_interval: Duration::from_secs(60),
            graph_validation_interval: Duration::from_secs(300),
            candidate_weights: CandidateWeights::default(),
            dispatch_retry_attempts: 3,
            no_capacity_event_threshold: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max_lease ({max:?}) must be >= min_lease ({min:?})")]
    LeaseBoundsInverted { min: Duration, max: Duration },
    #[error("heartbeat_timeout must be greater than heartbeat_interval")]
    HeartbeatTimeoutTooShort,
    #[error("candidate weight {0} must be in [0, 1]")]
    WeightOutOfRange(&'static str),
    #[error("retry_jitter must be in [0, 1], got {0}")]
    JitterOutOfRange(f64),
}

impl SchedulerConfig {
    pub fn score_params(&self) -> ScoreParams {
        ScoreParams {
            band_high: self.priority_band_high,
            band_normal: self.priority_band_normal,
            band_low: self.priority_band_low,
            age_weight_per_minute: self.age_weight,
            retry_penalty_per_attempt: self.retry_penalty,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_lease < self.min_lease {
            return Err(ConfigError::LeaseBoundsInverted {
                min: self.min_lease,
                max: self.max_lease,
            });
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::HeartbeatTimeoutTooShort);
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::JitterOutOfRange(self.retry_jitter));
        }
        let w = &self.candidate_weights;
        for (name, value) in [
            ("available_capacity", w.available_capacity),
            ("inverse_load", w.inverse_load),
            ("success_rate", w.success_rate),
            ("inverse_exec_time", w.inverse_exec_time),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::WeightOutOfRange(name));
            }
        }
        Ok(())
    }

    /// Load defaults, then an optional config file, then `SCHEDULER_`-prefixed
    /// environment variables, validating the merged result.
    pub fn load(file_path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&SchedulerConfig::default())?);

        if let Some(path) = file_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("SCHEDULER").separator("__"));

        let merged: SchedulerConfig = builder.build()?.try_deserialize()?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_lease_bounds() {
        let mut cfg = SchedulerConfig::default();
        cfg.min_lease = Duration::from_secs(100);
        cfg.max_lease = Duration::from_secs(50);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::LeaseBoundsInverted { .. })
        ));
    }

    #[test]
    fn rejects_jitter_out_of_range() {
        let mut cfg = SchedulerConfig::default();
        cfg.retry_jitter = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::JitterOutOfRange(_))));
    }
}
