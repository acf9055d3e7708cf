//! Monotonic time abstraction.
//!
//! Every component that reasons about age, backoff or deadlines goes through a
//! [`Clock`] rather than calling `Utc::now()` directly, so tests can advance time
//! deterministically (see `scheduler-testing`'s `ManualClock`).

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
