//! Startup configuration for the helper pool.

use crate::error::{PoolError, Result};
use std::time::Duration;

/// Pool configuration, consumed once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// How long a worker may sit idle before it terminates itself.
    pub helper_timeout: Duration,
    /// Workers started up front (one per active camera is typical).
    pub active_worker_count: usize,
    /// Upper bound on every wait; also bounds cancellation latency.
    pub poll_interval: Duration,
    /// Overall deadline for collecting one batch.
    pub collect_deadline: Duration,
    /// Grace period for a helper to exit after being asked to.
    pub helper_stop_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            helper_timeout: Duration::from_secs(30),
            active_worker_count: 4,
            poll_interval: Duration::from_millis(50),
            collect_deadline: Duration::from_secs(60),
            helper_stop_timeout: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    /// Build a config from the two startup settings, defaults for the rest.
    pub fn new(helper_timeout_secs: f64, active_worker_count: usize) -> Result<Self> {
        Ok(Self {
            helper_timeout: secs_to_duration("helper timeout", helper_timeout_secs)?,
            active_worker_count,
            ..Default::default()
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_collect_deadline(mut self, deadline: Duration) -> Self {
        self.collect_deadline = deadline;
        self
    }

    pub fn with_helper_stop_timeout(mut self, timeout: Duration) -> Self {
        self.helper_stop_timeout = timeout;
        self
    }

    /// Reject configurations that would make the pool spin or never time out.
    pub fn validate(&self) -> Result<()> {
        if self.helper_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "helper timeout must be greater than zero".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "poll interval must be greater than zero".into(),
            ));
        }
        if self.collect_deadline < self.poll_interval {
            return Err(PoolError::InvalidConfig(format!(
                "collect deadline ({:?}) is shorter than the poll interval ({:?})",
                self.collect_deadline, self.poll_interval
            )));
        }
        Ok(())
    }
}

/// Convert a user-supplied seconds value into a `Duration`.
pub fn secs_to_duration(what: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(PoolError::InvalidConfig(format!(
            "{} must be a positive number of seconds, got {}",
            what, secs
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| PoolError::InvalidConfig(format!("{} out of range: {}", what, e)))
}
