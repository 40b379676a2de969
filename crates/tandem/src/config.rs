//! Scheduler configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable overriding [`SchedulerConfig::worker_threads`].
pub const ENV_WORKER_THREADS: &str = "TANDEM_WORKER_THREADS";

/// Environment variable selecting the clock (`system` or `virtual`).
pub const ENV_CLOCK: &str = "TANDEM_CLOCK";

/// Time source used for sleeps and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// Monotonic wall clock; idle waits really block
    #[default]
    System,
    /// Simulated clock that jumps to the next deadline whenever the
    /// scheduler is idle and no worker job is outstanding
    Virtual,
}

/// Configuration for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the default worker pool (0 = number of CPUs)
    pub worker_threads: usize,

    /// Clock driving sleeps and timeouts
    pub clock: ClockMode,

    /// Name prefix for worker threads
    pub thread_name: String,

    /// How long shutdown waits for each worker thread to exit
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            clock: ClockMode::System,
            thread_name: "tandem-worker".to_string(),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    /// Deterministic preset for tests and simulations: virtual clock and a
    /// small worker pool.
    pub fn virtual_time() -> Self {
        Self {
            worker_threads: 2,
            clock: ClockMode::Virtual,
            ..Self::default()
        }
    }

    /// Read overrides from `TANDEM_WORKER_THREADS` and `TANDEM_CLOCK`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_WORKER_THREADS) {
            config.worker_threads = raw.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("{ENV_WORKER_THREADS} must be an integer, got {raw:?}"))
            })?;
        }

        if let Some(raw) = lookup(ENV_CLOCK) {
            config.clock = match raw.trim().to_ascii_lowercase().as_str() {
                "system" | "real" => ClockMode::System,
                "virtual" => ClockMode::Virtual,
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "{ENV_CLOCK} must be `system` or `virtual`, got {other:?}"
                    )))
                }
            };
        }

        Ok(config)
    }

    /// Set the worker pool size.
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Set the clock mode.
    pub fn with_clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    /// Set the worker thread name prefix.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Worker count with the CPU default applied.
    pub(crate) fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_resolves_cpu_count() {
        let config = SchedulerConfig::default();
        assert_eq!(config.clock, ClockMode::System);
        assert_eq!(config.resolved_worker_threads(), num_cpus::get());
        assert_eq!(config.with_worker_threads(3).resolved_worker_threads(), 3);
    }

    #[test]
    fn test_lookup_overrides() {
        let config = SchedulerConfig::from_lookup(|key| match key {
            ENV_WORKER_THREADS => Some("4".into()),
            ENV_CLOCK => Some("Virtual".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.clock, ClockMode::Virtual);
    }

    #[test]
    fn test_lookup_rejects_garbage() {
        let err = SchedulerConfig::from_lookup(|key| {
            (key == ENV_WORKER_THREADS).then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = SchedulerConfig::from_lookup(|key| (key == ENV_CLOCK).then(|| "sundial".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
