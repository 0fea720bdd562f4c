//! Worker pool configuration
//!
//! ```rust,ignore
//! use cmdpipe_pool::PoolConfig;
//!
//! let config = PoolConfig::from_env().name("cmd").max(64);
//! ```

use std::time::Duration;

use cmdpipe_core::env::{env_get, env_get_millis, env_get_str};

/// Library defaults
pub mod defaults {
    pub const NAME: &str = "workers";
    /// Workers spawned up front
    pub const MIN: usize = 0;
    /// Upper bound on live workers, 0 = unbounded
    pub const MAX: usize = 0;
    /// Pause before the single dispatch retry
    pub const RETRY_DELAY_MS: u64 = 1;
}

/// Sizing and naming for a [`WorkerPool`](crate::WorkerPool)
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread name prefix, also used in stats output
    pub name: String,
    /// Workers spawned at construction
    pub min: usize,
    /// Maximum live workers, 0 for unbounded
    pub max: usize,
    /// Sleep between a failed allocation and the one retry
    pub retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: defaults::NAME.to_string(),
            min: defaults::MIN,
            max: defaults::MAX,
            retry_delay: Duration::from_millis(defaults::RETRY_DELAY_MS),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CMDPIPE_POOL_NAME` - Thread name prefix
    /// - `CMDPIPE_MIN_WORKERS` - Workers spawned up front
    /// - `CMDPIPE_MAX_WORKERS` - Maximum live workers (0 = unbounded)
    /// - `CMDPIPE_DISPATCH_RETRY_MS` - Delay before the dispatch retry
    pub fn from_env() -> Self {
        Self {
            name: env_get_str("CMDPIPE_POOL_NAME", defaults::NAME),
            min: env_get("CMDPIPE_MIN_WORKERS", defaults::MIN),
            max: env_get("CMDPIPE_MAX_WORKERS", defaults::MAX),
            retry_delay: env_get_millis(
                "CMDPIPE_DISPATCH_RETRY_MS",
                Duration::from_millis(defaults::RETRY_DELAY_MS),
            ),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn min(mut self, n: usize) -> Self {
        self.min = n;
        self
    }

    pub fn max(mut self, n: usize) -> Self {
        self.max = n;
        self
    }

    pub fn retry_delay(mut self, d: Duration) -> Self {
        self.retry_delay = d;
        self
    }

    /// Effective upper bound: a nonzero `max` is raised to at least `min`.
    pub fn effective_max(&self) -> usize {
        if self.max != 0 && self.max < self.min {
            self.min
        } else {
            self.max
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = PoolConfig::new().name("bg").min(2).max(8);
        assert_eq!(config.name, "bg");
        assert_eq!(config.min, 2);
        assert_eq!(config.effective_max(), 8);
        assert_eq!(config.retry_delay, Duration::from_millis(1));
    }

    #[test]
    fn test_max_raised_to_min() {
        assert_eq!(PoolConfig::new().min(4).max(2).effective_max(), 4);
        assert_eq!(PoolConfig::new().min(4).max(0).effective_max(), 0);
    }
}
