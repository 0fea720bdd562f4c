//! Server configuration
//!
//! Compile-time defaults with runtime environment overrides, then
//! builder-style adjustments.
//!
//! ```rust,ignore
//! use cmdpipe_server::config::ServerConfig;
//!
//! let config = ServerConfig::from_env().port(7000).event_loops(2);
//! ```

use std::time::Duration;

use cmdpipe_core::env::{env_get, env_get_str};
use cmdpipe_pool::PoolConfig;

/// Library defaults
pub mod defaults {
    pub const BIND: &str = "0.0.0.0";
    pub const PORT: u16 = 9999;
    /// Upper bound for the automatic event loop count
    pub const MAX_AUTO_EVENT_LOOPS: usize = 8;
    pub const MIN_WORKERS: usize = 0;
    /// 0 = unbounded
    pub const MAX_WORKERS: usize = 0;
    /// Commands waiting behind a running worker command, per connection
    pub const MAX_BACKLOG: usize = 10_000;
    /// Largest partial request kept between reads
    pub const MAX_REQUEST_BUFFER: usize = 65_536;
    pub const READ_BUFFER_SIZE: usize = 65_536;
    /// Seconds between stats lines, 0 = off
    pub const STATS_INTERVAL_SEC: u64 = 0;

    /// `max(1, nproc / 2)`, capped at [`MAX_AUTO_EVENT_LOOPS`]
    pub fn event_loops() -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        (cpus / 2).clamp(1, MAX_AUTO_EVENT_LOOPS)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,
    pub port: u16,
    /// Event loop threads, each with its own epoll instance
    pub event_loops: usize,
    /// Worker threads spawned at startup
    pub min_workers: usize,
    /// Maximum worker threads, 0 = unbounded
    pub max_workers: usize,
    /// Per-connection backlog ceiling
    pub max_backlog: usize,
    /// Per-connection partial request ceiling
    pub max_request_buffer: usize,
    /// Bytes read per `read(2)`
    pub read_buffer_size: usize,
    /// Periodic stats logging, `None` = off
    pub stats_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: defaults::BIND.to_string(),
            port: defaults::PORT,
            event_loops: defaults::event_loops(),
            min_workers: defaults::MIN_WORKERS,
            max_workers: defaults::MAX_WORKERS,
            max_backlog: defaults::MAX_BACKLOG,
            max_request_buffer: defaults::MAX_REQUEST_BUFFER,
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            stats_interval: None,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CMDPIPE_BIND` - Listen address
    /// - `CMDPIPE_PORT` - Listen port
    /// - `CMDPIPE_EVENT_LOOPS` - Event loop threads
    /// - `CMDPIPE_MIN_WORKERS` - Workers spawned at startup
    /// - `CMDPIPE_MAX_WORKERS` - Maximum workers (0 = unbounded)
    /// - `CMDPIPE_MAX_BACKLOG` - Per-connection backlog ceiling
    /// - `CMDPIPE_MAX_REQUEST_BUFFER` - Per-connection partial request ceiling
    /// - `CMDPIPE_READ_BUFFER` - Bytes per read
    /// - `CMDPIPE_STATS_INTERVAL_SEC` - Stats logging period (0 = off)
    pub fn from_env() -> Self {
        let stats_secs = env_get("CMDPIPE_STATS_INTERVAL_SEC", defaults::STATS_INTERVAL_SEC);
        Self {
            bind: env_get_str("CMDPIPE_BIND", defaults::BIND),
            port: env_get("CMDPIPE_PORT", defaults::PORT),
            event_loops: env_get("CMDPIPE_EVENT_LOOPS", defaults::event_loops()),
            min_workers: env_get("CMDPIPE_MIN_WORKERS", defaults::MIN_WORKERS),
            max_workers: env_get("CMDPIPE_MAX_WORKERS", defaults::MAX_WORKERS),
            max_backlog: env_get("CMDPIPE_MAX_BACKLOG", defaults::MAX_BACKLOG),
            max_request_buffer: env_get(
                "CMDPIPE_MAX_REQUEST_BUFFER",
                defaults::MAX_REQUEST_BUFFER,
            ),
            read_buffer_size: env_get("CMDPIPE_READ_BUFFER", defaults::READ_BUFFER_SIZE),
            stats_interval: (stats_secs > 0).then(|| Duration::from_secs(stats_secs)),
        }
    }

    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind = addr.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn event_loops(mut self, n: usize) -> Self {
        self.event_loops = n;
        self
    }

    pub fn workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn max_backlog(mut self, n: usize) -> Self {
        self.max_backlog = n;
        self
    }

    pub fn max_request_buffer(mut self, n: usize) -> Self {
        self.max_request_buffer = n;
        self
    }

    pub fn read_buffer_size(mut self, n: usize) -> Self {
        self.read_buffer_size = n;
        self
    }

    pub fn stats_interval(mut self, d: Option<Duration>) -> Self {
        self.stats_interval = d;
        self
    }

    /// `bind:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Pool settings derived from the worker bounds.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::from_env()
            .name("cmdpipe-worker")
            .min(self.min_workers)
            .max(self.max_workers)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.event_loops == 0 {
            return Err("event_loops must be at least 1");
        }
        if self.max_backlog == 0 {
            return Err("max_backlog must be at least 1");
        }
        if self.read_buffer_size == 0 {
            return Err("read_buffer_size must be at least 1");
        }
        if self.max_request_buffer == 0 {
            return Err("max_request_buffer must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, defaults::PORT);
        assert_eq!(config.max_backlog, 10_000);
        assert_eq!(config.max_request_buffer, 65_536);
        assert!(config.event_loops >= 1 && config.event_loops <= 8);
        assert!(config.stats_interval.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(config.addr(), "0.0.0.0:9999");
    }

    #[test]
    fn test_builder_and_validate() {
        let config = ServerConfig::new().bind("127.0.0.1").port(0).event_loops(0);
        assert_eq!(config.addr(), "127.0.0.1:0");
        assert!(config.validate().is_err());

        let config = ServerConfig::new().workers(2, 1);
        let pool = config.pool_config();
        assert_eq!(pool.min, 2);
        assert_eq!(pool.effective_max(), 2);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("CMDPIPE_MAX_BACKLOG", "12");
        std::env::set_var("CMDPIPE_STATS_INTERVAL_SEC", "3");
        let config = ServerConfig::from_env();
        std::env::remove_var("CMDPIPE_MAX_BACKLOG");
        std::env::remove_var("CMDPIPE_STATS_INTERVAL_SEC");
        assert_eq!(config.max_backlog, 12);
        assert_eq!(config.stats_interval, Some(Duration::from_secs(3)));
    }
}
