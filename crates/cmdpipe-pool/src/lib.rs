//! # cmdpipe-pool
//!
//! Bounded-growth pool of background worker threads.
//!
//! A [`WorkerPool`] hands each [`Job`](cmdpipe_core::Job) to exactly one
//! idle [`Worker`]. Workers are created lazily up to `max` (0 = unbounded)
//! and are reused through a lock-free idle queue. When no worker can be
//! had, [`WorkerPool::dispatch`] waits once for `retry_delay` and then
//! reports the failure instead of blocking.
//!
//! ```rust,ignore
//! use cmdpipe_pool::{PoolConfig, WorkerPool};
//!
//! let pool = WorkerPool::new(PoolConfig::from_env().name("cmd"))?;
//! pool.dispatch(Arc::new(|| slow_work()))?;
//! pool.stop();
//! ```

pub mod config;
pub mod pool;
pub mod stats;
pub mod worker;

pub use config::PoolConfig;
pub use pool::WorkerPool;
pub use stats::PoolStats;
pub use worker::Worker;
