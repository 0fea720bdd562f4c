//! # cmdpipe-core
//!
//! Core types shared by the cmdpipe worker pool, the connection pipeline
//! and the reactor.
//!
//! This crate is platform-agnostic and has no external dependencies.
//!
//! ## Modules
//!
//! - `spinlock` - CAS spin-lock with yield backoff and miss counting
//! - `state` - Connection action, worker/pool state, connection kind enums
//! - `traits` - `Job` (pool work unit) and `Waker` (reactor re-invocation)
//! - `error` - Error types
//! - `kprint` - Leveled stderr logging macros
//! - `env` - Environment variable utilities

pub mod spinlock;
pub mod state;
pub mod traits;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use spinlock::{SpinLock, SpinLockGuard};
pub use state::{Action, ConnKind, Durability, PoolState, WorkerState};
pub use traits::{Job, Waker};
pub use error::{PipeError, Result};
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt, env_get_str};
pub use kprint::{LogLevel, set_log_level};
