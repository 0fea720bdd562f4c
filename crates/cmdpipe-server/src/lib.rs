//! # cmdpipe-server
//!
//! Pipelined request/reply server core.
//!
//! Each connection parses requests on its event loop and runs them there
//! in arrival order until it meets a command that may block. That command
//! is handed to a background [`WorkerPool`](cmdpipe_pool::WorkerPool) and
//! later requests wait in a per-connection backlog, so replies always go
//! out in the order requests came in.
//!
//! ## Modules
//!
//! - `command` - `Command` trait, `Immediate` replies, panic-safe `execute`
//! - `commands` - Built-in demo vocabulary (PING, ECHO, GET, SET, DEL, SLEEP)
//! - `registry` - Case-insensitive command lookup
//! - `transaction` - MULTI / EXEC / DISCARD framing
//! - `conn` - Per-connection pipeline (`Conn`, `ConnHandle`)
//! - `config` - `ServerConfig` with env overrides
//! - `keyspace` - In-memory key/value map used by the demo commands
//! - `server` - Multi-loop epoll server (Linux)

pub mod command;
pub mod commands;
pub mod config;
pub mod conn;
pub mod keyspace;
pub mod registry;
pub mod transaction;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod sys;
        mod event_loop;
        pub mod server;

        pub use server::{DetachHandler, OpenHandler, Server, ServerHooks, ServerStats};
    }
}

pub use command::{execute, Command, CommandRef, Immediate};
pub use config::ServerConfig;
pub use conn::{Conn, ConnHandle, ConnStats, RaftHandle};
pub use keyspace::Keyspace;
pub use registry::Registry;
pub use transaction::{Exec, TxState};
