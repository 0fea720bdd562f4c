//! Built-in command vocabulary
//!
//! - `PING [msg]`, `ECHO msg` - connection checks
//! - `GET key`, `SET key value`, `DEL key [key ...]` - keyspace access
//! - `SLEEP [millis]` - blocks a worker, for exercising background dispatch

mod keys;
mod server;
mod sleep;

pub use keys::{Del, Get, Set};
pub use server::{Echo, Ping};
pub use sleep::Sleep;

use std::sync::Arc;

use cmdpipe_core::error::Result;

use crate::keyspace::Keyspace;
use crate::registry::Registry;

/// Register every built-in command, sharing `keyspace`.
pub fn register_builtins(registry: &mut Registry, keyspace: &Arc<Keyspace>) -> Result<()> {
    registry.register(Arc::new(Ping::default()))?;
    registry.register(Arc::new(Echo::default()))?;
    registry.register(Arc::new(Get::prototype(keyspace)))?;
    registry.register(Arc::new(Set::prototype(keyspace)))?;
    registry.register(Arc::new(Del::prototype(keyspace)))?;
    registry.register(Arc::new(Sleep::default()))?;
    Ok(())
}
