//! Pool counters

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use cmdpipe_core::PoolState;

/// Live counters, updated by the pool and its workers
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub supply: AtomicU64,
    pub max_supply: AtomicU64,
    pub forged: AtomicU64,
    pub exhausted: AtomicU64,
    pub gets: AtomicU64,
    pub puts: AtomicU64,
    pub panics: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of a pool's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    pub state: PoolState,
    /// Live workers
    pub supply: u64,
    /// Peak live workers
    pub max_supply: u64,
    /// Workers ever created
    pub forged: u64,
    /// Allocations refused because `max` was reached
    pub exhausted: u64,
    /// Allocation attempts
    pub gets: u64,
    /// Workers returned to the idle queue
    pub puts: u64,
    /// Jobs that panicked
    pub panics: u64,
    /// Workers parked in the idle queue right now
    pub idle: usize,
}

impl PoolStats {
    pub(crate) fn snapshot(name: &str, state: PoolState, c: &Counters, idle: usize) -> Self {
        Self {
            name: name.to_string(),
            state,
            supply: c.supply.load(Ordering::Relaxed),
            max_supply: c.max_supply.load(Ordering::Relaxed),
            forged: c.forged.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            gets: c.gets.load(Ordering::Relaxed),
            puts: c.puts.load(Ordering::Relaxed),
            panics: c.panics.load(Ordering::Relaxed),
            idle,
        }
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pool {} [{}]: supply={} max_supply={} forged={} exhausted={} gets={} puts={} idle={} panics={}",
            self.name,
            self.state,
            self.supply,
            self.max_supply,
            self.forged,
            self.exhausted,
            self.gets,
            self.puts,
            self.idle,
            self.panics,
        )
    }
}
