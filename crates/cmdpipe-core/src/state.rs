//! State enums shared between the reactor, the pipeline and the pool

use core::fmt;

/// Cooperative signal from a connection to the reactor driving it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Action {
    /// Keep the connection open
    #[default]
    None = 0,

    /// Flush pending output, then close the socket
    Close = 1,

    /// Stop the whole server
    Shutdown = 2,

    /// Hand the raw socket to an external owner
    Detach = 3,
}

impl Action {
    /// True for any action that ends pipeline processing on the connection
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Action::None)
    }
}

impl From<u8> for Action {
    fn from(v: u8) -> Self {
        match v {
            1 => Action::Close,
            2 => Action::Shutdown,
            3 => Action::Detach,
            _ => Action::None,
        }
    }
}

/// State of a single worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Parked, waiting for a job
    Idle = 0,

    /// Running a job
    Active = 1,

    /// Channel closed, finishing the current job
    Closing = 2,

    /// Thread exited
    Closed = 3,
}

impl From<u8> for WorkerState {
    fn from(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Active,
            2 => WorkerState::Closing,
            _ => WorkerState::Closed,
        }
    }
}

impl From<WorkerState> for u8 {
    fn from(state: WorkerState) -> u8 {
        state as u8
    }
}

/// State of a worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl From<u8> for PoolState {
    fn from(v: u8) -> Self {
        match v {
            0 => PoolState::Active,
            1 => PoolState::Closing,
            _ => PoolState::Closed,
        }
    }
}

impl From<PoolState> for u8 {
    fn from(state: PoolState) -> u8 {
        state as u8
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolState::Active => write!(f, "active"),
            PoolState::Closing => write!(f, "closing"),
            PoolState::Closed => write!(f, "closed"),
        }
    }
}

/// What a connection is being used for
///
/// Opaque to the pipeline; higher layers switch a connection's kind when
/// it subscribes, joins replication or starts an install stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnKind {
    #[default]
    Command = 0,
    PubSub = 1,
    Raft = 2,
    Queue = 3,
    Install = 4,
}

impl fmt::Display for ConnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnKind::Command => write!(f, "command"),
            ConnKind::PubSub => write!(f, "pubsub"),
            ConnKind::Raft => write!(f, "raft"),
            ConnKind::Queue => write!(f, "queue"),
            ConnKind::Install => write!(f, "install"),
        }
    }
}

/// Requested write durability for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Durability {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
}

impl From<u8> for Durability {
    fn from(v: u8) -> Self {
        match v {
            0 => Durability::Low,
            2 => Durability::High,
            _ => Durability::Medium,
        }
    }
}
