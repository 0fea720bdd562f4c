//! Error types for the worker pool and connection pipeline

use core::fmt;

/// Result type for cmdpipe operations
pub type Result<T> = std::result::Result<T, PipeError>;

/// Errors that can occur outside the per-command reply path
#[derive(Debug)]
pub enum PipeError {
    /// Pool is closing or closed, no new work accepted
    PoolClosed,

    /// Pool reached its maximum number of workers
    PoolExhausted,

    /// Worker was not idle when a job was handed to it
    WorkerBusy,

    /// Worker's job channel is already closed
    WorkerClosed,

    /// A command with the same name is already registered
    DuplicateCommand(String),

    /// The reactor could not be asked to wake a connection (errno)
    WakeFailed(i32),

    /// OS error with errno
    Os(i32),

    /// I/O error from std
    Io(std::io::Error),
}

impl PipeError {
    /// Build an `Os` error from the calling thread's errno
    pub fn last_os_error() -> Self {
        PipeError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeError::PoolClosed => write!(f, "worker pool closed"),
            PipeError::PoolExhausted => write!(f, "worker pool exhausted"),
            PipeError::WorkerBusy => write!(f, "worker busy"),
            PipeError::WorkerClosed => write!(f, "worker closed"),
            PipeError::DuplicateCommand(name) => write!(f, "command name '{}' already used", name),
            PipeError::WakeFailed(e) => write!(f, "wake: errno {}", e),
            PipeError::Os(e) => write!(f, "OS error: errno {}", e),
            PipeError::Io(e) => write!(f, "io: {}", e),
        }
    }
}

impl std::error::Error for PipeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipeError {
    fn from(e: std::io::Error) -> Self {
        PipeError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(PipeError::PoolExhausted.to_string(), "worker pool exhausted");
        assert_eq!(
            PipeError::DuplicateCommand("get".into()).to_string(),
            "command name 'get' already used"
        );
        assert_eq!(PipeError::WakeFailed(9).to_string(), "wake: errno 9");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: PipeError = io.into();
        assert!(matches!(err, PipeError::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
