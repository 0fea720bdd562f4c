//! Command abstraction.
//!
//! A registered command is a prototype: [`Command::parse`] turns request
//! arguments into a fresh instance that the pipeline later runs through
//! [`execute`]. Commands that may block report [`Command::is_worker`] and
//! are run on the worker pool instead of the event loop.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use cmdpipe_core::kerror;
use cmdpipe_resp::Reply;

/// Shared handle to a parsed command.
pub type CommandRef = Arc<dyn Command>;

pub trait Command: Send + Sync + fmt::Debug {
    /// Upper-case command name used for registry lookup.
    fn name(&self) -> &str;

    /// Must run off the event loop.
    fn is_worker(&self) -> bool {
        false
    }

    /// Mutates state. Consumed by replication layers, not by the pipeline.
    fn is_change(&self) -> bool {
        false
    }

    /// Parsing already failed; `handle` yields the error reply.
    fn is_error(&self) -> bool {
        false
    }

    /// Build an instance from request arguments. `args[0]` is the name.
    ///
    /// Bad arguments produce an error command rather than a failure, so
    /// every request still gets exactly one reply.
    fn parse(&self, args: &[&[u8]]) -> CommandRef;

    /// Encode this command as a request.
    fn marshal(&self, buf: &mut Vec<u8>);

    /// Run the command. `None` means it produced nothing.
    fn handle(&self) -> Option<Reply>;
}

/// Inline command that answers with a fixed reply.
///
/// Used for errors discovered while parsing and for transaction
/// acknowledgements (`OK`, `QUEUED`).
#[derive(Debug, Clone)]
pub struct Immediate(pub Reply);

impl Immediate {
    pub fn error(msg: impl Into<String>) -> CommandRef {
        Arc::new(Immediate(Reply::error(msg)))
    }

    pub fn ok() -> CommandRef {
        Arc::new(Immediate(Reply::ok()))
    }

    pub fn queued() -> CommandRef {
        Arc::new(Immediate(Reply::queued()))
    }
}

impl Command for Immediate {
    fn name(&self) -> &str {
        ""
    }

    fn is_error(&self) -> bool {
        self.0.is_error()
    }

    fn parse(&self, _args: &[&[u8]]) -> CommandRef {
        Arc::new(self.clone())
    }

    // no request form
    fn marshal(&self, _buf: &mut Vec<u8>) {}

    fn handle(&self) -> Option<Reply> {
        Some(self.0.clone())
    }
}

/// Run `cmd` and always produce a reply.
///
/// A handler that returns nothing answers `ERR not implemented`; one that
/// panics answers `ERR internal error`.
pub fn execute(cmd: &dyn Command) -> Reply {
    match panic::catch_unwind(AssertUnwindSafe(|| cmd.handle())) {
        Ok(Some(reply)) => reply,
        Ok(None) => Reply::error("ERR not implemented"),
        Err(payload) => {
            let msg: &str = if let Some(s) = payload.downcast_ref::<&'static str>() {
                s
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s
            } else {
                "<non-string panic>"
            };
            kerror!("command {} panicked: {}", cmd.name(), msg);
            Reply::error("ERR internal error")
        }
    }
}

/// Reply for a command called with the wrong number of arguments.
pub fn arity_error(name: &str) -> CommandRef {
    Immediate::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Silent;

    impl Command for Silent {
        fn name(&self) -> &str {
            "SILENT"
        }
        fn parse(&self, _args: &[&[u8]]) -> CommandRef {
            Arc::new(Silent)
        }
        fn marshal(&self, _buf: &mut Vec<u8>) {}
        fn handle(&self) -> Option<Reply> {
            None
        }
    }

    #[derive(Debug)]
    struct Boom;

    impl Command for Boom {
        fn name(&self) -> &str {
            "BOOM"
        }
        fn parse(&self, _args: &[&[u8]]) -> CommandRef {
            Arc::new(Boom)
        }
        fn marshal(&self, _buf: &mut Vec<u8>) {}
        fn handle(&self) -> Option<Reply> {
            panic!("handler exploded")
        }
    }

    #[test]
    fn test_execute_substitutes_missing_reply() {
        assert_eq!(execute(&Silent), Reply::error("ERR not implemented"));
    }

    #[test]
    fn test_execute_recovers_panic() {
        cmdpipe_core::set_log_level(cmdpipe_core::LogLevel::Off);
        assert_eq!(execute(&Boom), Reply::error("ERR internal error"));
    }

    #[test]
    fn test_immediate() {
        let err = Immediate::error("ERR nope");
        assert!(err.is_error());
        assert!(!err.is_worker());
        assert_eq!(execute(&*err), Reply::error("ERR nope"));
        assert_eq!(execute(&*Immediate::queued()), Reply::queued());

        let arity = arity_error("GET");
        assert_eq!(
            execute(&*arity),
            Reply::error("ERR wrong number of arguments for 'get' command")
        );
    }
}
