//! MULTI / EXEC / DISCARD.
//!
//! Transaction framing happens on the event loop while requests are
//! parsed. Every request inside a transaction is answered in order by an
//! inline acknowledgement (`OK`, `QUEUED`, or an error), and `EXEC`
//! becomes a single [`Exec`] command that replays the queued commands and
//! replies with one array.

use std::sync::Arc;

use cmdpipe_resp::{append_command, Reply};

use crate::command::{arity_error, execute, Command, CommandRef, Immediate};
use crate::registry::Registry;

pub const ERR_NESTED: &str = "ERR MULTI calls can not be nested";
pub const ERR_NO_TRANSACTION: &str = "ERR no transaction";
pub const ERR_EXEC_ABORT: &str = "EXECABORT Transaction discarded because of previous errors.";

/// Commands queued since `MULTI`.
#[derive(Debug, Default)]
struct Transaction {
    queued: Vec<CommandRef>,
    aborted: bool,
}

/// Per-connection transaction framing.
#[derive(Debug, Default)]
pub struct TxState {
    current: Option<Transaction>,
}

impl TxState {
    #[inline]
    pub fn in_multi(&self) -> bool {
        self.current.is_some()
    }

    /// Turn one request into the command that answers it.
    pub fn resolve(&mut self, registry: &Registry, args: &[&[u8]]) -> CommandRef {
        let name = args[0];
        if name.eq_ignore_ascii_case(b"MULTI") {
            return self.multi(args);
        }
        if name.eq_ignore_ascii_case(b"EXEC") {
            return self.exec(args);
        }
        if name.eq_ignore_ascii_case(b"DISCARD") {
            return self.discard(args);
        }

        let cmd = registry.resolve(args);
        match self.current.as_mut() {
            None => cmd,
            Some(tx) if cmd.is_error() => {
                tx.aborted = true;
                cmd
            }
            Some(tx) => {
                tx.queued.push(cmd);
                Immediate::queued()
            }
        }
    }

    fn multi(&mut self, args: &[&[u8]]) -> CommandRef {
        if args.len() != 1 {
            return self.fail(arity_error("MULTI"));
        }
        if self.current.is_some() {
            return Immediate::error(ERR_NESTED);
        }
        self.current = Some(Transaction::default());
        Immediate::ok()
    }

    fn exec(&mut self, args: &[&[u8]]) -> CommandRef {
        if args.len() != 1 {
            return self.fail(arity_error("EXEC"));
        }
        match self.current.take() {
            None => Immediate::error(ERR_NO_TRANSACTION),
            Some(tx) if tx.aborted => Immediate::error(ERR_EXEC_ABORT),
            Some(tx) => Arc::new(Exec::new(tx.queued)),
        }
    }

    fn discard(&mut self, args: &[&[u8]]) -> CommandRef {
        if args.len() != 1 {
            return self.fail(arity_error("DISCARD"));
        }
        match self.current.take() {
            None => Immediate::error(ERR_NO_TRANSACTION),
            Some(_) => Immediate::ok(),
        }
    }

    fn fail(&mut self, err: CommandRef) -> CommandRef {
        if let Some(tx) = self.current.as_mut() {
            tx.aborted = true;
        }
        err
    }
}

/// Replays a transaction's queued commands as one unit.
///
/// Runs on a worker if any queued command needs one.
#[derive(Debug)]
pub struct Exec {
    queued: Vec<CommandRef>,
    worker: bool,
}

impl Exec {
    pub fn new(queued: Vec<CommandRef>) -> Self {
        let worker = queued.iter().any(|c| c.is_worker());
        Self { queued, worker }
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

impl Command for Exec {
    fn name(&self) -> &str {
        "EXEC"
    }

    fn is_worker(&self) -> bool {
        self.worker
    }

    fn is_change(&self) -> bool {
        self.queued.iter().any(|c| c.is_change())
    }

    fn parse(&self, _args: &[&[u8]]) -> CommandRef {
        Arc::new(Exec::new(Vec::new()))
    }

    fn marshal(&self, buf: &mut Vec<u8>) {
        append_command(buf, &[b"MULTI"]);
        for cmd in &self.queued {
            cmd.marshal(buf);
        }
        append_command(buf, &[b"EXEC"]);
    }

    fn handle(&self) -> Option<Reply> {
        Some(Reply::Array(self.queued.iter().map(|c| execute(&**c)).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::Keyspace;

    fn setup() -> (Registry, Arc<Keyspace>) {
        let ks = Arc::new(Keyspace::new());
        ks.set(b"a", b"1");
        ks.set(b"b", b"2");
        (Registry::with_builtins(&ks).unwrap(), ks)
    }

    fn run(tx: &mut TxState, registry: &Registry, args: &[&[u8]]) -> Reply {
        execute(&*tx.resolve(registry, args))
    }

    #[test]
    fn test_multi_exec() {
        let (registry, _) = setup();
        let mut tx = TxState::default();
        assert_eq!(run(&mut tx, &registry, &[b"MULTI"]), Reply::ok());
        assert!(tx.in_multi());
        assert_eq!(run(&mut tx, &registry, &[b"GET", b"a"]), Reply::queued());
        assert_eq!(run(&mut tx, &registry, &[b"get", b"b"]), Reply::queued());
        assert_eq!(
            run(&mut tx, &registry, &[b"EXEC"]),
            Reply::Array(vec![Reply::bulk("1"), Reply::bulk("2")])
        );
        assert!(!tx.in_multi());
    }

    #[test]
    fn test_discard_then_exec() {
        let (registry, _) = setup();
        let mut tx = TxState::default();
        assert_eq!(run(&mut tx, &registry, &[b"MULTI"]), Reply::ok());
        assert_eq!(run(&mut tx, &registry, &[b"GET", b"a"]), Reply::queued());
        assert_eq!(run(&mut tx, &registry, &[b"DISCARD"]), Reply::ok());
        assert_eq!(run(&mut tx, &registry, &[b"EXEC"]), Reply::error(ERR_NO_TRANSACTION));
        assert_eq!(run(&mut tx, &registry, &[b"DISCARD"]), Reply::error(ERR_NO_TRANSACTION));
    }

    #[test]
    fn test_nested_and_abort() {
        let (registry, _) = setup();
        let mut tx = TxState::default();
        run(&mut tx, &registry, &[b"MULTI"]);
        assert_eq!(run(&mut tx, &registry, &[b"MULTI"]), Reply::error(ERR_NESTED));
        assert_eq!(run(&mut tx, &registry, &[b"GET", b"a"]), Reply::queued());
        assert!(run(&mut tx, &registry, &[b"NOPE"]).is_error());
        assert_eq!(run(&mut tx, &registry, &[b"EXEC"]), Reply::error(ERR_EXEC_ABORT));
        assert!(!tx.in_multi());
    }

    #[test]
    fn test_exec_with_worker_command() {
        let (registry, ks) = setup();
        let mut tx = TxState::default();
        run(&mut tx, &registry, &[b"MULTI"]);
        run(&mut tx, &registry, &[b"SET", b"a", b"9"]);
        run(&mut tx, &registry, &[b"SLEEP", b"1"]);
        let exec = tx.resolve(&registry, &[b"EXEC"]);
        assert!(exec.is_worker());
        assert!(exec.is_change());
        assert_eq!(execute(&*exec), Reply::Array(vec![Reply::ok(), Reply::ok()]));
        assert_eq!(ks.get(b"a"), Some(b"9".to_vec()));
    }
}
