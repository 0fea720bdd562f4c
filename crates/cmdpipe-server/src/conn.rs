//! Per-connection command pipeline.
//!
//! A [`Conn`] is owned by the event loop that reads its socket. Requests
//! are parsed on the loop and run there, in order, until the first command
//! that needs a worker. That command becomes the connection's single
//! *active* command and is handed to the [`WorkerPool`]; everything parsed
//! after it waits in the *backlog* until the worker is done.
//!
//! The worker appends its reply to the shared output buffer. If the next
//! backlog command also needs a worker it dispatches that one directly,
//! otherwise it clears `active` and asks the loop to re-invoke the
//! connection with empty input (a *wake*), which flushes the output and
//! drains the backlog.
//!
//! State touched by both sides (`out`, `backlog`, `active`, `action`)
//! lives behind a [`SpinLock`]. Critical sections never run a command or
//! touch the socket.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use cmdpipe_core::error::Result;
use cmdpipe_core::{kdebug, ktrace, kwarn, Action, ConnKind, Durability, Job, SpinLock, Waker};
use cmdpipe_pool::WorkerPool;
use cmdpipe_resp::{parse_next, Reply};

use crate::command::{execute, CommandRef};
use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::transaction::TxState;

pub const ERR_BACKLOG_FILLED: &str = "ERR backlog filled";
pub const ERR_REQUEST_BUFFER_FILLED: &str = "ERR request buffer filled";

/// Opaque consensus-service handle carried for higher layers.
pub type RaftHandle = Arc<dyn Any + Send + Sync>;

/// A backlog entry. Refused commands keep their place as a counted run
/// so their errors go out in request order.
enum Pending {
    Command(CommandRef),
    Rejected(usize),
}

fn append_rejected(out: &mut Vec<u8>, n: usize) {
    for _ in 0..n {
        Reply::error(ERR_BACKLOG_FILLED).append_to(out);
    }
}

/// Lock-protected state shared with the worker running this connection.
#[derive(Default)]
struct State {
    out: Vec<u8>,
    backlog: VecDeque<Pending>,
    /// `Command` entries in `backlog`
    queued: usize,
    active: Option<CommandRef>,
    action: Action,
    closed: bool,
    kind: ConnKind,
    durability: Durability,
    raft: Option<RaftHandle>,
}

impl State {
    fn push_command(&mut self, cmd: CommandRef) {
        self.queued += 1;
        self.backlog.push_back(Pending::Command(cmd));
    }

    fn reject(&mut self, n: usize) {
        match self.backlog.back_mut() {
            Some(Pending::Rejected(m)) => *m += n,
            _ => self.backlog.push_back(Pending::Rejected(n)),
        }
    }

    fn clear_backlog(&mut self) {
        self.queued = 0;
        self.backlog.clear();
    }

    fn take_backlog(&mut self) -> VecDeque<Pending> {
        self.queued = 0;
        std::mem::take(&mut self.backlog)
    }

    /// Answer the refused commands at the head of the backlog.
    fn flush_rejected(&mut self) {
        while let Some(&Pending::Rejected(n)) = self.backlog.front() {
            self.backlog.pop_front();
            append_rejected(&mut self.out, n);
        }
    }

    /// Pop the head of the backlog if it needs a worker.
    fn pop_worker(&mut self) -> Option<CommandRef> {
        match self.backlog.front() {
            Some(Pending::Command(cmd)) if cmd.is_worker() => {}
            _ => return None,
        }
        match self.backlog.pop_front() {
            Some(Pending::Command(cmd)) => {
                self.queued -= 1;
                Some(cmd)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    commands: AtomicU64,
    worker_commands: AtomicU64,
    wakes: AtomicU64,
    ingress: AtomicU64,
    egress: AtomicU64,
    rejected: AtomicU64,
    worker_nanos: AtomicU64,
}

#[inline]
fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Snapshot of a connection's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStats {
    /// Commands run inline on the event loop
    pub commands: u64,
    /// Commands run on a worker
    pub worker_commands: u64,
    /// Empty-input re-invocations
    pub wakes: u64,
    pub ingress: u64,
    pub egress: u64,
    /// Commands refused because the backlog was full
    pub rejected: u64,
    /// Time spent inside worker commands
    pub worker_time: Duration,
    /// Lock acquisitions that found the lock held
    pub lock_misses: u64,
}

impl fmt::Display for ConnStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "commands={} worker={} wakes={} in={} out={} rejected={} worker_time={:?} lock_misses={}",
            self.commands,
            self.worker_commands,
            self.wakes,
            self.ingress,
            self.egress,
            self.rejected,
            self.worker_time,
            self.lock_misses,
        )
    }
}

struct Shared {
    id: u64,
    me: Weak<Shared>,
    state: SpinLock<State>,
    pool: WorkerPool,
    waker: Box<dyn Waker>,
    max_backlog: usize,
    counters: Counters,
}

impl Shared {
    /// Append to the backlog, refusing commands past `max_backlog`.
    fn enqueue<I>(&self, st: &mut State, items: I)
    where
        I: IntoIterator<Item = Pending>,
    {
        for item in items {
            match item {
                Pending::Rejected(n) => st.reject(n),
                Pending::Command(cmd) if st.queued < self.max_backlog => st.push_command(cmd),
                Pending::Command(_) => {
                    st.reject(1);
                    bump(&self.counters.rejected, 1);
                }
            }
        }
    }

    /// Move entries from `list` into the backlog while there is room,
    /// leaving the overflow in `list`.
    fn admit(&self, st: &mut State, list: &mut VecDeque<Pending>) {
        while let Some(item) = list.pop_front() {
            match item {
                Pending::Rejected(n) => st.reject(n),
                Pending::Command(cmd) if st.queued < self.max_backlog => st.push_command(cmd),
                item => {
                    list.push_front(item);
                    return;
                }
            }
        }
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            kwarn!("conn {}: wake failed: {}", self.id, e);
            self.state.lock().action = Action::Close;
        }
    }

    fn signal(&self, action: Action) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.closed {
                return Ok(());
            }
            st.action = action;
        }
        self.waker.wake()
    }

    fn stats(&self) -> ConnStats {
        let c = &self.counters;
        ConnStats {
            commands: c.commands.load(Ordering::Relaxed),
            worker_commands: c.worker_commands.load(Ordering::Relaxed),
            wakes: c.wakes.load(Ordering::Relaxed),
            ingress: c.ingress.load(Ordering::Relaxed),
            egress: c.egress.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            worker_time: Duration::from_nanos(c.worker_nanos.load(Ordering::Relaxed)),
            lock_misses: self.state.misses(),
        }
    }
}

impl Job for Shared {
    /// Runs the active command, then chains or wakes.
    fn run(&self) {
        let mut next = {
            let st = self.state.lock();
            if st.closed {
                return;
            }
            st.active.clone()
        };

        while let Some(cmd) = next.take() {
            let started = Instant::now();
            let reply = execute(&*cmd);
            bump(&self.counters.worker_commands, 1);
            bump(&self.counters.worker_nanos, started.elapsed().as_nanos() as u64);

            let mut st = self.state.lock();
            if st.closed {
                st.active = None;
                st.clear_backlog();
                return;
            }
            reply.append_to(&mut st.out);
            st.flush_rejected();

            if let Some(cmd) = st.pop_worker() {
                st.active = Some(cmd.clone());
                next = Some(cmd);
                drop(st);

                let Some(me) = self.me.upgrade() else {
                    continue;
                };
                match self.pool.dispatch(me) {
                    Ok(()) => return,
                    Err(e) => {
                        // no free worker: keep going on this one
                        ktrace!("conn {}: chain dispatch failed ({}), running in place", self.id, e);
                    }
                }
            } else {
                st.active = None;
                drop(st);
                self.wake();
            }
        }
    }
}

/// Cross-thread handle for signalling and inspecting a connection.
#[derive(Clone)]
pub struct ConnHandle(Arc<Shared>);

impl ConnHandle {
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Set `action` and wake the loop so it acts on it.
    pub fn signal(&self, action: Action) -> Result<()> {
        self.0.signal(action)
    }

    /// Flush pending output and close the socket.
    pub fn close(&self) -> Result<()> {
        self.signal(Action::Close)
    }

    /// Hand the socket to the server's detach handler.
    pub fn detach(&self) -> Result<()> {
        self.signal(Action::Detach)
    }

    pub fn action(&self) -> Action {
        self.0.state.lock().action
    }

    pub fn is_closed(&self) -> bool {
        self.0.state.lock().closed
    }

    /// A command is running on a worker.
    pub fn is_busy(&self) -> bool {
        self.0.state.lock().active.is_some()
    }

    pub fn backlog_len(&self) -> usize {
        self.0.state.lock().queued
    }

    pub fn kind(&self) -> ConnKind {
        self.0.state.lock().kind
    }

    pub fn set_kind(&self, kind: ConnKind) {
        self.0.state.lock().kind = kind;
    }

    pub fn durability(&self) -> Durability {
        self.0.state.lock().durability
    }

    pub fn set_durability(&self, durability: Durability) {
        self.0.state.lock().durability = durability;
    }

    pub fn raft(&self) -> Option<RaftHandle> {
        self.0.state.lock().raft.clone()
    }

    pub fn set_raft(&self, raft: Option<RaftHandle>) {
        self.0.state.lock().raft = raft;
    }

    pub fn stats(&self) -> ConnStats {
        self.0.stats()
    }

    pub fn lock_misses(&self) -> u64 {
        self.0.state.misses()
    }
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnHandle").field("id", &self.0.id).finish()
    }
}

/// Event-loop side of a connection.
pub struct Conn {
    id: u64,
    /// Unparsed tail of the last read. Only the event loop touches it.
    input: Vec<u8>,
    tx: TxState,
    registry: Arc<Registry>,
    max_request_buffer: usize,
    shared: Arc<Shared>,
}

impl Conn {
    pub fn new(
        id: u64,
        registry: Arc<Registry>,
        pool: WorkerPool,
        waker: Box<dyn Waker>,
        config: &ServerConfig,
    ) -> Self {
        let shared = Arc::new_cyclic(|me| Shared {
            id,
            me: me.clone(),
            state: SpinLock::new(State::default()),
            pool,
            waker,
            max_backlog: config.max_backlog,
            counters: Counters::default(),
        });
        Self {
            id,
            input: Vec::new(),
            tx: TxState::default(),
            registry,
            max_request_buffer: config.max_request_buffer,
            shared,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> ConnHandle {
        ConnHandle(Arc::clone(&self.shared))
    }

    /// Swap the command registry, returning the previous one.
    pub fn set_registry(&mut self, registry: Arc<Registry>) -> Arc<Registry> {
        std::mem::replace(&mut self.registry, registry)
    }

    pub fn in_multi(&self) -> bool {
        self.tx.in_multi()
    }

    /// Bytes of partial request held between reads.
    pub fn buffered(&self) -> usize {
        self.input.len()
    }

    pub fn stats(&self) -> ConnStats {
        self.shared.stats()
    }

    /// Feed bytes read from the socket, or nothing on a wake.
    ///
    /// Returns the bytes to write and what the loop should do next.
    /// Never blocks on a command.
    pub fn on_data(&mut self, input: &[u8]) -> (Vec<u8>, Action) {
        if input.is_empty() {
            return self.on_wake();
        }
        bump(&self.shared.counters.ingress, input.len() as u64);

        {
            let mut st = self.shared.state.lock();
            if st.closed || st.action.is_terminal() {
                let action = st.action;
                return (std::mem::take(&mut st.out), action);
            }
        }

        let (cmds, framing) = self.parse_input(input);

        let cmds = cmds.into_iter().map(Pending::Command);
        let mut st = self.shared.state.lock();
        let mut out = std::mem::take(&mut st.out);
        if st.active.is_some() {
            self.shared.enqueue(&mut st, cmds);
            drop(st);
        } else {
            let mut list = st.take_backlog();
            drop(st);
            list.extend(cmds);
            self.drain(&mut out, list);
        }

        if let Some(err) = framing {
            kdebug!("conn {}: {}", self.id, err);
            Reply::error(err).append_to(&mut out);
            self.shared.state.lock().action = Action::Close;
        }
        self.finish(out)
    }

    fn on_wake(&mut self) -> (Vec<u8>, Action) {
        bump(&self.shared.counters.wakes, 1);

        let mut st = self.shared.state.lock();
        let mut out = std::mem::take(&mut st.out);
        if st.active.is_some() || st.closed || st.action.is_terminal() {
            drop(st);
            return self.finish(out);
        }
        let list = st.take_backlog();
        drop(st);

        self.drain(&mut out, list);
        self.finish(out)
    }

    fn finish(&self, out: Vec<u8>) -> (Vec<u8>, Action) {
        bump(&self.shared.counters.egress, out.len() as u64);
        let action = self.shared.state.lock().action;
        (out, action)
    }

    /// Run `list` inline until a worker command, then dispatch it and
    /// park the rest in the backlog.
    ///
    /// Commands past `max_backlog` are only refused once the dispatch has
    /// succeeded; if it fails they run inline like the rest.
    fn drain(&self, out: &mut Vec<u8>, mut list: VecDeque<Pending>) {
        let shared = &self.shared;
        while let Some(item) = list.pop_front() {
            let cmd = match item {
                Pending::Rejected(n) => {
                    append_rejected(out, n);
                    continue;
                }
                Pending::Command(cmd) => cmd,
            };
            if !cmd.is_worker() {
                bump(&shared.counters.commands, 1);
                execute(&*cmd).append_to(out);
                continue;
            }

            {
                let mut st = shared.state.lock();
                if st.closed {
                    return;
                }
                st.active = Some(cmd);
                shared.admit(&mut st, &mut list);
            }

            let job: Arc<dyn Job> = Arc::clone(shared) as Arc<dyn Job>;
            match shared.pool.dispatch(job) {
                Ok(()) => {
                    if !list.is_empty() {
                        let mut st = shared.state.lock();
                        if !st.closed {
                            shared.enqueue(&mut st, list.drain(..));
                        }
                    }
                    return;
                }
                Err(e) => {
                    kwarn!("conn {}: dispatch failed: {}", self.id, e);
                    let mut st = shared.state.lock();
                    st.active = None;
                    let mut rest = st.take_backlog();
                    drop(st);
                    rest.append(&mut list);
                    list = rest;
                    Reply::error(format!("ERR {}", e)).append_to(out);
                }
            }
        }
    }

    /// Parse every complete request, keeping any partial tail.
    fn parse_input(&mut self, input: &[u8]) -> (Vec<CommandRef>, Option<String>) {
        let mut cmds = Vec::new();
        let framing = if self.input.is_empty() {
            let (used, err) = self.parse_frames(input, &mut cmds);
            if err.is_none() {
                self.input.extend_from_slice(&input[used..]);
            }
            err
        } else {
            let mut buf = std::mem::take(&mut self.input);
            buf.extend_from_slice(input);
            let (used, err) = self.parse_frames(&buf, &mut cmds);
            buf.drain(..used);
            self.input = buf;
            err
        };

        let framing = framing.or_else(|| {
            (self.input.len() > self.max_request_buffer)
                .then(|| ERR_REQUEST_BUFFER_FILLED.to_string())
        });
        if framing.is_some() {
            self.input.clear();
        }
        (cmds, framing)
    }

    fn parse_frames(&mut self, buf: &[u8], cmds: &mut Vec<CommandRef>) -> (usize, Option<String>) {
        let mut pos = 0;
        loop {
            match parse_next(&buf[pos..]) {
                Ok(Some(frame)) => {
                    pos += frame.consumed;
                    if frame.is_empty() {
                        continue;
                    }
                    let args = frame.arg_slices();
                    cmds.push(self.tx.resolve(&self.registry, &args));
                }
                Ok(None) => return (pos, None),
                Err(e) => return (pos, Some(format!("ERR {}", e))),
            }
        }
    }

    /// The socket is gone. An in-flight worker finishes but writes nothing.
    pub fn on_closed(&mut self) {
        {
            let mut st = self.shared.state.lock();
            st.closed = true;
            st.action = Action::Close;
            st.active = None;
            st.clear_backlog();
            st.out.clear();
        }
        self.input.clear();
        kdebug!("conn {} closed: {}", self.id, self.stats());
    }

    /// See [`ConnHandle::close`].
    pub fn close(&self) -> Result<()> {
        self.shared.signal(Action::Close)
    }

    /// See [`ConnHandle::detach`].
    pub fn detach(&self) -> Result<()> {
        self.shared.signal(Action::Detach)
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("buffered", &self.input.len())
            .field("multi", &self.tx.in_multi())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::Keyspace;
    use cmdpipe_core::PipeError;
    use cmdpipe_core::{set_log_level, LogLevel};
    use cmdpipe_resp::{append_command, ReplyReader};
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    struct TestWaker(mpsc::Sender<()>);

    impl Waker for TestWaker {
        fn wake(&self) -> Result<()> {
            self.0.send(()).map_err(|_| PipeError::WakeFailed(0))
        }
    }

    struct FailingWaker;

    impl Waker for FailingWaker {
        fn wake(&self) -> Result<()> {
            Err(PipeError::WakeFailed(9))
        }
    }

    struct Harness {
        conn: Conn,
        wakes: mpsc::Receiver<()>,
        pool: WorkerPool,
        keyspace: Arc<Keyspace>,
        reader: ReplyReader,
        action: Action,
    }

    fn harness_with(config: ServerConfig, pool: WorkerPool) -> Harness {
        set_log_level(LogLevel::Off);
        let keyspace = Arc::new(Keyspace::new());
        keyspace.set(b"hi", b"there");
        let registry = Arc::new(Registry::with_builtins(&keyspace).unwrap());
        let (tx, rx) = mpsc::channel();
        let conn = Conn::new(1, registry, pool.clone(), Box::new(TestWaker(tx)), &config);
        Harness {
            conn,
            wakes: rx,
            pool,
            keyspace,
            reader: ReplyReader::new(),
            action: Action::None,
        }
    }

    fn harness() -> Harness {
        harness_with(ServerConfig::new(), WorkerPool::with_bounds(0, 0).unwrap())
    }

    fn packet(cmds: &[&[&str]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for args in cmds {
            append_command(&mut buf, args);
        }
        buf
    }

    impl Harness {
        fn feed(&mut self, bytes: &[u8]) -> Vec<Reply> {
            let (out, action) = self.conn.on_data(bytes);
            self.action = action;
            self.reader.feed(&out);
            let mut replies = Vec::new();
            while let Some(reply) = self.reader.next_reply().unwrap() {
                replies.push(reply);
            }
            replies
        }

        fn send(&mut self, cmds: &[&[&str]]) -> Vec<Reply> {
            self.feed(&packet(cmds))
        }

        /// Wait for the worker's wake, then re-invoke like the loop would.
        fn wait_wake(&mut self) -> Vec<Reply> {
            self.wakes.recv_timeout(WAIT).expect("no wake");
            self.feed(&[])
        }

        fn no_wake_within(&self, d: Duration) -> bool {
            self.wakes.recv_timeout(d).is_err()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.pool.stop();
        }
    }

    #[test]
    fn test_inline_commands_reply_immediately() {
        let mut h = harness();
        let replies = h.send(&[&["PING"], &["SET", "a", "1"], &["GET", "a"], &["DEL", "a", "b"]]);
        assert_eq!(replies, vec![Reply::pong(), Reply::ok(), Reply::bulk("1"), Reply::Int(1)]);
        assert_eq!(h.action, Action::None);
        assert!(h.no_wake_within(Duration::from_millis(50)));
        assert_eq!(h.conn.stats().commands, 4);
    }

    #[test]
    fn test_fifo_across_worker_commands() {
        let mut h = harness();
        let first = h.send(&[
            &["GET", "hi"],
            &["SLEEP", "50"],
            &["SLEEP", "50"],
            &["GET", "hi"],
            &["GET", "hi"],
        ]);
        // nothing after the first worker command is answered yet
        assert_eq!(first, vec![Reply::bulk("there")]);
        assert!(h.conn.handle().is_busy());
        assert_eq!(h.conn.handle().backlog_len(), 3);

        let rest = h.wait_wake();
        assert_eq!(rest, vec![Reply::ok(), Reply::ok(), Reply::bulk("there"), Reply::bulk("there")]);
        assert!(!h.conn.handle().is_busy());
    }

    #[test]
    fn test_worker_chain_wakes_once() {
        let mut h = harness();
        let cmds: Vec<&[&str]> = vec![&["SLEEP", "10"]; 5];
        assert!(h.send(&cmds).is_empty());

        let replies = h.wait_wake();
        assert_eq!(replies, vec![Reply::ok(); 5]);
        assert!(h.no_wake_within(Duration::from_millis(100)));

        let stats = h.conn.stats();
        assert_eq!(stats.worker_commands, 5);
        assert_eq!(stats.wakes, 1);
        assert!(stats.worker_time >= Duration::from_millis(50));
    }

    #[test]
    fn test_reads_during_worker_are_backlogged() {
        let mut h = harness();
        assert!(h.send(&[&["SLEEP", "100"]]).is_empty());
        assert!(h.send(&[&["GET", "hi"], &["PING"]]).is_empty());
        assert_eq!(h.conn.handle().backlog_len(), 2);

        let replies = h.wait_wake();
        assert_eq!(replies, vec![Reply::ok(), Reply::bulk("there"), Reply::pong()]);
    }

    #[test]
    fn test_backlog_overflow_rejects_excess() {
        let mut h = harness_with(
            ServerConfig::new().max_backlog(2),
            WorkerPool::with_bounds(0, 0).unwrap(),
        );
        let early = h.send(&[
            &["SLEEP", "50"],
            &["GET", "x"],
            &["GET", "y"],
            &["GET", "z"],
            &["GET", "w"],
        ]);
        assert!(early.is_empty());
        assert_eq!(h.conn.handle().backlog_len(), 2);

        // also applies to reads arriving while the worker runs
        assert!(h.send(&[&["PING"]]).is_empty());

        assert_eq!(h.wait_wake(), vec![
            Reply::ok(),
            Reply::Null,
            Reply::Null,
            Reply::error(ERR_BACKLOG_FILLED),
            Reply::error(ERR_BACKLOG_FILLED),
            Reply::error(ERR_BACKLOG_FILLED),
        ]);
        assert_eq!(h.conn.stats().rejected, 3);
    }

    #[test]
    fn test_backlog_overflow_keeps_reply_order() {
        let mut h = harness_with(
            ServerConfig::new().max_backlog(1),
            WorkerPool::with_bounds(0, 0).unwrap(),
        );
        assert!(h.send(&[&["SLEEP", "30"], &["ECHO", "a"], &["ECHO", "b"]]).is_empty());
        assert_eq!(h.wait_wake(), vec![
            Reply::ok(),
            Reply::bulk("a"),
            Reply::error(ERR_BACKLOG_FILLED),
        ]);
    }

    #[test]
    fn test_rejections_between_chained_workers() {
        let mut h = harness_with(
            ServerConfig::new().max_backlog(1),
            WorkerPool::with_bounds(0, 0).unwrap(),
        );
        assert!(h.send(&[&["SLEEP", "20"], &["SLEEP", "20"], &["ECHO", "a"]]).is_empty());
        assert_eq!(h.wait_wake(), vec![
            Reply::ok(),
            Reply::ok(),
            Reply::error(ERR_BACKLOG_FILLED),
        ]);
        assert!(h.no_wake_within(Duration::from_millis(50)));

        // room again once the chain is done
        assert_eq!(h.send(&[&["ECHO", "b"]]), vec![Reply::bulk("b")]);
        assert_eq!(h.conn.handle().backlog_len(), 0);
    }

    #[test]
    fn test_multi_exec() {
        let mut h = harness();
        h.keyspace.set(b"a", b"1");
        h.keyspace.set(b"b", b"2");
        let replies = h.send(&[&["MULTI"], &["GET", "a"], &["GET", "b"], &["EXEC"]]);
        assert_eq!(replies, vec![
            Reply::ok(),
            Reply::queued(),
            Reply::queued(),
            Reply::Array(vec![Reply::bulk("1"), Reply::bulk("2")]),
        ]);

        let replies = h.send(&[&["MULTI"], &["GET", "a"], &["DISCARD"], &["EXEC"]]);
        assert_eq!(replies, vec![
            Reply::ok(),
            Reply::queued(),
            Reply::ok(),
            Reply::error("ERR no transaction"),
        ]);
        assert!(!h.conn.in_multi());
    }

    #[test]
    fn test_multi_split_across_reads() {
        let mut h = harness();
        assert_eq!(h.send(&[&["MULTI"]]), vec![Reply::ok()]);
        assert!(h.conn.in_multi());
        assert_eq!(h.send(&[&["SET", "k", "v"]]), vec![Reply::queued()]);
        assert_eq!(h.send(&[&["EXEC"]]), vec![Reply::Array(vec![Reply::ok()])]);
        assert_eq!(h.keyspace.get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_exec_with_worker_command_runs_in_background() {
        let mut h = harness();
        let early = h.send(&[
            &["MULTI"],
            &["SET", "k", "v"],
            &["SLEEP", "10"],
            &["EXEC"],
            &["GET", "k"],
        ]);
        assert_eq!(early, vec![Reply::ok(), Reply::queued(), Reply::queued()]);

        let rest = h.wait_wake();
        assert_eq!(rest, vec![
            Reply::Array(vec![Reply::ok(), Reply::ok()]),
            Reply::bulk("v"),
        ]);
    }

    #[test]
    fn test_partial_requests_are_buffered() {
        let mut h = harness();
        let bytes = packet(&[&["ECHO", "hello world"], &["PING"]]);
        let (a, rest) = bytes.split_at(5);
        let (b, c) = rest.split_at(12);

        assert!(h.feed(a).is_empty());
        assert_eq!(h.conn.buffered(), 5);
        assert!(h.feed(b).is_empty());
        assert_eq!(h.feed(c), vec![Reply::bulk("hello world"), Reply::pong()]);
        assert_eq!(h.conn.buffered(), 0);
    }

    #[test]
    fn test_inline_protocol() {
        let mut h = harness();
        let replies = h.feed(b"PING\r\nSET greeting \"hello there\"\r\nGET greeting\r\n\r\n");
        assert_eq!(replies, vec![Reply::pong(), Reply::ok(), Reply::bulk("hello there")]);
    }

    #[test]
    fn test_unknown_command_keeps_pipeline() {
        let mut h = harness();
        let replies = h.send(&[&["NOPE", "x"], &["PING"]]);
        assert_eq!(replies, vec![Reply::error("ERR command 'NOPE' not found"), Reply::pong()]);
        assert_eq!(h.action, Action::None);
    }

    #[test]
    fn test_framing_error_closes() {
        let mut h = harness();
        let mut bytes = packet(&[&["PING"]]);
        bytes.extend_from_slice(b"*1\r\n:oops\r\n");
        let replies = h.feed(&bytes);
        assert_eq!(replies, vec![
            Reply::pong(),
            Reply::error("ERR Protocol error: expected '$', got ':'"),
        ]);
        assert_eq!(h.action, Action::Close);

        // later reads are not parsed
        assert!(h.send(&[&["PING"]]).is_empty());
        assert_eq!(h.action, Action::Close);
    }

    #[test]
    fn test_request_buffer_limit() {
        let mut h = harness_with(
            ServerConfig::new().max_request_buffer(16),
            WorkerPool::with_bounds(0, 0).unwrap(),
        );
        let replies = h.feed(b"*1\r\n$100\r\n0123456789abcdef");
        assert_eq!(replies, vec![Reply::error(ERR_REQUEST_BUFFER_FILLED)]);
        assert_eq!(h.action, Action::Close);
        assert_eq!(h.conn.buffered(), 0);
    }

    #[test]
    fn test_closed_conn_worker_noops() {
        let mut h = harness();
        assert!(h.send(&[&["SLEEP", "50"], &["PING"]]).is_empty());
        h.conn.on_closed();
        assert!(h.conn.handle().is_closed());
        assert!(h.no_wake_within(Duration::from_millis(200)));

        let (out, action) = h.conn.on_data(b"PING\r\n");
        assert!(out.is_empty());
        assert_eq!(action, Action::Close);
    }

    #[test]
    fn test_dispatch_failure_replies_error() {
        let pool = WorkerPool::with_bounds(0, 0).unwrap();
        pool.stop();
        let mut h = harness_with(ServerConfig::new(), pool);
        let replies = h.send(&[&["SLEEP", "1"], &["GET", "hi"]]);
        assert_eq!(replies, vec![
            Reply::error("ERR worker pool closed"),
            Reply::bulk("there"),
        ]);
        assert!(!h.conn.handle().is_busy());
    }

    #[test]
    fn test_dispatch_failure_ignores_backlog_limit() {
        let pool = WorkerPool::with_bounds(0, 0).unwrap();
        pool.stop();
        let mut h = harness_with(ServerConfig::new().max_backlog(1), pool);
        let replies = h.send(&[&["SLEEP", "1"], &["ECHO", "a"], &["ECHO", "b"]]);
        assert_eq!(replies, vec![
            Reply::error("ERR worker pool closed"),
            Reply::bulk("a"),
            Reply::bulk("b"),
        ]);
        assert_eq!(h.conn.stats().rejected, 0);
        assert_eq!(h.conn.handle().backlog_len(), 0);
    }

    #[test]
    fn test_chain_falls_back_when_pool_is_full() {
        // one worker: the chained SLEEP cannot get a second one
        let mut h = harness_with(ServerConfig::new(), WorkerPool::with_bounds(0, 1).unwrap());
        assert!(h.send(&[&["SLEEP", "5"], &["SLEEP", "5"], &["PING"]]).is_empty());
        assert_eq!(h.wait_wake(), vec![Reply::ok(), Reply::ok(), Reply::pong()]);
        assert!(h.no_wake_within(Duration::from_millis(50)));
    }

    #[test]
    fn test_close_and_detach_signal_the_loop() {
        let mut h = harness();
        let handle = h.conn.handle();

        handle.detach().unwrap();
        h.wakes.recv_timeout(WAIT).unwrap();
        assert_eq!(h.conn.on_data(&[]).1, Action::Detach);

        h.conn.close().unwrap();
        h.wakes.recv_timeout(WAIT).unwrap();
        assert_eq!(h.conn.on_data(&[]).1, Action::Close);
    }

    #[test]
    fn test_wake_failure_closes() {
        set_log_level(LogLevel::Off);
        let keyspace = Arc::new(Keyspace::new());
        let registry = Arc::new(Registry::with_builtins(&keyspace).unwrap());
        let pool = WorkerPool::with_bounds(0, 0).unwrap();
        let mut conn = Conn::new(7, registry, pool.clone(), Box::new(FailingWaker), &ServerConfig::new());
        let handle = conn.handle();

        let (out, action) = conn.on_data(&packet(&[&["SLEEP", "1"]]));
        assert!(out.is_empty());
        assert_eq!(action, Action::None);

        let deadline = Instant::now() + WAIT;
        while handle.action() != Action::Close {
            assert!(Instant::now() < deadline, "wake failure never closed the connection");
            std::thread::sleep(Duration::from_millis(1));
        }
        pool.stop();
    }

    #[test]
    fn test_pass_through_state() {
        let mut h = harness();
        let handle = h.conn.handle();
        assert_eq!(handle.kind(), ConnKind::Command);
        handle.set_kind(ConnKind::PubSub);
        handle.set_durability(Durability::High);
        handle.set_raft(Some(Arc::new(42u32)));
        assert_eq!(handle.kind(), ConnKind::PubSub);
        assert_eq!(handle.durability(), Durability::High);
        let raft = handle.raft().unwrap();
        assert_eq!(raft.downcast_ref::<u32>(), Some(&42));

        let empty = Arc::new(Registry::new());
        let previous = h.conn.set_registry(empty);
        assert_eq!(previous.len(), 6);
        assert!(h.send(&[&["PING"]])[0].is_error());
    }
}
