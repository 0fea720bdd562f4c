//! One epoll-driven reactor thread.
//!
//! Every loop accepts from its own clone of the listener, owns the
//! connections it accepted, and never blocks outside `epoll_wait`.
//! Workers reach a loop only through its wake queue: they push a slot key
//! and poke the loop's eventfd, and the loop re-invokes
//! [`Conn::on_data`] with empty input for every key still alive.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use cmdpipe_core::error::Result;
use cmdpipe_core::{kdebug, kerror, kinfo, ktrace, kwarn, Action, Waker};
use cmdpipe_pool::WorkerPool;

use crate::config::ServerConfig;
use crate::conn::Conn;
use crate::registry::Registry;
use crate::server::ServerShared;
use crate::sys::{Epoll, EventFd};

const TOKEN_LISTENER: u64 = 0;
const TOKEN_WAKE: u64 = 1;
const TOKEN_CONN_BASE: u64 = 2;

const MAX_EVENTS: usize = 256;
/// Upper bound on how long a stop request can go unnoticed.
const POLL_TIMEOUT_MS: i32 = 100;

const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;
const CLOSE_EVENTS: u32 = (libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLRDHUP) as u32;

/// Epoll interest for a connection. A closing one only waits to drain.
#[inline]
fn interest(closing: bool, has_pending: bool) -> u32 {
    match (closing, has_pending) {
        (true, _) => WRITE_EVENTS,
        (false, true) => READ_EVENTS | WRITE_EVENTS,
        (false, false) => READ_EVENTS,
    }
}

/// Slot index in the low half, slot generation in the high half.
#[inline]
fn pack(idx: usize, gen: u32) -> u64 {
    (u64::from(gen) << 32) | idx as u64
}

#[inline]
fn unpack(key: u64) -> (usize, u32) {
    ((key & 0xFFFF_FFFF) as usize, (key >> 32) as u32)
}

/// Routes a connection's wake requests to the loop that owns it.
struct LoopWaker {
    key: u64,
    queue: Arc<SegQueue<u64>>,
    eventfd: Arc<EventFd>,
}

impl Waker for LoopWaker {
    fn wake(&self) -> Result<()> {
        self.queue.push(self.key);
        self.eventfd.notify()
    }
}

/// What the loop does with a connection after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Keep,
    /// Flush pending output, then close.
    Close,
    /// Close without flushing; the peer is gone.
    Drop,
    Shutdown,
    Detach,
}

impl From<Action> for Next {
    fn from(action: Action) -> Self {
        match action {
            Action::None => Next::Keep,
            Action::Close => Next::Close,
            Action::Shutdown => Next::Shutdown,
            Action::Detach => Next::Detach,
        }
    }
}

struct Slot {
    stream: TcpStream,
    peer: SocketAddr,
    conn: Conn,
    /// Output the socket did not take yet.
    pending: Vec<u8>,
    /// Events currently registered with epoll.
    interest: u32,
    closing: bool,
}

impl Slot {
    fn ready(&mut self, events: u32, buf: &mut [u8]) -> Next {
        if events & WRITE_EVENTS != 0 {
            if let Err(e) = self.flush() {
                ktrace!("conn {}: write: {}", self.conn.id(), e);
                return Next::Drop;
            }
        }
        if self.closing {
            let gone = (libc::EPOLLHUP | libc::EPOLLERR) as u32;
            return if events & gone != 0 { Next::Drop } else { Next::Keep };
        }
        if events & (READ_EVENTS | CLOSE_EVENTS) == 0 {
            return Next::Keep;
        }

        match self.stream.read(buf) {
            Ok(0) => Next::Drop,
            Ok(n) => {
                let (out, action) = self.conn.on_data(&buf[..n]);
                self.output(out, action)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Next::Keep
            }
            Err(e) => {
                ktrace!("conn {}: read: {}", self.conn.id(), e);
                Next::Drop
            }
        }
    }

    fn wake(&mut self) -> Next {
        let (out, action) = self.conn.on_data(&[]);
        self.output(out, action)
    }

    fn output(&mut self, out: Vec<u8>, action: Action) -> Next {
        if !out.is_empty() {
            if self.pending.is_empty() {
                self.pending = out;
            } else {
                self.pending.extend_from_slice(&out);
            }
            if let Err(e) = self.flush() {
                ktrace!("conn {}: write: {}", self.conn.id(), e);
                return Next::Drop;
            }
        }
        Next::from(action)
    }

    /// Write as much pending output as the socket takes.
    fn flush(&mut self) -> io::Result<()> {
        let mut written = 0;
        while written < self.pending.len() {
            match self.stream.write(&self.pending[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.pending.drain(..written);
        Ok(())
    }
}

/// Connection slots with a free list. A slot's generation moves on every
/// removal so stale wake keys are ignored.
#[derive(Default)]
struct ConnSlab {
    slots: Vec<Option<Slot>>,
    gens: Vec<u32>,
    free: Vec<usize>,
}

impl ConnSlab {
    /// Key the next `insert` will use.
    fn next_key(&self) -> u64 {
        match self.free.last() {
            Some(&idx) => pack(idx, self.gens[idx]),
            None => pack(self.slots.len(), 0),
        }
    }

    fn insert(&mut self, slot: Slot) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.gens.push(0);
                self.slots.len() - 1
            }
        }
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut Slot> {
        self.slots.get_mut(idx)?.as_mut()
    }

    fn get_live(&mut self, key: u64) -> Option<&mut Slot> {
        let (idx, gen) = unpack(key);
        if self.gens.get(idx) != Some(&gen) {
            return None;
        }
        self.get_mut(idx)
    }

    fn remove(&mut self, idx: usize) -> Option<Slot> {
        let slot = self.slots.get_mut(idx)?.take()?;
        self.gens[idx] = self.gens[idx].wrapping_add(1);
        self.free.push(idx);
        Some(slot)
    }

    fn active(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    fn indices(&self) -> Vec<usize> {
        (0..self.slots.len()).filter(|&i| self.slots[i].is_some()).collect()
    }
}

pub(crate) struct EventLoop {
    index: usize,
    epoll: Epoll,
    listener: TcpListener,
    eventfd: Arc<EventFd>,
    wakes: Arc<SegQueue<u64>>,
    conns: ConnSlab,
    registry: Arc<Registry>,
    pool: WorkerPool,
    config: Arc<ServerConfig>,
    shared: Arc<ServerShared>,
    buf: Vec<u8>,
}

impl EventLoop {
    pub fn new(
        index: usize,
        listener: TcpListener,
        eventfd: Arc<EventFd>,
        registry: Arc<Registry>,
        pool: WorkerPool,
        config: Arc<ServerConfig>,
        shared: Arc<ServerShared>,
    ) -> Result<Self> {
        let epoll = Epoll::new()?;
        epoll.add(
            listener.as_raw_fd(),
            (libc::EPOLLIN | libc::EPOLLEXCLUSIVE) as u32,
            TOKEN_LISTENER,
        )?;
        epoll.add(eventfd.fd(), libc::EPOLLIN as u32, TOKEN_WAKE)?;
        let buf = vec![0u8; config.read_buffer_size];
        Ok(Self {
            index,
            epoll,
            listener,
            eventfd,
            wakes: Arc::new(SegQueue::new()),
            conns: ConnSlab::default(),
            registry,
            pool,
            config,
            shared,
            buf,
        })
    }

    pub fn run(mut self) {
        kdebug!("event loop {} started", self.index);
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while self.shared.is_running() {
            let n = match self.epoll.wait(&mut events, POLL_TIMEOUT_MS) {
                Ok(n) => n,
                Err(e) => {
                    kerror!("event loop {}: epoll_wait: {}", self.index, e);
                    break;
                }
            };
            for ev in &events[..n] {
                let (token, flags) = (ev.u64, ev.events);
                match token {
                    TOKEN_LISTENER => self.accept(),
                    TOKEN_WAKE => self.drain_wakes(),
                    _ => self.conn_ready((token - TOKEN_CONN_BASE) as usize, flags),
                }
            }
        }

        let live = self.conns.active();
        for idx in self.conns.indices() {
            self.close(idx, true);
        }
        kdebug!("event loop {} stopped, closed {} connections", self.index, live);
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.register(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    kwarn!("event loop {}: accept: {}", self.index, e);
                    return;
                }
            }
        }
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            kwarn!("event loop {}: set_nonblocking({}): {}", self.index, peer, e);
            return;
        }
        let _ = stream.set_nodelay(true);

        let id = self.shared.next_conn_id();
        let waker = LoopWaker {
            key: self.conns.next_key(),
            queue: Arc::clone(&self.wakes),
            eventfd: Arc::clone(&self.eventfd),
        };
        let conn = Conn::new(
            id,
            Arc::clone(&self.registry),
            self.pool.clone(),
            Box::new(waker),
            &self.config,
        );
        if let Some(hook) = &self.shared.hooks.on_open {
            hook(&conn.handle());
        }

        let fd = stream.as_raw_fd();
        let idx = self.conns.insert(Slot {
            stream,
            peer,
            conn,
            pending: Vec::new(),
            interest: READ_EVENTS,
            closing: false,
        });
        if let Err(e) = self.epoll.add(fd, READ_EVENTS, TOKEN_CONN_BASE + idx as u64) {
            kwarn!("event loop {}: register {}: {}", self.index, peer, e);
            if let Some(mut slot) = self.conns.remove(idx) {
                slot.conn.on_closed();
            }
            return;
        }
        self.shared.stats.accepts.fetch_add(1, Ordering::Relaxed);
        kdebug!("conn {} opened from {} on loop {}", id, peer, self.index);
    }

    fn conn_ready(&mut self, idx: usize, events: u32) {
        let next = match self.conns.get_mut(idx) {
            Some(slot) => slot.ready(events, &mut self.buf),
            None => return,
        };
        self.settle(idx, next);
    }

    fn drain_wakes(&mut self) {
        self.eventfd.drain();
        while let Some(key) = self.wakes.pop() {
            let next = match self.conns.get_live(key) {
                Some(slot) => slot.wake(),
                None => continue,
            };
            self.settle(unpack(key).0, next);
        }
    }

    fn settle(&mut self, idx: usize, next: Next) {
        match next {
            Next::Keep => {}
            Next::Close => {
                if let Some(slot) = self.conns.get_mut(idx) {
                    slot.closing = true;
                }
            }
            Next::Drop => return self.close(idx, false),
            Next::Shutdown => {
                kinfo!("shutdown requested by a client on loop {}", self.index);
                self.shared.stop();
                return self.close(idx, true);
            }
            Next::Detach => return self.detach(idx),
        }

        let Some(slot) = self.conns.get_mut(idx) else {
            return;
        };
        if slot.closing && slot.pending.is_empty() {
            return self.close(idx, false);
        }
        let events = interest(slot.closing, !slot.pending.is_empty());
        if events != slot.interest {
            let fd = slot.stream.as_raw_fd();
            slot.interest = events;
            if let Err(e) = self.epoll.modify(fd, events, TOKEN_CONN_BASE + idx as u64) {
                kwarn!("event loop {}: rearm conn {}: {}", self.index, slot.conn.id(), e);
                self.close(idx, false);
            }
        }
    }

    fn close(&mut self, idx: usize, flush: bool) {
        let Some(mut slot) = self.conns.remove(idx) else {
            return;
        };
        let _ = self.epoll.delete(slot.stream.as_raw_fd());
        if flush && !slot.pending.is_empty() {
            let _ = slot.flush();
        }
        slot.conn.on_closed();
        self.shared.stats.closes.fetch_add(1, Ordering::Relaxed);
        kdebug!("conn {} from {} closed", slot.conn.id(), slot.peer);
    }

    fn detach(&mut self, idx: usize) {
        let Some(mut slot) = self.conns.remove(idx) else {
            return;
        };
        let _ = self.epoll.delete(slot.stream.as_raw_fd());
        let id = slot.conn.id();
        slot.conn.on_closed();
        self.shared.stats.detaches.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = slot.stream.set_nonblocking(false) {
            kwarn!("conn {}: detach: {}", id, e);
            return;
        }
        if !slot.pending.is_empty() {
            if let Err(e) = slot.stream.write_all(&slot.pending) {
                kwarn!("conn {}: detach flush: {}", id, e);
                return;
            }
        }
        match &self.shared.hooks.on_detach {
            Some(hook) => hook(id, slot.stream),
            None => kdebug!("conn {} detached with no handler, dropping", id),
        }
    }
}
