//! Multi-loop TCP server.
//!
//! ```rust,ignore
//! let keyspace = Arc::new(Keyspace::new());
//! let registry = Arc::new(Registry::with_builtins(&keyspace)?);
//! let config = ServerConfig::from_env();
//! let pool = WorkerPool::new(config.pool_config())?;
//! let server = Server::start(config, registry, pool)?;
//! // ...
//! server.shutdown();
//! ```

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use cmdpipe_core::error::{PipeError, Result};
use cmdpipe_core::{kinfo, kwarn};
use cmdpipe_pool::WorkerPool;

use crate::config::ServerConfig;
use crate::conn::ConnHandle;
use crate::event_loop::EventLoop;
use crate::registry::Registry;
use crate::sys::EventFd;

/// Called on the owning loop for every accepted connection.
pub type OpenHandler = Arc<dyn Fn(&ConnHandle) + Send + Sync>;

/// Receives a detached socket, already in blocking mode.
pub type DetachHandler = Arc<dyn Fn(u64, TcpStream) + Send + Sync>;

/// Optional callbacks into the embedding application.
#[derive(Clone, Default)]
pub struct ServerHooks {
    pub on_open: Option<OpenHandler>,
    pub on_detach: Option<DetachHandler>,
}

impl ServerHooks {
    pub fn on_open(mut self, f: impl Fn(&ConnHandle) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_detach(mut self, f: impl Fn(u64, TcpStream) + Send + Sync + 'static) -> Self {
        self.on_detach = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    pub accepts: AtomicU64,
    pub closes: AtomicU64,
    pub detaches: AtomicU64,
}

/// Connection totals across all loops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepts: u64,
    pub closes: u64,
    pub detaches: u64,
}

impl ServerStats {
    /// Connections currently open.
    pub fn live(&self) -> u64 {
        self.accepts.saturating_sub(self.closes + self.detaches)
    }
}

impl fmt::Display for ServerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conns={} accepts={} closes={} detaches={}",
            self.live(),
            self.accepts,
            self.closes,
            self.detaches
        )
    }
}

/// State every loop shares with the server handle.
pub(crate) struct ServerShared {
    running: AtomicBool,
    next_id: AtomicU64,
    eventfds: Vec<Arc<EventFd>>,
    pub hooks: ServerHooks,
    pub stats: ServerCounters,
}

impl ServerShared {
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Ask every loop to exit.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            for efd in &self.eventfds {
                let _ = efd.notify();
            }
        }
    }
}

pub struct Server {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Bind and start `config.event_loops` loop threads.
    pub fn start(config: ServerConfig, registry: Arc<Registry>, pool: WorkerPool) -> Result<Self> {
        Self::start_with(config, registry, pool, ServerHooks::default())
    }

    pub fn start_with(
        config: ServerConfig,
        registry: Arc<Registry>,
        pool: WorkerPool,
        hooks: ServerHooks,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PipeError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let listener = TcpListener::bind(config.addr())?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let eventfds = (0..config.event_loops)
            .map(|_| EventFd::create().map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let shared = Arc::new(ServerShared {
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            eventfds: eventfds.clone(),
            hooks,
            stats: ServerCounters::default(),
        });

        let config = Arc::new(config);
        let mut loops = Vec::with_capacity(config.event_loops);
        for (i, efd) in eventfds.into_iter().enumerate() {
            loops.push(EventLoop::new(
                i,
                listener.try_clone()?,
                efd,
                Arc::clone(&registry),
                pool.clone(),
                Arc::clone(&config),
                Arc::clone(&shared),
            )?);
        }

        let mut threads = Vec::with_capacity(loops.len());
        for (i, lp) in loops.into_iter().enumerate() {
            let spawned = thread::Builder::new()
                .name(format!("cmdpipe-loop-{}", i))
                .spawn(move || lp.run());
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    shared.stop();
                    for t in threads {
                        let _ = t.join();
                    }
                    return Err(e.into());
                }
            }
        }

        kinfo!(
            "cmdpipe listening on {} ({} event loops, pool '{}')",
            local_addr,
            config.event_loops,
            pool.name()
        );
        Ok(Self {
            shared,
            local_addr,
            threads: Mutex::new(threads),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.shared.stats;
        ServerStats {
            accepts: c.accepts.load(Ordering::Relaxed),
            closes: c.closes.load(Ordering::Relaxed),
            detaches: c.detaches.load(Ordering::Relaxed),
        }
    }

    /// Stop all loops and wait for them. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shared.stop();
        let threads = match self.threads.lock() {
            Ok(mut t) => std::mem::take(&mut *t),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if threads.is_empty() {
            return;
        }
        let me = thread::current().id();
        for t in threads {
            if t.thread().id() == me {
                continue;
            }
            if t.join().is_err() {
                kwarn!("event loop thread panicked");
            }
        }
        kinfo!("cmdpipe on {} stopped: {}", self.local_addr, self.stats());
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
