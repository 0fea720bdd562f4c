//! cmdpipe server
//!
//! Epoll event loops run inline commands; blocking commands (SLEEP, or an
//! EXEC containing one) go to a background worker pool. Replies on each
//! connection always come back in request order.
//!
//! Usage:
//!     cargo build --release -p cmdpiped
//!     ./target/release/cmdpiped [port] [event_loops]
//!
//! Every other setting comes from `CMDPIPE_*` environment variables, e.g.
//!     CMDPIPE_MAX_WORKERS=64 CMDPIPE_STATS_INTERVAL_SEC=5 ./target/release/cmdpiped
//!
//! Try it:
//!     printf 'PING\r\nSET k v\r\nSLEEP 100\r\nGET k\r\n' | nc -q1 localhost 9999

use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use cmdpipe_core::{kerror, kinfo, kprint, kwarn};
use cmdpipe_pool::WorkerPool;
use cmdpipe_server::{Keyspace, Registry, Server, ServerConfig};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_: c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

fn fail(what: &str, err: impl std::fmt::Display) -> ! {
    kerror!("cmdpiped: {}: {}", what, err);
    std::process::exit(1);
}

fn main() {
    kprint::init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::from_env();
    if let Some(port) = args.get(1).and_then(|s| s.parse().ok()) {
        config = config.port(port);
    }
    if let Some(n) = args.get(2).and_then(|s| s.parse().ok()) {
        config = config.event_loops(n);
    }

    if let Err(e) = install_signal_handlers() {
        kwarn!("cmdpiped: signal handlers not installed: {}", e);
    }

    let keyspace = Arc::new(Keyspace::new());
    let registry = match Registry::with_builtins(&keyspace) {
        Ok(r) => Arc::new(r),
        Err(e) => fail("registry", e),
    };
    let pool = match WorkerPool::new(config.pool_config()) {
        Ok(p) => p,
        Err(e) => fail("worker pool", e),
    };
    kinfo!("cmdpiped: commands {:?}", registry.names());

    let stats_interval = config.stats_interval;
    let server = match Server::start(config, registry, pool.clone()) {
        Ok(s) => s,
        Err(e) => fail("start", e),
    };

    let start = Instant::now();
    let mut last_stats = start;
    while RUNNING.load(Ordering::Relaxed) && server.is_running() {
        std::thread::sleep(Duration::from_millis(100));

        if let Some(every) = stats_interval {
            if last_stats.elapsed() >= every {
                kinfo!(
                    "[{:.1}s] {} keys={} | {}",
                    start.elapsed().as_secs_f64(),
                    server.stats(),
                    keyspace.len(),
                    pool.stats()
                );
                last_stats = Instant::now();
            }
        }
    }

    kinfo!("cmdpiped: shutting down...");
    server.shutdown();
    pool.stop();
    kinfo!("cmdpiped: done. {} | {}", server.stats(), pool.stats());
}
