//! `WorkerPool`: bounded-growth manager of [`Worker`] threads.
//!
//! Idle workers sit on a lock-free queue and are reused first. On a miss a
//! new worker is forged under the pool mutex, unless `max` live workers
//! already exist. Workers are never retired individually; they all exit
//! on [`WorkerPool::stop`].

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;

use cmdpipe_core::error::{PipeError, Result};
use cmdpipe_core::{kdebug, kinfo, kwarn, Job, PoolState, WorkerState};

use crate::config::PoolConfig;
use crate::stats::{Counters, PoolStats};
use crate::worker::Worker;

/// Every worker ever forged, plus its thread handle.
#[derive(Default)]
struct Tracked {
    workers: Vec<Arc<Worker>>,
    handles: Vec<JoinHandle<()>>,
}

pub(crate) struct PoolInner {
    name: String,
    min: usize,
    max: usize,
    retry_delay: Duration,
    state: AtomicU8,
    idle: SegQueue<Arc<Worker>>,
    tracked: Mutex<Tracked>,
    closed: Mutex<bool>,
    closed_cv: Condvar,
    next_id: AtomicU64,
    counters: Counters,
}

impl PoolInner {
    #[inline]
    fn state(&self) -> PoolState {
        PoolState::from(self.state.load(Ordering::Acquire))
    }

    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return an idle worker to the reuse queue.
    pub(crate) fn put(&self, worker: Arc<Worker>) {
        if worker.state() != WorkerState::Idle || self.state() != PoolState::Active {
            return;
        }
        Counters::inc(&self.counters.puts);
        self.idle.push(worker);
    }

    pub(crate) fn note_panic(&self) {
        Counters::inc(&self.counters.panics);
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Last handle dropped without stop(): close every worker's channel so
        // its thread exits. Not joined; this may run on a worker thread.
        let tracked = std::mem::take(self.tracked.get_mut().unwrap_or_else(|e| e.into_inner()));
        if tracked.workers.is_empty() {
            return;
        }
        kdebug!("pool {} dropped with {} workers", self.name, tracked.workers.len());
        for worker in &tracked.workers {
            worker.stop();
        }
    }
}

/// Pool of reusable worker threads, one job per worker at a time.
///
/// Cheap to clone; all clones share the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool and pre-spawn `config.min` workers.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let max = config.effective_max();
        let pool = WorkerPool {
            inner: Arc::new(PoolInner {
                name: config.name,
                min: config.min,
                max,
                retry_delay: config.retry_delay,
                state: AtomicU8::new(PoolState::Active as u8),
                idle: SegQueue::new(),
                tracked: Mutex::new(Tracked::default()),
                closed: Mutex::new(false),
                closed_cv: Condvar::new(),
                next_id: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        };

        for _ in 0..pool.inner.min {
            let worker = pool.forge()?;
            pool.inner.put(worker);
        }
        kinfo!(
            "pool {} created: min={} max={}",
            pool.inner.name,
            pool.inner.min,
            if max == 0 { "unbounded".to_string() } else { max.to_string() }
        );
        Ok(pool)
    }

    /// Pool with default config and the given bounds.
    pub fn with_bounds(min: usize, max: usize) -> Result<Self> {
        Self::new(PoolConfig::new().min(min).max(max))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    /// Allocate an idle worker, reusing one if possible.
    pub fn get(&self) -> Result<Arc<Worker>> {
        Counters::inc(&self.inner.counters.gets);
        if self.inner.state() != PoolState::Active {
            return Err(PipeError::PoolClosed);
        }
        while let Some(worker) = self.inner.idle.pop() {
            if worker.state() == WorkerState::Idle {
                return Ok(worker);
            }
        }
        self.forge()
    }

    fn forge(&self) -> Result<Arc<Worker>> {
        let inner = &self.inner;
        let mut tracked = inner.tracked();
        if inner.state() != PoolState::Active {
            return Err(PipeError::PoolClosed);
        }

        let c = &inner.counters;
        let supply = c.supply.fetch_add(1, Ordering::Relaxed) + 1;
        if inner.max > 0 && supply > inner.max as u64 {
            c.supply.fetch_sub(1, Ordering::Relaxed);
            Counters::inc(&c.exhausted);
            kdebug!("pool {} exhausted at {} workers", inner.name, inner.max);
            return Err(PipeError::PoolExhausted);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = sync_channel(1);
        let worker = Arc::new(Worker::new(id, Arc::downgrade(inner), tx));
        let runner = Arc::clone(&worker);
        let handle = match thread::Builder::new()
            .name(format!("{}-{}", inner.name, id))
            .spawn(move || runner.run(rx))
        {
            Ok(h) => h,
            Err(e) => {
                c.supply.fetch_sub(1, Ordering::Relaxed);
                return Err(PipeError::Io(e));
            }
        };

        c.max_supply.fetch_max(supply, Ordering::Relaxed);
        Counters::inc(&c.forged);
        tracked.workers.push(Arc::clone(&worker));
        tracked.handles.push(handle);
        Ok(worker)
    }

    /// Run `job` on a worker.
    ///
    /// If no worker is available, sleeps `retry_delay` and tries once more.
    /// Never waits longer than that; the caller decides what to do on failure.
    pub fn dispatch(&self, job: Arc<dyn Job>) -> Result<()> {
        let worker = match self.get() {
            Ok(w) => w,
            Err(PipeError::PoolClosed) => return Err(PipeError::PoolClosed),
            Err(_) => {
                thread::sleep(self.inner.retry_delay);
                self.get().map_err(|e| {
                    kwarn!("pool {}: dispatch failed: {}", self.inner.name, e);
                    e
                })?
            }
        };
        worker.dispatch(job)
    }

    /// Close every worker and wait for all worker threads to exit.
    ///
    /// Safe to call more than once and from several threads; every call
    /// returns only after the pool reaches `Closed`.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(
                PoolState::Active as u8,
                PoolState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            let mut closed = inner.closed.lock().unwrap_or_else(|e| e.into_inner());
            while !*closed {
                closed = inner.closed_cv.wait(closed).unwrap_or_else(|e| e.into_inner());
            }
            return;
        }

        let Tracked { workers, handles } = std::mem::take(&mut *inner.tracked());
        for worker in &workers {
            worker.stop();
        }
        while inner.idle.pop().is_some() {}

        let me = thread::current().id();
        for handle in handles {
            // a job stopping its own pool cannot join itself
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        inner.counters.supply.store(0, Ordering::Relaxed);
        inner.state.store(PoolState::Closed as u8, Ordering::Release);

        let mut closed = inner.closed.lock().unwrap_or_else(|e| e.into_inner());
        *closed = true;
        inner.closed_cv.notify_all();
        drop(closed);

        kinfo!("pool {} stopped: {} workers joined", inner.name, workers.len());
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats::snapshot(
            &self.inner.name,
            self.inner.state(),
            &self.inner.counters,
            self.inner.idle.len(),
        )
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("min", &self.inner.min)
            .field("max", &self.inner.max)
            .field("state", &self.inner.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    fn counting_job(hits: &Arc<AtomicUsize>, done: &mpsc::Sender<()>) -> Arc<dyn Job> {
        let hits = Arc::clone(hits);
        let done = done.clone();
        Arc::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
            let _ = done.send(());
        })
    }

    #[test]
    fn test_dispatch_many_jobs() {
        let pool = WorkerPool::with_bounds(0, 1024).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        let mut dispatched = 0;
        for _ in 0..1000 {
            if pool.dispatch(counting_job(&hits, &tx)).is_ok() {
                dispatched += 1;
            }
        }
        assert_eq!(dispatched, 1000);
        for _ in 0..dispatched {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1000);

        let stats = pool.stats();
        assert!(stats.forged <= 1024);
        assert!(stats.forged >= 1);
        assert_eq!(stats.exhausted, 0);
        pool.stop();
    }

    #[test]
    fn test_workers_are_reused() {
        let pool = WorkerPool::with_bounds(0, 0).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..20 {
            pool.dispatch(counting_job(&hits, &tx)).unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
            // let the worker park itself on the idle queue
            let deadline = Instant::now() + Duration::from_secs(5);
            while pool.stats().idle == 0 && Instant::now() < deadline {
                thread::yield_now();
            }
        }
        assert_eq!(pool.stats().forged, 1);
        pool.stop();
    }

    #[test]
    fn test_exhaustion_fails_cleanly() {
        let pool = WorkerPool::new(PoolConfig::new().max(1)).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let (started_tx, started_rx) = mpsc::channel();

        let blocker: Arc<dyn Job> = Arc::new(move || {
            let _ = started_tx.send(());
            let _ = release_rx.lock().unwrap().recv();
        });
        pool.dispatch(blocker).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let start = Instant::now();
        let second: Arc<dyn Job> = Arc::new(|| {});
        assert!(matches!(pool.dispatch(second), Err(PipeError::PoolExhausted)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.stats().exhausted, 2);

        release_tx.send(()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let job: Arc<dyn Job> = Arc::new(|| {});
            if pool.dispatch(job).is_ok() {
                break;
            }
            assert!(Instant::now() < deadline, "worker never returned to the pool");
        }
        pool.stop();
    }

    #[test]
    fn test_min_prespawned() {
        let pool = WorkerPool::with_bounds(3, 2).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.forged, 3);
        assert_eq!(stats.supply, 3);
        assert_eq!(stats.idle, 3);
        pool.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let pool = WorkerPool::with_bounds(2, 0).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        pool.dispatch(counting_job(&hits, &tx)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let other = pool.clone();
        let t = thread::spawn(move || other.stop());
        pool.stop();
        t.join().unwrap();
        pool.stop();

        assert_eq!(pool.state(), PoolState::Closed);
        assert!(matches!(pool.dispatch(Arc::new(|| {})), Err(PipeError::PoolClosed)));
    }

    #[test]
    fn test_drop_without_stop_closes_workers() {
        let pool = WorkerPool::with_bounds(2, 0).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        drop(pool);

        let deadline = Instant::now() + Duration::from_secs(5);
        while a.state() != WorkerState::Closed || b.state() != WorkerState::Closed {
            assert!(Instant::now() < deadline, "workers outlived their pool");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let pool = WorkerPool::with_bounds(0, 1).unwrap();
        pool.dispatch(Arc::new(|| panic!("boom"))).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.dispatch(counting_job(&hits, &tx)).is_err() {
            assert!(Instant::now() < deadline);
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.panics, 1);
        assert_eq!(stats.forged, 1);
        pool.stop();
    }
}
