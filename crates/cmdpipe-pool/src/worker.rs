//! A single long-lived worker thread.
//!
//! Each worker owns a one-slot job channel and runs at most one job at a
//! time. After a job finishes the worker flips back to `Idle` and parks
//! itself on its pool's idle queue for reuse.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Weak};

use cmdpipe_core::error::{PipeError, Result};
use cmdpipe_core::{kerror, ktrace, Job, SpinLock, WorkerState};

use crate::pool::PoolInner;

pub(crate) type JobSender = SyncSender<Arc<dyn Job>>;
pub(crate) type JobReceiver = Receiver<Arc<dyn Job>>;

pub struct Worker {
    id: u64,
    state: AtomicU8,
    pool: Weak<PoolInner>,
    jobs: SpinLock<Option<JobSender>>,
}

impl Worker {
    pub(crate) fn new(id: u64, pool: Weak<PoolInner>, jobs: JobSender) -> Self {
        Self {
            id,
            state: AtomicU8::new(WorkerState::Idle as u8),
            pool,
            jobs: SpinLock::new(Some(jobs)),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn cas_state(&self, old: WorkerState, new: WorkerState) -> bool {
        self.state
            .compare_exchange(old as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Hand a job to this worker. Fails unless the worker is idle.
    pub(crate) fn dispatch(&self, job: Arc<dyn Job>) -> Result<()> {
        if !self.cas_state(WorkerState::Idle, WorkerState::Active) {
            return Err(PipeError::WorkerBusy);
        }
        let jobs = self.jobs.lock();
        let Some(tx) = jobs.as_ref() else {
            return Err(PipeError::WorkerClosed);
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                drop(jobs);
                self.cas_state(WorkerState::Active, WorkerState::Idle);
                Err(PipeError::WorkerBusy)
            }
            Err(TrySendError::Disconnected(_)) => Err(PipeError::WorkerClosed),
        }
    }

    /// Close the job channel. The thread exits after its current job.
    pub(crate) fn stop(&self) {
        if !self.cas_state(WorkerState::Idle, WorkerState::Closing) {
            self.cas_state(WorkerState::Active, WorkerState::Closing);
        }
        self.jobs.lock().take();
    }

    /// Thread body.
    pub(crate) fn run(self: Arc<Self>, jobs: JobReceiver) {
        ktrace!("worker {} started", self.id);
        while let Ok(job) = jobs.recv() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
                kerror!("worker {}: job panicked: {}", self.id, panic_message(&*payload));
                if let Some(pool) = self.pool.upgrade() {
                    pool.note_panic();
                }
            }
            drop(job);

            if !self.cas_state(WorkerState::Active, WorkerState::Idle) {
                continue;
            }
            match self.pool.upgrade() {
                Some(pool) => pool.put(Arc::clone(&self)),
                None => break,
            }
        }
        self.state.store(WorkerState::Closed as u8, Ordering::Release);
        ktrace!("worker {} exited", self.id);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
