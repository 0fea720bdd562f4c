//! Seams between the pipeline, the worker pool and the reactor

use crate::error::Result;

/// A unit of work handed to a background worker.
///
/// **Contract:**
/// - `run()` may block for as long as the work takes.
/// - The same job may be dispatched again from inside its own `run()`.
pub trait Job: Send + Sync {
    fn run(&self);
}

impl<F> Job for F
where
    F: Fn() + Send + Sync,
{
    #[inline]
    fn run(&self) {
        self()
    }
}

/// Asks a reactor to re-invoke a connection with empty input.
///
/// **Contract:**
/// - `wake()` must NEVER block.
/// - Multiple wakes before the reactor gets to the connection may be
///   coalesced into a single re-invocation.
pub trait Waker: Send + Sync {
    fn wake(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_closure_is_job() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let job: Arc<dyn Job> = Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        job.run();
        job.run();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
