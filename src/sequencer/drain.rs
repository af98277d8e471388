//! The drain loop.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use super::{SenderKey, Sequencer};
use crate::error::TaskError;

/// Unit of work run by the drain loop for each dequeued task.
#[async_trait]
pub trait TaskProcessor<T: Send + 'static>: Send + Sync {
    /// Process one task to completion. Errors are logged by the drain loop
    /// and never stop it.
    async fn process(&self, key: &SenderKey, task: T) -> Result<(), TaskError>;
}

/// Outcome of one drain loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks taken off the queue (including failed ones).
    pub processed: usize,
    /// Tasks whose processor returned an error or panicked.
    pub failed: usize,
}

impl<T: Send + 'static> Sequencer<T> {
    /// Process `key`'s queue until it is empty, then release the lock.
    ///
    /// Must only be called by the holder of [`Admission::Drain`](super::Admission::Drain)
    /// for `key`. Each task is awaited to completion before the next is
    /// popped.
    pub async fn drain<P>(&self, key: &SenderKey, processor: &P) -> DrainReport
    where
        P: TaskProcessor<T> + ?Sized,
    {
        let mut report = DrainReport::default();
        debug!(key = %key, "Drain loop started");

        while let Some(task) = self.take_next(key) {
            report.processed += 1;

            let outcome = AssertUnwindSafe(processor.process(key, task))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(key = %key, error = %e, "Task failed; continuing with queue");
                }
                Err(panic) => {
                    report.failed += 1;
                    let e = TaskError::Panicked(panic_message(panic.as_ref()));
                    warn!(key = %key, error = %e, "Task panicked; continuing with queue");
                }
            }
        }

        debug!(
            key = %key,
            processed = report.processed,
            failed = report.failed,
            "Drain loop finished; lock released"
        );
        report
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
