use tokio::sync::mpsc;
use tracing::debug;

use crate::manager::Job;

/// Per-tag execution policy. The manager prepares each task as a [`Job`]
/// (the complete run wrapper, state handling included) and hands it over;
/// the scheduler only decides *when* the job reaches the worker budget.
/// Result, cancellation and error capture are untouched by scheduling.
pub trait TaskScheduler: Send + Sync + 'static {
    fn submit(&self, job: Job);
}

/// Serializes all tasks sharing its tag: strict submission order, one at a
/// time, however parallel the underlying pool is.
///
/// A single drain loop owns the queue, so a backlog of thousands of queued
/// same-tag tasks holds at most one worker slot; the rest wait in the queue
/// without consuming budget. Cancelling a queued task is observed when the
/// drain reaches it: the job returns immediately without running the body
/// and without blocking the tasks behind it.
pub struct SingleThreadedScheduler {
    queue: mpsc::UnboundedSender<Job>,
}

impl SingleThreadedScheduler {
    /// Spawns the drain loop on the current tokio runtime.
    pub fn new() -> Self {
        let (queue, mut jobs) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                job.await;
            }
            debug!("single-threaded scheduler drained and closed");
        });
        SingleThreadedScheduler { queue }
    }
}

impl Default for SingleThreadedScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler for SingleThreadedScheduler {
    fn submit(&self, job: Job) {
        // Send only fails once the drain loop is gone, i.e. runtime teardown.
        let _ = self.queue.send(job);
    }
}
