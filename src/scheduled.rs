use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TaskError;
use crate::manager::ExecutionManager;
use crate::task::current::scoped;
use crate::task::handle::TaskHandle;
use crate::task::state::{TaskId, TaskState};
use crate::task::typed::Task;

/// The narrow, synchronized control channel between a [`ScheduledTask`]'s
/// repetition loop and the sub-tasks it generates. A generated body may
/// reach this through its submitter and null out the period to stop the
/// repetition; the change is honored at the very next scheduling decision.
pub struct ScheduleControl {
    period: Mutex<Option<Duration>>,
    max_iterations: Mutex<Option<u32>>,
    cancel_on_error: AtomicBool,
    run_count: AtomicU32,
    token: CancellationToken,
}

impl ScheduleControl {
    pub fn period(&self) -> Option<Duration> {
        *self.lock_period()
    }

    /// Adjusts (or, with `None`, stops) the repetition from anywhere,
    /// including from inside a generated sub-task's own body.
    pub fn set_period(&self, period: Option<Duration>) {
        *self.lock_period() = period;
    }

    /// Number of completed iterations so far.
    pub fn run_count(&self) -> u32 {
        self.run_count.load(Ordering::SeqCst)
    }

    /// Cancels the owning scheduled task, stopping future iterations.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn max_iterations(&self) -> Option<u32> {
        *self.lock_max()
    }

    fn lock_period(&self) -> MutexGuard<'_, Option<Duration>> {
        self.period.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_max(&self) -> MutexGuard<'_, Option<u32>> {
        self.max_iterations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type TaskFactory<T> = Box<dyn FnMut() -> Task<T> + Send + 'static>;

enum LoopEnd {
    Cancelled,
    Errored(String),
    Exhausted,
}

/// A task whose body is a factory invoked after `delay` and then every
/// `period`, each invocation producing a fresh sub-task submitted back
/// through the manager as this task's child.
///
/// Iterations are anchored to the previous iteration's *scheduled* time: an
/// overlong body makes the next iteration start as soon as the previous one
/// ends, without overlap and without accumulating drift. Repetition stops
/// when the period is cleared, the iteration cap is reached, or the task is
/// cancelled. `get` then still returns the most recent iteration's result,
/// while `block_until_ended` waits for the repetition to stop definitively.
pub struct ScheduledTask<T> {
    handle: Arc<TaskHandle>,
    control: Arc<ScheduleControl>,
    delay: Duration,
    factory: Arc<Mutex<Option<TaskFactory<T>>>>,
    latest: Arc<Mutex<Option<Result<T, TaskError>>>>,
    recent_run: Arc<Mutex<Option<Task<T>>>>,
    iterations: Arc<watch::Sender<u32>>,
}

impl<T> Clone for ScheduledTask<T> {
    fn clone(&self) -> Self {
        ScheduledTask {
            handle: self.handle.clone(),
            control: self.control.clone(),
            delay: self.delay,
            factory: self.factory.clone(),
            latest: self.latest.clone(),
            recent_run: self.recent_run.clone(),
            iterations: self.iterations.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ScheduledTask<T> {
    pub fn new<F>(display_name: impl Into<String>, factory: F) -> Self
    where
        F: FnMut() -> Task<T> + Send + 'static,
    {
        let handle = TaskHandle::new(display_name, "");
        let control = Arc::new(ScheduleControl {
            period: Mutex::new(None),
            max_iterations: Mutex::new(None),
            cancel_on_error: AtomicBool::new(true),
            run_count: AtomicU32::new(0),
            token: handle.cancellation_token(),
        });
        handle.set_schedule_control(control.clone());
        let (iterations, _) = watch::channel(0);
        ScheduledTask {
            handle,
            control,
            delay: Duration::ZERO,
            factory: Arc::new(Mutex::new(Some(Box::new(factory)))),
            latest: Arc::new(Mutex::new(None)),
            recent_run: Arc::new(Mutex::new(None)),
            iterations: Arc::new(iterations),
        }
    }

    /// Delay before the first invocation.
    pub fn with_delay(self, delay: Duration) -> Self {
        ScheduledTask { delay, ..self }
    }

    /// Interval between invocations; without one, the factory runs once.
    pub fn with_period(self, period: Duration) -> Self {
        self.control.set_period(Some(period));
        self
    }

    pub fn with_max_iterations(self, max: u32) -> Self {
        *self.control.lock_max() = Some(max);
        self
    }

    /// By default an iteration ending in error cancels the repetition.
    /// With `false`, errors are recorded but the schedule continues.
    pub fn cancel_on_error(self, cancel: bool) -> Self {
        self.control.cancel_on_error.store(cancel, Ordering::SeqCst);
        self
    }

    pub fn handle(&self) -> &Arc<TaskHandle> {
        &self.handle
    }

    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn control(&self) -> &Arc<ScheduleControl> {
        &self.control
    }

    /// Completed iterations so far.
    pub fn run_count(&self) -> u32 {
        self.control.run_count()
    }

    /// The most recently generated sub-task, if any iteration has started.
    pub fn recent_run(&self) -> Option<Task<T>> {
        self.lock(&self.recent_run).clone()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Stops the repetition and cancels the in-flight sub-task, if any.
    /// `may_interrupt` is forwarded to the child, so a non-interrupting
    /// cancel marks both tasks cancelled without signalling either body.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        // The loop observes the token and cancels the running child itself;
        // cancelling here as well covers a loop blocked on the child.
        let changed = self.handle.cancel(may_interrupt);
        if changed {
            if let Some(child) = self.recent_run() {
                child.cancel(may_interrupt);
            }
        }
        changed
    }

    pub async fn block_until_ended(&self) {
        self.handle.block_until_ended().await;
    }

    /// Waits until at least one iteration has completed (or the task has
    /// ended) and returns the most recent iteration's result. Once the task
    /// has ended, cancellation takes precedence over any stored result.
    pub async fn get(&self) -> Result<T, TaskError> {
        let mut iter_rx = self.iterations.subscribe();
        let mut done_rx = self.handle.done_rx();
        loop {
            if self.handle.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            if self.handle.is_done() {
                return self.latest_result().unwrap_or(Err(TaskError::Cancelled));
            }
            if *iter_rx.borrow_and_update() > 0 {
                if let Some(result) = self.latest_result() {
                    return result;
                }
            }
            tokio::select! {
                changed = iter_rx.changed() => {
                    if changed.is_err() {
                        return Err(TaskError::Cancelled);
                    }
                }
                changed = done_rx.changed() => {
                    if changed.is_err() {
                        return Err(TaskError::Cancelled);
                    }
                }
            }
        }
    }

    fn latest_result(&self) -> Option<Result<T, TaskError>> {
        self.lock(&self.latest).clone()
    }

    fn lock<'a, V>(&self, mutex: &'a Mutex<V>) -> MutexGuard<'a, V> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The repetition loop, spawned by
    /// [`ExecutionManager::submit_scheduled`]. Runs inside this task's
    /// ambient scope so generated sub-tasks record it as their submitter.
    pub(crate) fn schedule_loop(
        &self,
        manager: Arc<ExecutionManager>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let st = self.clone();
        async move {
            let fut = st.run_loop(manager);
            scoped(st.handle.clone(), fut).await
        }
    }

    async fn run_loop(&self, manager: Arc<ExecutionManager>) {
        self.handle.mark_running();
        let token = self.handle.cancellation_token();
        let Some(mut factory) = self.lock(&self.factory).take() else {
            self.handle.finish(
                TaskState::Failed,
                Some("scheduled task submitted twice".to_string()),
            );
            return;
        };
        let mut next = Instant::now() + self.delay;
        let end = loop {
            tokio::select! {
                _ = token.cancelled() => break LoopEnd::Cancelled,
                _ = tokio::time::sleep_until(next) => {}
            }
            if self.handle.is_done() {
                break LoopEnd::Cancelled;
            }
            let child = factory();
            child.handle().set_submitted_by(Arc::downgrade(&self.handle));
            if manager.submit(Vec::new(), &child).is_err() {
                break LoopEnd::Cancelled;
            }
            *self.lock(&self.recent_run) = Some(child.clone());
            tokio::select! {
                _ = token.cancelled() => {
                    child.cancel(true);
                    break LoopEnd::Cancelled;
                }
                _ = child.block_until_ended() => {}
            }
            let result = child.outcome().unwrap_or(Err(TaskError::Cancelled));
            let errored = result.as_ref().err().map(|e| e.to_string());
            *self.lock(&self.latest) = Some(result);
            let count = self.control.run_count.fetch_add(1, Ordering::SeqCst) + 1;
            self.iterations.send_replace(count);
            debug!(
                task = %self.handle.display_name(),
                iteration = count,
                "scheduled iteration finished"
            );
            // A non-interrupting cancel never signals the token, so the
            // handle state must be checked as well.
            if token.is_cancelled() || self.handle.is_done() {
                break LoopEnd::Cancelled;
            }
            if let Some(message) = errored {
                if self.control.cancel_on_error.load(Ordering::SeqCst) {
                    break LoopEnd::Errored(message);
                }
            }
            let Some(period) = self.control.period() else {
                break LoopEnd::Exhausted;
            };
            if let Some(max) = self.control.max_iterations() {
                if count >= max {
                    break LoopEnd::Exhausted;
                }
            }
            // Anchor to the previous scheduled time; an overrun restarts
            // immediately rather than drifting, and never overlaps.
            next += period;
            let now = Instant::now();
            if next < now {
                next = now;
            }
        };
        match end {
            LoopEnd::Cancelled => {
                self.handle.cancel(false);
            }
            LoopEnd::Errored(message) => {
                self.handle.finish(TaskState::Failed, Some(message));
            }
            LoopEnd::Exhausted => {
                self.handle.finish(TaskState::Succeeded, None);
            }
        }
    }
}

impl<T> std::fmt::Debug for ScheduledTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.handle.id())
            .field("name", &self.handle.display_name())
            .field("run_count", &self.control.run_count())
            .finish()
    }
}
