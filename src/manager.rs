use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{SubmitError, TaskError};
use crate::scheduled::ScheduledTask;
use crate::scheduler::TaskScheduler;
use crate::tag::Tag;
use crate::task::current::{current_task, scoped};
use crate::task::handle::TaskHandle;
use crate::task::state::TaskId;
use crate::task::typed::Task;

/// A unit of work prepared by the manager: the task's full run wrapper
/// (state transitions, ambient scope, result capture) boxed so that
/// schedulers can reorder execution without touching task semantics.
pub type Job = BoxFuture<'static, ()>;

/// Configuration for an execution manager.
#[derive(Clone, Debug)]
pub struct ExecutionManagerConfig {
    /// Name used in log output to distinguish managers.
    pub name: String,
    /// Maximum number of task bodies executing concurrently. Queued work
    /// beyond this budget waits; it does not consume a slot.
    pub max_concurrent_tasks: usize,
}

impl Default for ExecutionManagerConfig {
    fn default() -> Self {
        ExecutionManagerConfig {
            name: "taskmill".to_string(),
            max_concurrent_tasks: 64,
        }
    }
}

/// The root authority of the runtime: accepts task submissions, records
/// provenance and tag indices, and dispatches bodies to a bounded worker
/// budget, directly or through a tag's [`TaskScheduler`].
///
/// Every task ever submitted stays queryable (by id or tag) until the
/// manager is dropped; the indices are append-only for the manager's
/// lifetime.
pub struct ExecutionManager {
    config: ExecutionManagerConfig,
    pool: Arc<Semaphore>,
    tasks: DashMap<TaskId, Arc<TaskHandle>>,
    by_tag: DashMap<Tag, Vec<Arc<TaskHandle>>>,
    schedulers: DashMap<Tag, Arc<dyn TaskScheduler>>,
    shut_down: AtomicBool,
    total_submitted: AtomicU64,
    incomplete: AtomicUsize,
    active: AtomicUsize,
}

impl ExecutionManager {
    pub fn new(config: ExecutionManagerConfig) -> Arc<Self> {
        let pool = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Arc::new(ExecutionManager {
            config,
            pool,
            tasks: DashMap::new(),
            by_tag: DashMap::new(),
            schedulers: DashMap::new(),
            shut_down: AtomicBool::new(false),
            total_submitted: AtomicU64::new(0),
            incomplete: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &ExecutionManagerConfig {
        &self.config
    }

    // submission -----------------------------------------------------------

    /// Submits a task under the given tags (merged with any already on the
    /// task). Records submit time and submitted-by provenance from the
    /// ambient current task, indexes the task, then dispatches it: through
    /// the first matching tag scheduler if one is installed, directly to the
    /// worker budget otherwise.
    ///
    /// Submitting a task that was cancelled before submission is a no-op;
    /// submitting a live task twice is an error.
    pub fn submit<T: Clone + Send + Sync + 'static>(
        self: &Arc<Self>,
        tags: impl IntoIterator<Item = Tag>,
        task: &Task<T>,
    ) -> Result<(), SubmitError> {
        let handle = task.handle().clone();
        if !self.register(tags, &handle)? {
            return Ok(());
        }
        let job = self.make_job(task.clone());
        self.dispatch(&handle, job);
        Ok(())
    }

    /// Submits a [`ScheduledTask`]. The repetition loop itself runs outside
    /// the worker budget; each generated sub-task is submitted back through
    /// [`submit`](Self::submit) and consumes a slot normally.
    pub fn submit_scheduled<T: Clone + Send + Sync + 'static>(
        self: &Arc<Self>,
        task: &ScheduledTask<T>,
    ) -> Result<(), SubmitError> {
        let handle = task.handle().clone();
        if !self.register(Vec::new(), &handle)? {
            return Ok(());
        }
        tokio::spawn(task.schedule_loop(self.clone()));
        Ok(())
    }

    /// Returns Ok(false) when the submission is a sanctioned no-op
    /// (cancelled before submission).
    fn register(
        self: &Arc<Self>,
        tags: impl IntoIterator<Item = Tag>,
        handle: &Arc<TaskHandle>,
    ) -> Result<bool, SubmitError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SubmitError::ShutDown);
        }
        if handle.is_cancelled() {
            debug!(task = %handle.display_name(), "submit of cancelled task ignored");
            return Ok(false);
        }
        if !handle.mark_submitted() {
            return Err(SubmitError::AlreadySubmitted { id: handle.id() });
        }
        handle.merge_tags(tags);
        if let Some(parent) = current_task() {
            handle.set_submitted_by(Arc::downgrade(&parent));
        }
        handle.attach_manager(Arc::downgrade(self));
        self.total_submitted.fetch_add(1, Ordering::Relaxed);
        self.incomplete.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(handle.id(), handle.clone());
        for tag in handle.tags() {
            self.by_tag.entry(tag).or_default().push(handle.clone());
        }
        debug!(
            manager = %self.config.name,
            task = %handle.display_name(),
            id = %handle.id(),
            "task submitted"
        );
        Ok(true)
    }

    fn dispatch(&self, handle: &Arc<TaskHandle>, job: Job) {
        let schedulers: Vec<Arc<dyn TaskScheduler>> = handle
            .tags()
            .iter()
            .filter_map(|tag| self.schedulers.get(tag).map(|s| s.clone()))
            .collect();
        match schedulers.first() {
            Some(scheduler) => {
                if schedulers.len() > 1 {
                    warn!(
                        task = %handle.display_name(),
                        count = schedulers.len(),
                        "multiple tag schedulers match; using the first"
                    );
                }
                scheduler.submit(job);
            }
            None => {
                tokio::spawn(job);
            }
        }
    }

    /// Wraps a task into its run job: budget acquisition, cancel checks,
    /// ambient current-task scope, panic capture and result recording.
    fn make_job<T: Clone + Send + Sync + 'static>(self: &Arc<Self>, task: Task<T>) -> Job {
        let manager = self.clone();
        Box::pin(async move {
            let handle = task.handle().clone();
            if handle.is_done() {
                return;
            }
            let permit = match manager.pool.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // pool closed by shutdown_now
                    handle.cancel(true);
                    return;
                }
            };
            if handle.is_done() {
                return;
            }
            let Some(body) = task.take_body() else { return };
            if !handle.mark_running() {
                return;
            }
            manager.active.fetch_add(1, Ordering::Relaxed);
            let outcome = std::panic::AssertUnwindSafe(scoped(handle.clone(), body))
                .catch_unwind()
                .await;
            manager.active.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(match err.downcast::<TaskError>() {
                    Ok(task_err) => task_err,
                    Err(other) => TaskError::failure(other),
                }),
                Err(panic) => Err(TaskError::failure(anyhow::anyhow!(
                    "task body panicked: {}",
                    panic_message(panic)
                ))),
            };
            if let Err(err) = &result {
                warn!(
                    task = %handle.display_name(),
                    id = %handle.id(),
                    error = %err,
                    label = err.as_label(),
                    "task ended in error"
                );
            }
            task.complete(result);
        })
    }

    // queries --------------------------------------------------------------

    pub fn task(&self, id: TaskId) -> Option<Arc<TaskHandle>> {
        self.tasks.get(&id).map(|entry| entry.clone())
    }

    /// All tags ever seen on submitted tasks.
    pub fn task_tags(&self) -> Vec<Tag> {
        self.by_tag.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Tasks carrying `tag`, in submission order. Completed tasks are
    /// included; history is retained for the manager's lifetime.
    pub fn tasks_with_tag(&self, tag: &Tag) -> Vec<Arc<TaskHandle>> {
        self.by_tag.get(tag).map(|entry| entry.clone()).unwrap_or_default()
    }

    /// Union over the given tags, de-duplicated, preserving first-seen order.
    pub fn tasks_with_any_tag(&self, tags: &[Tag]) -> Vec<Arc<TaskHandle>> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut result = Vec::new();
        for tag in tags {
            for handle in self.tasks_with_tag(tag) {
                if seen.insert(handle.id()) {
                    result.push(handle);
                }
            }
        }
        result
    }

    /// Intersection over the given tags. Empty whenever *any* requested tag
    /// has no matches, including the first; a naive intersection seeded from
    /// the first non-empty match would wrongly return later tags' tasks.
    pub fn tasks_with_all_tags(&self, tags: &[Tag]) -> Vec<Arc<TaskHandle>> {
        let Some((first, rest)) = tags.split_first() else {
            return Vec::new();
        };
        let mut result = self.tasks_with_tag(first);
        for tag in rest {
            if result.is_empty() {
                return Vec::new();
            }
            let matching: HashSet<TaskId> =
                self.tasks_with_tag(tag).iter().map(|h| h.id()).collect();
            result.retain(|handle| matching.contains(&handle.id()));
        }
        result
    }

    // schedulers -----------------------------------------------------------

    /// Installs a scheduler for a tag. Only tasks submitted afterwards are
    /// affected; tasks already dispatched keep their original path.
    pub fn set_scheduler_for_tag(&self, tag: Tag, scheduler: Arc<dyn TaskScheduler>) {
        debug!(manager = %self.config.name, %tag, "tag scheduler installed");
        if self.schedulers.insert(tag.clone(), scheduler).is_some() {
            warn!(%tag, "replaced existing scheduler for tag");
        }
    }

    pub fn scheduler_for_tag(&self, tag: &Tag) -> Option<Arc<dyn TaskScheduler>> {
        self.schedulers.get(tag).map(|entry| entry.clone())
    }

    // counters and teardown ------------------------------------------------

    pub fn total_tasks_submitted(&self) -> u64 {
        self.total_submitted.load(Ordering::Relaxed)
    }

    pub fn num_incomplete_tasks(&self) -> usize {
        self.incomplete.load(Ordering::Relaxed)
    }

    /// Number of task bodies currently holding a worker slot.
    pub fn num_active_tasks(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stops accepting new work and cancels every task that has not yet
    /// ended. In-flight bodies receive a cancellation signal; waiters are
    /// released immediately.
    pub fn shutdown_now(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(manager = %self.config.name, "shutting down");
        self.pool.close();
        for entry in self.tasks.iter() {
            entry.value().cancel(true);
        }
    }

    pub(crate) fn note_task_ended(&self) {
        let mut current = self.incomplete.load(Ordering::Relaxed);
        while current > 0 {
            match self.incomplete.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("name", &self.config.name)
            .field("total_submitted", &self.total_tasks_submitted())
            .field("incomplete", &self.num_incomplete_tasks())
            .finish()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
