use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::compound::DynQueue;
use crate::manager::ExecutionManager;
use crate::scheduled::ScheduleControl;
use crate::tag::Tag;
use crate::task::state::{Lifecycle, TaskId, TaskState};

type Listener = Box<dyn FnOnce() + Send + 'static>;

/// The untyped core of a task: identity, tags, lifecycle, cancellation and
/// observation. The typed result lives on [`Task`](crate::Task); everything
/// the manager indexes and queries goes through this handle.
pub struct TaskHandle {
    id: TaskId,
    display_name: String,
    description: String,
    tags: Mutex<Vec<Tag>>,
    lifecycle: Mutex<Lifecycle>,
    token: CancellationToken,
    done_tx: watch::Sender<bool>,
    failure_message: OnceLock<String>,
    blocking_details: Mutex<Option<String>>,
    submitted_by: OnceLock<Weak<TaskHandle>>,
    manager: OnceLock<Weak<ExecutionManager>>,
    listeners: Mutex<Vec<Listener>>,
    schedule: OnceLock<Arc<ScheduleControl>>,
    dynamic: OnceLock<Arc<DynQueue>>,
}

impl TaskHandle {
    pub(crate) fn new(display_name: impl Into<String>, description: impl Into<String>) -> Arc<Self> {
        let (done_tx, _) = watch::channel(false);
        Arc::new(TaskHandle {
            id: TaskId::new_v4(),
            display_name: display_name.into(),
            description: description.into(),
            tags: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Lifecycle::new()),
            token: CancellationToken::new(),
            done_tx,
            failure_message: OnceLock::new(),
            blocking_details: Mutex::new(None),
            submitted_by: OnceLock::new(),
            manager: OnceLock::new(),
            listeners: Mutex::new(Vec::new()),
            schedule: OnceLock::new(),
            dynamic: OnceLock::new(),
        })
    }

    // identity and metadata ------------------------------------------------

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.lock_tags().clone()
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.lock_tags().contains(tag)
    }

    pub(crate) fn merge_tags(&self, tags: impl IntoIterator<Item = Tag>) {
        let mut current = self.lock_tags();
        for tag in tags {
            if !current.contains(&tag) {
                current.push(tag);
            }
        }
    }

    /// The task that was current on the submitting context, if any.
    /// Provenance only; the parent's lifetime is independent.
    pub fn submitted_by(&self) -> Option<Arc<TaskHandle>> {
        self.submitted_by.get().and_then(Weak::upgrade)
    }

    pub(crate) fn set_submitted_by(&self, parent: Weak<TaskHandle>) {
        let _ = self.submitted_by.set(parent);
    }

    pub(crate) fn attach_manager(&self, manager: Weak<ExecutionManager>) {
        let _ = self.manager.set(manager);
    }

    /// The manager this task was submitted to, while it is still alive.
    pub fn manager(&self) -> Option<Arc<ExecutionManager>> {
        self.manager.get().and_then(Weak::upgrade)
    }

    /// Cancellation signal for this task. Bodies should observe it to stop
    /// cooperatively; an unobserved signal leaves the body running while the
    /// task itself is already marked cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn set_schedule_control(&self, control: Arc<ScheduleControl>) {
        let _ = self.schedule.set(control);
    }

    /// Present only on [`ScheduledTask`](crate::ScheduledTask) handles; lets a
    /// generated sub-task adjust its parent's repetition.
    pub fn schedule_control(&self) -> Option<Arc<ScheduleControl>> {
        self.schedule.get().cloned()
    }

    pub(crate) fn set_dynamic_queue(&self, queue: Arc<DynQueue>) {
        let _ = self.dynamic.set(queue);
    }

    pub(crate) fn dynamic_queue(&self) -> Option<Arc<DynQueue>> {
        self.dynamic.get().cloned()
    }

    // state ----------------------------------------------------------------

    pub fn state(&self) -> TaskState {
        self.lock_lifecycle().state
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.lock_lifecycle().submitted_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock_lifecycle().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.lock_lifecycle().ended_at
    }

    pub fn is_begun(&self) -> bool {
        self.lock_lifecycle().started_at.is_some()
    }

    pub fn is_submitted(&self) -> bool {
        self.lock_lifecycle().submitted_at.is_some()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// True once `get` would fail: the body errored or the task was cancelled.
    pub fn is_error(&self) -> bool {
        matches!(self.state(), TaskState::Failed | TaskState::Cancelled)
    }

    /// Failure message once the task has ended in error.
    pub fn failure_message(&self) -> Option<&str> {
        self.failure_message.get().map(String::as_str)
    }

    pub(crate) fn mark_submitted(&self) -> bool {
        let mut lc = self.lock_lifecycle();
        if lc.state != TaskState::NotSubmitted {
            return false;
        }
        lc.state = TaskState::Submitted;
        lc.submitted_at = Some(Utc::now());
        true
    }

    pub(crate) fn mark_running(&self) -> bool {
        let mut lc = self.lock_lifecycle();
        if lc.state != TaskState::Submitted {
            return false;
        }
        lc.state = TaskState::Running;
        lc.started_at = Some(Utc::now());
        true
    }

    /// Moves the task to a terminal state. Returns false (and changes
    /// nothing) if it was already terminal: the first transition wins, so a
    /// late body result never overwrites a cancellation.
    pub(crate) fn finish(&self, state: TaskState, failure: Option<String>) -> bool {
        debug_assert!(state.is_terminal());
        {
            let mut lc = self.lock_lifecycle();
            if lc.state.is_terminal() {
                return false;
            }
            lc.state = state;
            lc.ended_at = Some(Utc::now());
        }
        if let Some(message) = failure {
            let _ = self.failure_message.set(message);
        }
        if let Some(manager) = self.manager() {
            manager.note_task_ended();
        }
        // send_replace stores the value even with no receivers yet, so a
        // waiter subscribing later still observes completion
        self.done_tx.send_replace(true);
        let pending: Vec<Listener> = {
            let mut listeners = self.lock_listeners();
            listeners.drain(..).collect()
        };
        for listener in pending {
            spawn_listener(listener);
        }
        true
    }

    /// Cancels the task. Before submission or start this prevents the body
    /// from ever running; while running it marks the task cancelled, releases
    /// all waiters immediately and (if `may_interrupt`) signals the body's
    /// cancellation token. After completion it is a no-op.
    ///
    /// Returns true if the task's state changed.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let changed = self.finish(TaskState::Cancelled, Some("cancelled".to_string()));
        if changed {
            debug!(task = %self.display_name, id = %self.id, "task cancelled");
            if may_interrupt {
                self.token.cancel();
            }
        }
        changed
    }

    // waiting and listeners ------------------------------------------------

    pub(crate) fn done_rx(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Waits until the task reaches a terminal state. Unlike `get`, never
    /// reports how it ended.
    pub async fn block_until_ended(&self) {
        let mut rx = self.done_rx();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Timed variant of [`block_until_ended`](Self::block_until_ended);
    /// returns whether the task ended within `timeout`.
    pub async fn block_until_ended_timeout(&self, timeout: Duration) -> bool {
        if self.is_done() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        tokio::time::timeout(timeout, self.block_until_ended()).await.is_ok()
    }

    /// Registers a callback fired exactly once when the task reaches a
    /// terminal state. Listeners added after completion fire immediately.
    /// Listeners run as spawned tasks on the current tokio runtime.
    pub fn add_listener(&self, listener: impl FnOnce() + Send + 'static) {
        let fire_now = {
            let mut listeners = self.lock_listeners();
            if self.is_done() {
                true
            } else {
                listeners.push(Box::new(listener));
                return;
            }
        };
        if fire_now {
            spawn_listener(Box::new(listener));
        }
    }

    // status text ----------------------------------------------------------

    /// A caller may note why the current task is blocked, for transparency in
    /// status output; cleared with `None` after the wait.
    pub fn set_blocking_details(&self, details: Option<String>) {
        *self.lock_blocking() = details;
    }

    pub fn blocking_details(&self) -> Option<String> {
        self.lock_blocking().clone()
    }

    /// Brief human-readable phase: one of not submitted / submitted /
    /// running / waiting / cancelled / failed / completed.
    pub fn status_summary(&self) -> String {
        let lc = self.lock_lifecycle().clone();
        match lc.state {
            TaskState::NotSubmitted => "not submitted".to_string(),
            TaskState::Submitted => "submitted for execution".to_string(),
            TaskState::Running => match self.blocking_details() {
                Some(details) => format!("waiting: {details}"),
                None => "running".to_string(),
            },
            TaskState::Cancelled => "cancelled".to_string(),
            TaskState::Failed => "failed".to_string(),
            TaskState::Succeeded => "completed".to_string(),
        }
    }

    /// Detailed status, including elapsed time and the failure message once
    /// the task has ended in error.
    pub fn status_detail(&self) -> String {
        let lc = self.lock_lifecycle().clone();
        let mut text = self.status_summary();
        match lc.state {
            TaskState::Submitted => {
                if let Some(at) = lc.submitted_at {
                    let waited = Utc::now().signed_duration_since(at);
                    text.push_str(&format!(" ({}ms ago)", waited.num_milliseconds()));
                }
            }
            TaskState::Failed => {
                if let Some(message) = self.failure_message() {
                    text.push_str(": ");
                    text.push_str(message);
                }
            }
            TaskState::Cancelled | TaskState::Succeeded => {
                if let (Some(submitted), Some(ended)) = (lc.submitted_at, lc.ended_at) {
                    let took = ended.signed_duration_since(submitted);
                    text.push_str(&format!(" after {}ms", took.num_milliseconds()));
                }
            }
            _ => {}
        }
        text
    }

    // locking helpers ------------------------------------------------------

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tags(&self) -> std::sync::MutexGuard<'_, Vec<Tag>> {
        self.tags.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_blocking(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.blocking_details.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.display_name)
            .field("state", &self.state())
            .finish()
    }
}

fn spawn_listener(listener: Listener) {
    tokio::spawn(async move { listener() });
}
