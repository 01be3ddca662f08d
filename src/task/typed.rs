use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::tag::Tag;
use crate::task::handle::TaskHandle;
use crate::task::state::{TaskId, TaskState};

type TaskBody<T> = BoxFuture<'static, anyhow::Result<T>>;

/// The schedulable unit of work: a body producing a `T`, plus the observable
/// [`TaskHandle`]. Cloning a `Task` clones the handle, not the body; however
/// many clones exist, the body runs at most once.
///
/// `T: Clone` so that repeated `get` calls (and compound-task aggregation)
/// can each yield the value.
pub struct Task<T> {
    handle: Arc<TaskHandle>,
    body: Arc<Mutex<Option<TaskBody<T>>>>,
    result: Arc<OnceLock<Result<T, TaskError>>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            handle: self.handle.clone(),
            body: self.body.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Task<T> {
    /// Creates an unsubmitted task from an async body. The body is not
    /// polled until an [`ExecutionManager`](crate::ExecutionManager) accepts
    /// the task and assigns it a worker slot.
    pub fn new<F>(display_name: impl Into<String>, body: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::with_description(display_name, "", body)
    }

    pub fn with_description<F>(
        display_name: impl Into<String>,
        description: impl Into<String>,
        body: F,
    ) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Task {
            handle: TaskHandle::new(display_name, description),
            body: Arc::new(Mutex::new(Some(Box::pin(body)))),
            result: Arc::new(OnceLock::new()),
        }
    }

    /// Waits for the task to end and returns its result, failing with
    /// [`TaskError::Cancelled`] or the captured body error.
    pub async fn get(&self) -> Result<T, TaskError> {
        self.handle.block_until_ended().await;
        self.read_result()
    }

    /// Timed `get`. A zero timeout returns immediately, distinguishing "not
    /// done yet" ([`TaskError::Timeout`]) from an actual failure; on expiry
    /// the task itself is unaffected and keeps running.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        if !self.handle.block_until_ended_timeout(timeout).await {
            return Err(TaskError::Timeout { waited: timeout });
        }
        self.read_result()
    }

    /// Like [`get`](Self::get) but panics on failure; intended for callers
    /// that have already established the task cannot fail.
    pub async fn get_unchecked(&self) -> T {
        match self.get().await {
            Ok(value) => value,
            Err(err) => panic!("task '{}' failed: {err}", self.handle.display_name()),
        }
    }

    /// Terminal outcome without blocking: `None` while the task is live.
    pub fn outcome(&self) -> Option<Result<T, TaskError>> {
        if !self.handle.is_done() {
            return None;
        }
        Some(self.read_result())
    }

    /// Terminal error, if the task ended in one.
    pub fn error(&self) -> Option<TaskError> {
        match self.outcome() {
            Some(Err(err)) => Some(err),
            _ => None,
        }
    }

    fn read_result(&self) -> Result<T, TaskError> {
        match self.handle.state() {
            TaskState::Cancelled => Err(TaskError::Cancelled),
            TaskState::Succeeded | TaskState::Failed => match self.result.get() {
                Some(result) => result.clone(),
                None => Err(TaskError::Cancelled),
            },
            _ => Err(TaskError::Cancelled),
        }
    }

    /// Records the body's outcome and moves the task to its terminal state.
    /// A task already cancelled keeps its cancellation; the late result is
    /// discarded.
    pub(crate) fn complete(&self, result: Result<T, TaskError>) {
        let (state, message) = match &result {
            Ok(_) => (TaskState::Succeeded, None),
            Err(err) => (TaskState::Failed, Some(err.to_string())),
        };
        let _ = self.result.set(result);
        self.handle.finish(state, message);
    }

    pub(crate) fn take_body(&self) -> Option<TaskBody<T>> {
        self.body.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    // handle passthroughs --------------------------------------------------

    pub fn handle(&self) -> &Arc<TaskHandle> {
        &self.handle
    }

    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn display_name(&self) -> &str {
        self.handle.display_name()
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.handle.tags()
    }

    pub fn state(&self) -> TaskState {
        self.handle.state()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn is_error(&self) -> bool {
        self.handle.is_error()
    }

    pub fn is_begun(&self) -> bool {
        self.handle.is_begun()
    }

    pub fn is_submitted(&self) -> bool {
        self.handle.is_submitted()
    }

    /// See [`TaskHandle::cancel`].
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.handle.cancel(may_interrupt)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.handle.cancellation_token()
    }

    pub async fn block_until_ended(&self) {
        self.handle.block_until_ended().await;
    }

    pub fn add_listener(&self, listener: impl FnOnce() + Send + 'static) {
        self.handle.add_listener(listener);
    }

    pub fn status_summary(&self) -> String {
        self.handle.status_summary()
    }

    pub fn status_detail(&self) -> String {
        self.handle.status_detail()
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.handle.id())
            .field("name", &self.handle.display_name())
            .field("state", &self.handle.state())
            .finish()
    }
}
