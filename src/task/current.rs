use std::future::Future;
use std::sync::Arc;

use crate::task::handle::TaskHandle;

tokio::task_local! {
    pub(crate) static CURRENT_TASK: Arc<TaskHandle>;
}

/// The task whose body is executing on the current logical thread of
/// control, if any. Set by the manager around every body execution, so
/// submissions made from inside a running task automatically record that
/// task as their submitter.
pub fn current_task() -> Option<Arc<TaskHandle>> {
    CURRENT_TASK.try_with(Arc::clone).ok()
}

/// Runs `fut` inside the given task's ambient scope. Used by the manager and
/// by the scheduled-task loop; not part of the public surface.
pub(crate) fn scoped<F: Future>(handle: Arc<TaskHandle>, fut: F) -> impl Future<Output = F::Output> {
    CURRENT_TASK.scope(handle, fut)
}

/// Annotates the current task with a reason it is blocked while `fut` runs,
/// clearing the annotation afterwards. Shows up in the task's status text as
/// `waiting: <details>`.
pub async fn with_blocking_details<F: Future>(details: impl Into<String>, fut: F) -> F::Output {
    let current = current_task();
    if let Some(handle) = &current {
        handle.set_blocking_details(Some(details.into()));
    }
    let out = fut.await;
    if let Some(handle) = &current {
        handle.set_blocking_details(None);
    }
    out
}
