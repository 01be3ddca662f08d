use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::task::TaskId;

/// Terminal or wait-time errors observed through a task.
///
/// `Failure`, `Cancelled` and `Composition` describe the task's own terminal
/// state; `Timeout` is raised only by a timed `get` and leaves the task
/// untouched.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// The task body returned an error. The original error chain is
    /// preserved and the root cause can be inspected via [`TaskError::root_cause`].
    #[error("task body failed: {0}")]
    Failure(Arc<anyhow::Error>),

    /// The task was cancelled before it produced a result.
    #[error("task was cancelled")]
    Cancelled,

    /// A timed wait elapsed before the task reached a terminal state.
    #[error("timed out after {waited:?} waiting for task")]
    Timeout { waited: Duration },

    /// A compound task failed because one or more children failed.
    /// Children that were never started are not listed here.
    #[error("child task failed: {}", .failed.join("; "))]
    Composition { failed: Vec<String> },
}

impl TaskError {
    /// Wraps an arbitrary error chain as a body failure.
    pub fn failure(err: anyhow::Error) -> Self {
        TaskError::Failure(Arc::new(err))
    }

    /// Returns the innermost cause for `Failure` errors, `None` otherwise.
    pub fn root_cause(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TaskError::Failure(err) => Some(err.root_cause()),
            _ => None,
        }
    }

    /// Short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Failure(_) => "task_failed",
            TaskError::Cancelled => "task_cancelled",
            TaskError::Timeout { .. } => "task_wait_timeout",
            TaskError::Composition { .. } => "task_child_failed",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }
}

/// Errors raised when handing work to an [`ExecutionManager`](crate::ExecutionManager).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The manager has been shut down and accepts no new work.
    #[error("execution manager is shut down")]
    ShutDown,

    /// The task was already submitted once; tasks run at most once.
    #[error("task {id} was already submitted")]
    AlreadySubmitted { id: TaskId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn labels_are_stable() {
        assert_eq!(TaskError::Cancelled.as_label(), "task_cancelled");
        assert_eq!(
            TaskError::Timeout { waited: Duration::from_millis(5) }.as_label(),
            "task_wait_timeout"
        );
        assert_eq!(
            TaskError::failure(anyhow!("boom")).as_label(),
            "task_failed"
        );
    }

    #[test]
    fn failure_preserves_root_cause() {
        let err = TaskError::failure(anyhow!("inner").context("outer"));
        let root = err.root_cause().map(|c| c.to_string());
        assert_eq!(root.as_deref(), Some("inner"));
        assert!(err.to_string().contains("outer"));
    }

    #[test]
    fn composition_lists_failed_children() {
        let err = TaskError::Composition { failed: vec!["a: boom".into(), "b: bust".into()] };
        let text = err.to_string();
        assert!(text.contains("a: boom"));
        assert!(text.contains("b: bust"));
    }
}
