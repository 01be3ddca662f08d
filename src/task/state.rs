use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Unique identifier for tasks.
pub type TaskId = Uuid;

/// Observable lifecycle state of a task.
///
/// `NotSubmitted -> Submitted -> Running -> {Succeeded | Failed | Cancelled}`,
/// with `Cancelled` reachable from any non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Created but not yet handed to an execution manager.
    NotSubmitted,
    /// Accepted by a manager, waiting for a worker slot (or for its tag's
    /// scheduler to release it).
    Submitted,
    /// Body currently executing.
    Running,
    /// Body returned a value.
    Succeeded,
    /// Body returned an error.
    Failed,
    /// Cancelled before a result was produced.
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled)
    }
}

/// State plus transition timestamps, guarded by one mutex so that state and
/// times always move together.
#[derive(Clone, Debug)]
pub(crate) struct Lifecycle {
    pub state: TaskState,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle {
            state: TaskState::NotSubmitted,
            submitted_at: None,
            started_at: None,
            ended_at: None,
        }
    }
}
