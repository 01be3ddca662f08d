use std::sync::Arc;

use crate::error::SubmitError;
use crate::manager::ExecutionManager;
use crate::scheduled::ScheduledTask;
use crate::tag::Tag;
use crate::task::current::current_task;
use crate::task::handle::TaskHandle;
use crate::task::typed::Task;

/// A thin, tag-bound view over an [`ExecutionManager`]: every submission
/// through a context carries the context's tags, so all work belonging to one
/// owner is grouped and queryable under them. Contexts are cheap to clone
/// and many may share one manager.
#[derive(Clone)]
pub struct ExecutionContext {
    manager: Arc<ExecutionManager>,
    tags: Vec<Tag>,
}

impl ExecutionContext {
    pub fn new(manager: Arc<ExecutionManager>, tags: impl IntoIterator<Item = Tag>) -> Self {
        ExecutionContext {
            manager,
            tags: tags.into_iter().collect(),
        }
    }

    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.manager
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Submits a task stamped with this context's tags, plus any extras.
    pub fn submit<T: Clone + Send + Sync + 'static>(&self, task: &Task<T>) -> Result<(), SubmitError> {
        self.manager.submit(self.tags.iter().cloned(), task)
    }

    pub fn submit_tagged<T: Clone + Send + Sync + 'static>(
        &self,
        extra_tags: impl IntoIterator<Item = Tag>,
        task: &Task<T>,
    ) -> Result<(), SubmitError> {
        let tags: Vec<Tag> = self.tags.iter().cloned().chain(extra_tags).collect();
        self.manager.submit(tags, task)
    }

    /// Submits a scheduled task; its handle carries the context's tags, while
    /// each generated sub-task is tagged on its own submission.
    pub fn submit_scheduled<T: Clone + Send + Sync + 'static>(
        &self,
        task: &ScheduledTask<T>,
    ) -> Result<(), SubmitError> {
        task.handle().merge_tags(self.tags.iter().cloned());
        self.manager.submit_scheduled(task)
    }

    /// Tasks previously submitted under this context's tags (all of them).
    pub fn tasks(&self) -> Vec<Arc<TaskHandle>> {
        self.manager.tasks_with_all_tags(&self.tags)
    }

    /// The task running on the current execution scope, if any. Free function
    /// [`current_task`](crate::current_task) is the unbound equivalent.
    pub fn current_task(&self) -> Option<Arc<TaskHandle>> {
        current_task()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("tags", &self.tags)
            .finish()
    }
}
