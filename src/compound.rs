//! Tasks composed of child tasks: fixed-list sequential and parallel
//! composition, and a dynamic-sequential variant whose child list can grow
//! while its own body runs.
//!
//! Compound bodies resolve the manager from their own handle at run time, so
//! a compound task is submitted like any other and its children become
//! ordinary submissions with the compound recorded as their submitter.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TaskError;
use crate::manager::ExecutionManager;
use crate::task::TaskState;
use crate::task::current::current_task;
use crate::task::handle::TaskHandle;
use crate::task::state::TaskId;
use crate::task::typed::Task;

fn ambient_manager() -> anyhow::Result<Arc<ExecutionManager>> {
    current_task()
        .and_then(|handle| handle.manager())
        .ok_or_else(|| anyhow::anyhow!("compound task body is not running under a manager"))
}

fn child_label(name: &str, err: &TaskError) -> String {
    format!("{name}: {err}")
}

/// A task that runs `children` one at a time, in order, yielding their
/// results in the same order. The first child error aborts the rest: later
/// children are never submitted and stay not-begun, and the compound task
/// ends in a [`TaskError::Composition`] naming the failed child.
pub fn sequential<T: Clone + Send + Sync + 'static>(
    display_name: impl Into<String>,
    children: Vec<Task<T>>,
) -> Task<Vec<T>> {
    Task::new(display_name, async move {
        let manager = ambient_manager()?;
        let mut results = Vec::with_capacity(children.len());
        for child in &children {
            manager.submit(Vec::new(), child)?;
            match child.get().await {
                Ok(value) => results.push(value),
                Err(err) => {
                    let failed = vec![child_label(child.display_name(), &err)];
                    return Err(anyhow::Error::new(TaskError::Composition { failed }));
                }
            }
        }
        Ok(results)
    })
}

/// A task that submits all `children` at once and waits for every one of
/// them to end, yielding their results in construction order. A child
/// failure does not cancel its siblings; once all have ended, any failures
/// surface together as a [`TaskError::Composition`].
pub fn parallel<T: Clone + Send + Sync + 'static>(
    display_name: impl Into<String>,
    children: Vec<Task<T>>,
) -> Task<Vec<T>> {
    Task::new(display_name, async move {
        let manager = ambient_manager()?;
        for child in &children {
            manager.submit(Vec::new(), child)?;
        }
        let mut results = Vec::with_capacity(children.len());
        let mut failed = Vec::new();
        for child in &children {
            match child.get().await {
                Ok(value) => results.push(value),
                Err(err) => failed.push(child_label(child.display_name(), &err)),
            }
        }
        if failed.is_empty() {
            Ok(results)
        } else {
            Err(anyhow::Error::new(TaskError::Composition { failed }))
        }
    })
}

/// A child waiting in a dynamic queue: its observable handle plus the
/// type-erased submit-and-wait step the drainer runs.
pub(crate) struct QueuedChild {
    handle: Arc<TaskHandle>,
    run: Box<dyn FnOnce(Arc<ExecutionManager>) -> BoxFuture<'static, Result<(), TaskError>> + Send>,
}

fn erase_child<T: Clone + Send + Sync + 'static>(child: Task<T>) -> QueuedChild {
    let handle = child.handle().clone();
    QueuedChild {
        handle,
        run: Box::new(move |manager| {
            Box::pin(async move {
                manager
                    .submit(Vec::new(), &child)
                    .map_err(|err| TaskError::failure(anyhow::Error::new(err)))?;
                child.block_until_ended().await;
                match child.error() {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            })
        }),
    }
}

/// The child queue behind a [`DynamicSequentialTask`], reachable from the
/// task's handle so code running inside the body can append to it.
pub(crate) struct DynQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedChild>>>,
    children: Mutex<Vec<Arc<TaskHandle>>>,
}

impl DynQueue {
    fn push(&self, child: QueuedChild) -> bool {
        let guard = self.lock_sender();
        let Some(sender) = guard.as_ref() else {
            return false;
        };
        self.lock_children().push(child.handle.clone());
        sender.send(child).is_ok()
    }

    fn close(&self) {
        self.lock_sender().take();
    }

    fn children(&self) -> Vec<Arc<TaskHandle>> {
        self.lock_children().clone()
    }

    fn lock_sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<QueuedChild>>> {
        self.sender.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_children(&self) -> MutexGuard<'_, Vec<Arc<TaskHandle>>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A sequential compound whose child list is open-ended: children may be
/// queued before submission and, through [`queue_in_current`], from code
/// running inside the task's own body. Queued children are drained strictly
/// one at a time, in queue order, alongside the main body; children queued
/// near the end of the body are still drained after it returns.
///
/// The task ends once the body has returned and the queue is drained. A
/// child error stops the drain (later queued children are never started) and
/// the task ends in error; a body error likewise ends the task in error
/// after already-queued children finish.
pub struct DynamicSequentialTask<R> {
    task: Task<R>,
    queue: Arc<DynQueue>,
}

impl<R: Clone + Send + Sync + 'static> DynamicSequentialTask<R> {
    pub fn new<F>(display_name: impl Into<String>, body: F) -> Self
    where
        F: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueuedChild>();
        let queue = Arc::new(DynQueue {
            sender: Mutex::new(Some(sender)),
            children: Mutex::new(Vec::new()),
        });
        let drain_queue = queue.clone();
        let task = Task::new(display_name, async move {
            let handle = current_task()
                .ok_or_else(|| anyhow::anyhow!("dynamic task body is not running under a manager"))?;
            let manager = handle
                .manager()
                .ok_or_else(|| anyhow::anyhow!("dynamic task body is not running under a manager"))?;
            let token = handle.cancellation_token();
            let drainer = tokio::spawn(async move {
                let mut failed = Vec::new();
                loop {
                    let child = tokio::select! {
                        _ = token.cancelled() => break,
                        next = receiver.recv() => match next {
                            Some(child) => child,
                            None => break,
                        },
                    };
                    let name = child.handle.display_name().to_string();
                    if let Err(err) = (child.run)(manager.clone()).await {
                        debug!(child = %name, error = %err, "dynamic child failed; draining stops");
                        failed.push(child_label(&name, &err));
                        break;
                    }
                }
                failed
            });
            let body_result = body.await;
            // No more children can arrive; the drainer finishes the backlog
            // and then sees the channel close.
            drain_queue.close();
            let failed = drainer.await.unwrap_or_default();
            match body_result {
                Err(err) => Err(err),
                Ok(_) if !failed.is_empty() => {
                    Err(anyhow::Error::new(TaskError::Composition { failed }))
                }
                Ok(value) => Ok(value),
            }
        });
        task.handle().set_dynamic_queue(queue.clone());
        DynamicSequentialTask { task, queue }
    }

    /// The underlying task, for submission to a manager.
    pub fn task(&self) -> &Task<R> {
        &self.task
    }

    /// Appends a child to the queue. Returns false if the task has already
    /// finished draining and the child will never run.
    pub fn queue<T: Clone + Send + Sync + 'static>(&self, child: Task<T>) -> bool {
        child.handle().set_submitted_by(Arc::downgrade(self.task.handle()));
        self.queue.push(erase_child(child))
    }

    /// Handles of every child queued so far, in queue order.
    pub fn children(&self) -> Vec<Arc<TaskHandle>> {
        self.queue.children()
    }

    // passthroughs ---------------------------------------------------------

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn handle(&self) -> &Arc<TaskHandle> {
        self.task.handle()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }

    pub async fn get(&self) -> Result<R, TaskError> {
        self.task.get().await
    }

    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.task.cancel(may_interrupt)
    }

    pub async fn block_until_ended(&self) {
        self.task.block_until_ended().await;
    }
}

impl<R: Clone + Send + Sync + 'static> std::fmt::Debug for DynamicSequentialTask<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicSequentialTask")
            .field("id", &self.task.id())
            .field("name", &self.task.display_name())
            .field("children", &self.queue.children().len())
            .finish()
    }
}

/// Queues a child onto the dynamic-sequential task currently running on this
/// context, from inside its own body. Returns false when the ambient task is
/// not a dynamic-sequential task or has already finished draining.
pub fn queue_in_current<T: Clone + Send + Sync + 'static>(child: Task<T>) -> bool {
    let Some(handle) = current_task() else {
        return false;
    };
    let Some(queue) = handle.dynamic_queue() else {
        return false;
    };
    child.handle().set_submitted_by(Arc::downgrade(&handle));
    queue.push(erase_child(child))
}
