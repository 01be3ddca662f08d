//! # Taskmill
//!
//! A concurrent task-execution runtime: observable tasks with tags and
//! provenance, a bounded worker budget, per-tag scheduling policies,
//! repeating scheduled tasks, and compound (sequential/parallel/dynamic)
//! composition.
//!
//! ## Architecture Overview
//!
//! The runtime is organized leaf-first:
//!
//! - **[`task`]**: the schedulable unit ([`Task`]) and its observable core
//!   ([`TaskHandle`]): identity, tags, lifecycle timestamps, cancellation,
//!   listeners, and the ambient "current task" of an execution scope
//! - **[`manager`]**: the [`ExecutionManager`], which accepts submissions,
//!   maintains id- and tag-indices, and dispatches bodies onto a bounded
//!   concurrency budget
//! - **[`scheduler`]**: per-tag execution policies, including the
//!   [`SingleThreadedScheduler`] which serializes same-tag tasks
//! - **[`scheduled`]**: [`ScheduledTask`], a repeating task whose factory is
//!   invoked after a delay and at a (self-adjustable) period
//! - **[`compound`]**: [`sequential`], [`parallel`] and
//!   [`DynamicSequentialTask`] composition of child tasks
//! - **[`context`]**: [`ExecutionContext`], a tag-bound submission façade
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskmill::{ExecutionManager, ExecutionManagerConfig, Task};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = ExecutionManager::new(ExecutionManagerConfig::default());
//!
//!     let task = Task::new("greet", async { Ok("hello".to_string()) });
//!     manager.submit(Vec::new(), &task)?;
//!
//!     let greeting = task.get().await?;
//!     println!("{greeting}");
//!     Ok(())
//! }
//! ```

pub mod compound;
pub mod context;
pub mod error;
pub mod manager;
pub mod scheduled;
pub mod scheduler;
pub mod tag;
pub mod task;

pub use compound::{DynamicSequentialTask, parallel, queue_in_current, sequential};
pub use context::ExecutionContext;
pub use error::{SubmitError, TaskError};
pub use manager::{ExecutionManager, ExecutionManagerConfig, Job};
pub use scheduled::{ScheduleControl, ScheduledTask};
pub use scheduler::{SingleThreadedScheduler, TaskScheduler};
pub use tag::Tag;
pub use task::{Task, TaskHandle, TaskId, TaskState, current_task, with_blocking_details};
