pub mod current;
pub mod handle;
pub mod state;
pub mod typed;


pub use current::{current_task, with_blocking_details};
pub use handle::TaskHandle;
pub use state::{TaskId, TaskState};
pub use typed::Task;
