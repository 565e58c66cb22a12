pub mod handlers;
pub mod service;

pub use service::{CancelOutcome, Task, TaskRegistry, TaskStatus};
