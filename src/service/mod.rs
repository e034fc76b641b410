pub mod scheduler;
pub mod task_runner;

pub use scheduler::{Scheduler, SchedulerConfig};
pub use task_runner::{BASE_THREAD_GROUP, TaskRunner, TaskRunnerConfig};
