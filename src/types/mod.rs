pub mod schedule;
pub mod status;

pub use schedule::{CronSchedule, ScheduleSet};
pub use status::{RunStatus, RunType, TaskStatus, Transition};
