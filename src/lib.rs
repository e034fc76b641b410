pub mod clock;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod log;
pub mod modules;
pub mod runs;
pub mod service;
pub mod tasks;
pub mod types;

pub use config::{CoreCredentials, Settings};
pub use crate::core::{confirm_initialised, initialise, is_initialised};
pub use error::{OrchaError, Result};
pub use log::LogManager;
pub use runs::{RunItem, TaskRef};
pub use service::{Scheduler, TaskRunner};
pub use tasks::{TaskDefinition, TaskItem};
pub use types::{CronSchedule, RunStatus, RunType, ScheduleSet, TaskStatus};
