//! Tasks: named units of work with one or more cron schedule sets.
//!
//! A task is stored as a series of versions in `orcha.tasks`; reads always see
//! the newest version. Status changes write a new version, activity stamps
//! update the newest one in place.

use crate::clock;
use crate::core::{Core, confirm_initialised};
use crate::db::models::TaskRecord;
use crate::error::OrchaError;
use crate::runs::RunItem;
use crate::service::task_runner::BASE_THREAD_GROUP;
use crate::types::{RunType, ScheduleSet, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use sqlx::types::Json;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub type TaskFuture = BoxFuture<'static, Result<(), OrchaError>>;

/// The work a task does for one run.
///
/// Implemented for any `Fn(TaskItem, RunItem, Value) -> impl Future` closure,
/// where the `Value` is the config of the schedule set that queued the run.
pub trait TaskFunction: Send + Sync {
    fn call(&self, task: TaskItem, run: RunItem, config: Value) -> TaskFuture;
}

impl<F, Fut> TaskFunction for F
where
    F: Fn(TaskItem, RunItem, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), OrchaError>> + Send + 'static,
{
    fn call(&self, task: TaskItem, run: RunItem, config: Value) -> TaskFuture {
        Box::pin(self(task, run, config))
    }
}

/// Everything needed to create (or update) a task.
#[derive(Clone)]
pub struct TaskDefinition {
    pub task_idk: String,
    pub name: String,
    pub description: String,
    pub schedule_sets: Vec<ScheduleSet>,
    pub thread_group: String,
    pub task_metadata: Value,
    pub task_tags: Vec<String>,
    pub register_with_runner: bool,
    pub task_function: Option<Arc<dyn TaskFunction>>,
}

impl TaskDefinition {
    pub fn new(
        task_idk: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            task_idk: task_idk.into(),
            name: name.into(),
            description: description.into(),
            schedule_sets: Vec::new(),
            thread_group: BASE_THREAD_GROUP.to_string(),
            task_metadata: Value::Object(Map::new()),
            task_tags: Vec::new(),
            register_with_runner: true,
            task_function: None,
        }
    }

    pub fn schedule(mut self, set: ScheduleSet) -> Self {
        self.schedule_sets.push(set);
        self
    }

    pub fn schedule_sets(mut self, sets: Vec<ScheduleSet>) -> Self {
        self.schedule_sets = sets;
        self
    }

    pub fn thread_group(mut self, group: impl Into<String>) -> Self {
        self.thread_group = group.into();
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.task_metadata = metadata;
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn register_with_runner(mut self, register: bool) -> Self {
        self.register_with_runner = register;
        self
    }

    pub fn function(mut self, f: impl TaskFunction + 'static) -> Self {
        self.task_function = Some(Arc::new(f));
        self
    }
}

#[derive(Clone)]
pub struct TaskItem {
    pub task_idk: String,
    pub version: DateTime<Utc>,
    pub task_metadata: Value,
    pub task_tags: Vec<String>,
    pub name: String,
    pub description: String,
    pub schedule_sets: Vec<ScheduleSet>,
    pub thread_group: String,
    pub last_active: DateTime<Utc>,
    pub status: TaskStatus,
    pub notes: Option<String>,
    task_function: Option<Arc<dyn TaskFunction>>,
}

impl fmt::Debug for TaskItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskItem")
            .field("task_idk", &self.task_idk)
            .field("version", &self.version)
            .field("name", &self.name)
            .field("schedule_sets", &self.schedule_sets)
            .field("thread_group", &self.thread_group)
            .field("last_active", &self.last_active)
            .field("status", &self.status)
            .field("notes", &self.notes)
            .field("has_function", &self.task_function.is_some())
            .finish()
    }
}

impl TaskItem {
    pub(crate) fn from_record(rec: TaskRecord) -> Result<Self, OrchaError> {
        let status = match rec.status.as_deref() {
            Some(s) => s
                .parse::<TaskStatus>()
                .map_err(|e| OrchaError::DatabaseError(sqlx::Error::Decode(e.into())))?,
            None => TaskStatus::Enabled,
        };
        Ok(Self {
            version: rec.version,
            task_metadata: rec
                .task_metadata
                .map(|j| j.0)
                .unwrap_or_else(|| Value::Object(Map::new())),
            task_tags: rec.task_tags.map(|j| j.0).unwrap_or_default(),
            name: rec.name.unwrap_or_default(),
            description: rec.description.unwrap_or_default(),
            schedule_sets: rec.schedule_sets.map(|j| j.0).unwrap_or_default(),
            thread_group: rec
                .thread_group
                .unwrap_or_else(|| BASE_THREAD_GROUP.to_string()),
            last_active: rec.last_active.unwrap_or(rec.version),
            status,
            notes: rec.notes,
            task_idk: rec.task_idk,
            task_function: None,
        })
    }

    fn to_record(&self) -> TaskRecord {
        TaskRecord {
            task_idk: self.task_idk.clone(),
            version: self.version,
            task_metadata: Some(Json(self.task_metadata.clone())),
            task_tags: Some(Json(self.task_tags.clone())),
            name: Some(self.name.clone()),
            description: Some(self.description.clone()),
            schedule_sets: Some(Json(self.schedule_sets.clone())),
            thread_group: Some(self.thread_group.clone()),
            last_active: Some(self.last_active),
            status: Some(self.status.as_str().to_string()),
            notes: self.notes.clone(),
        }
    }

    /// Copy stored fields over this item, keeping its task function.
    fn refresh_from(&mut self, latest: TaskItem) {
        let function = self.task_function.take();
        *self = latest;
        self.task_function = function;
    }

    async fn write(&self, core: &Core) -> Result<(), OrchaError> {
        core.storage().upsert_task(&self.to_record()).await
    }

    /// A version strictly after the current one.
    fn next_version(&self) -> DateTime<Utc> {
        let now = clock::now();
        if now > self.version {
            now
        } else {
            self.version + Duration::microseconds(1)
        }
    }

    pub async fn get_all() -> Result<Vec<TaskItem>, OrchaError> {
        let core = confirm_initialised()?;
        core.storage()
            .latest_tasks()
            .await?
            .into_iter()
            .map(TaskItem::from_record)
            .collect()
    }

    pub async fn get(task_idk: &str) -> Result<Option<TaskItem>, OrchaError> {
        let core = confirm_initialised()?;
        core.storage()
            .latest_task(task_idk)
            .await?
            .map(TaskItem::from_record)
            .transpose()
    }

    /// Create a task, or update the stored one with the same `task_idk`.
    ///
    /// Schedule sets are keyed as `{task_idk}_{cron_schedule}`. A new version
    /// is only written when something other than status/activity changed.
    /// Inactive tasks come back enabled; disabled tasks stay disabled.
    pub async fn create(def: TaskDefinition) -> Result<TaskItem, OrchaError> {
        let core = confirm_initialised()?;

        let version = clock::now();
        let current = TaskItem::get(&def.task_idk).await?;
        let schedule_sets: Vec<ScheduleSet> = def
            .schedule_sets
            .iter()
            .map(|s| s.keyed_for(&def.task_idk))
            .collect();
        for set in &schedule_sets {
            set.cron()?;
        }

        let update_needed = match &current {
            None => true,
            Some(cur) => {
                cur.task_metadata != def.task_metadata
                    || cur.task_tags != def.task_tags
                    || cur.name != def.name
                    || cur.description != def.description
                    || cur.schedule_sets != schedule_sets
                    || cur.thread_group != def.thread_group
            }
        };

        let status = match &current {
            Some(cur) if cur.status != TaskStatus::Inactive => cur.status,
            _ => TaskStatus::Enabled,
        };

        let mut task = TaskItem {
            task_idk: def.task_idk,
            version,
            task_metadata: def.task_metadata,
            task_tags: def.task_tags,
            name: def.name,
            description: def.description,
            schedule_sets,
            thread_group: def.thread_group,
            last_active: version,
            status,
            notes: None,
            task_function: def.task_function,
        };

        // Register before writing so a missing runner leaves the database untouched.
        if def.register_with_runner {
            core.default_runner()?.register_task(task.clone()).await?;
        }

        match current {
            Some(cur) if !update_needed && cur.status == task.status => {
                task.version = cur.version;
                task.notes = cur.notes;
                debug!(task_idk = %task.task_idk, "task unchanged, keeping stored version");
            }
            Some(cur) if !update_needed => {
                // Only an inactive -> enabled change; still a new version.
                task.version = task.version.max(cur.version + Duration::microseconds(1));
                task.write(&core).await?;
            }
            _ => task.write(&core).await?,
        }
        Ok(task)
    }

    /// Write a new version with the given status.
    pub async fn set_status(
        &mut self,
        status: TaskStatus,
        notes: impl Into<String>,
    ) -> Result<(), OrchaError> {
        let core = confirm_initialised()?;
        self.status = status;
        self.notes = Some(notes.into());
        self.version = self.next_version();
        self.write(&core).await
    }

    pub async fn set_enabled(&mut self, notes: impl Into<String>) -> Result<(), OrchaError> {
        if self.status == TaskStatus::Enabled {
            return Ok(());
        }
        self.set_status(TaskStatus::Enabled, notes).await
    }

    /// Tell the scheduler this task is alive.
    ///
    /// Picks up the stored version first, so a task the scheduler marked
    /// inactive is re-enabled here.
    pub async fn update_active(&mut self) -> Result<(), OrchaError> {
        let core = confirm_initialised()?;
        if let Some(latest) = TaskItem::get(&self.task_idk).await? {
            self.refresh_from(latest);
        }
        if self.status == TaskStatus::Inactive {
            self.set_enabled("update_active reactivated task").await?;
        }
        self.last_active = clock::now();
        if !core
            .storage()
            .touch_task(&self.task_idk, self.last_active)
            .await?
        {
            self.write(&core).await?;
        }
        Ok(())
    }

    pub fn get_schedule_set(&self, set_idk: &str) -> Option<&ScheduleSet> {
        self.schedule_sets
            .iter()
            .find(|s| s.set_idk.as_deref() == Some(set_idk))
    }

    /// Most recent cron occurrence before now.
    pub fn get_last_scheduled(&self, schedule: &ScheduleSet) -> Result<DateTime<Utc>, OrchaError> {
        let cron = schedule.cron()?;
        cron.prev_before(clock::now())
            .ok_or_else(|| OrchaError::InvalidCron {
                expr: schedule.cron_schedule.clone(),
                reason: "no previous occurrence".to_string(),
            })
    }

    pub fn get_time_between_runs(&self, schedule: &ScheduleSet) -> Result<Duration, OrchaError> {
        let cron = schedule.cron()?;
        cron.interval(clock::now())
            .ok_or_else(|| OrchaError::InvalidCron {
                expr: schedule.cron_schedule.clone(),
                reason: "fewer than two upcoming occurrences".to_string(),
            })
    }

    /// Next cron occurrence, using the first schedule set when none is given.
    pub fn get_next_scheduled_time(
        &self,
        schedule: Option<&ScheduleSet>,
    ) -> Result<DateTime<Utc>, OrchaError> {
        let schedule = match schedule {
            Some(s) => s,
            None => self
                .schedule_sets
                .first()
                .ok_or_else(|| OrchaError::ScheduleSetNotFound {
                    task_idk: self.task_idk.clone(),
                })?,
        };
        schedule
            .cron()?
            .next_after(clock::now())
            .ok_or_else(|| OrchaError::InvalidCron {
                expr: schedule.cron_schedule.clone(),
                reason: "no upcoming occurrence".to_string(),
            })
    }

    pub async fn get_last_run(
        &self,
        schedule: Option<&ScheduleSet>,
    ) -> Result<Option<RunItem>, OrchaError> {
        RunItem::get_latest(self, schedule, None).await
    }

    pub async fn is_run_due(&self, schedule: &ScheduleSet) -> Result<bool, OrchaError> {
        Ok(self.is_run_due_with_last(schedule).await?.0)
    }

    /// Whether a scheduled run is due, along with the latest scheduled run.
    pub async fn is_run_due_with_last(
        &self,
        schedule: &ScheduleSet,
    ) -> Result<(bool, Option<RunItem>), OrchaError> {
        let last_run = RunItem::get_latest(self, Some(schedule), Some(RunType::Scheduled)).await?;
        let Some(last) = last_run else {
            return Ok((true, None));
        };
        let due = last.scheduled_time < self.get_last_scheduled(schedule)?;
        Ok((due, Some(last)))
    }

    /// Queue a scheduled run at the last cron occurrence, due or not.
    pub async fn schedule_run(&self, schedule: &ScheduleSet) -> Result<RunItem, OrchaError> {
        let scheduled_time = self.get_last_scheduled(schedule)?;
        RunItem::create(self, RunType::Scheduled, schedule, scheduled_time).await
    }

    pub async fn get_queued_runs(&self) -> Result<Vec<RunItem>, OrchaError> {
        RunItem::get_all_queued(self, None).await
    }

    pub async fn get_running_runs(&self) -> Result<Vec<RunItem>, OrchaError> {
        RunItem::get_running_runs(self, None).await
    }

    /// Delete runs scheduled more than `max_age` ago. Returns how many went.
    pub async fn prune_runs(&self, max_age: Option<Duration>) -> Result<u64, OrchaError> {
        let core = confirm_initialised()?;
        let Some(max_age) = max_age else {
            return Ok(0);
        };
        core.storage()
            .prune_runs(&self.task_idk, clock::now() - max_age)
            .await
    }

    pub fn task_function(&self) -> Option<&Arc<dyn TaskFunction>> {
        self.task_function.as_ref()
    }

    /// Run the task function for `run` with the given schedule config.
    pub async fn run_function(&self, run: RunItem, config: Value) -> Result<(), OrchaError> {
        let f = self
            .task_function
            .clone()
            .ok_or_else(|| OrchaError::MissingTaskFunction(self.task_idk.clone()))?;
        f.call(self.clone(), run, config).await
    }
}
