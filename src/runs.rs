//! Runs: one execution of a task for one schedule set.
//!
//! Each run is a single row in `orcha.runs` that is updated in place as it
//! moves through its states. State changes are checked against the stored
//! row, not the in-memory copy, because the runner, the scheduler and the
//! task function itself may all touch the same run.

use crate::clock;
use crate::core::{Core, confirm_initialised};
use crate::db::RunFilter;
use crate::db::models::RunRecord;
use crate::error::OrchaError;
use crate::modules::ModuleRunTime;
use crate::tasks::TaskItem;
use crate::types::{RunStatus, RunType, ScheduleSet, Transition};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A task given either by id or as an already loaded item.
#[derive(Debug, Clone, Copy)]
pub enum TaskRef<'a> {
    Id(&'a str),
    Item(&'a TaskItem),
}

impl<'a> From<&'a str> for TaskRef<'a> {
    fn from(id: &'a str) -> Self {
        TaskRef::Id(id)
    }
}

impl<'a> From<&'a String> for TaskRef<'a> {
    fn from(id: &'a String) -> Self {
        TaskRef::Id(id.as_str())
    }
}

impl<'a> From<&'a TaskItem> for TaskRef<'a> {
    fn from(task: &'a TaskItem) -> Self {
        TaskRef::Item(task)
    }
}

impl<'a> TaskRef<'a> {
    async fn resolve(self) -> Result<Cow<'a, TaskItem>, OrchaError> {
        match self {
            TaskRef::Item(task) => Ok(Cow::Borrowed(task)),
            TaskRef::Id(id) => TaskItem::get(id)
                .await?
                .map(Cow::Owned)
                .ok_or_else(|| OrchaError::TaskNotFound(id.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunItem {
    pub run_idk: String,
    pub task_idf: String,
    pub set_idf: String,
    pub run_type: RunType,
    pub scheduled_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub config: Value,
    pub status: RunStatus,
    pub output: Option<Map<String, Value>>,
    // Shared between clones so module timings recorded inside the task
    // function are visible to the runner.
    run_times: Arc<Mutex<Vec<ModuleRunTime>>>,
}

fn required<T>(value: Option<T>, column: &str) -> Result<T, OrchaError> {
    value.ok_or_else(|| {
        OrchaError::DatabaseError(sqlx::Error::Decode(
            format!("orcha.runs.{column} is null").into(),
        ))
    })
}

fn decode<T: std::str::FromStr<Err = String>>(value: Option<String>, column: &str) -> Result<T, OrchaError> {
    required(value, column)?
        .parse::<T>()
        .map_err(|e| OrchaError::DatabaseError(sqlx::Error::Decode(e.into())))
}

enum Prepared {
    /// Already in the target status.
    Skip,
    /// Go ahead; carries the stored row if there is one.
    Apply(Option<RunItem>),
}

/// Objects are used as is, `null` is empty, anything else lands under `"value"`.
pub(crate) fn into_output(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Fill `output` with the stored keys; stored values win.
fn merge_stored(output: &mut Map<String, Value>, stored: Option<&Map<String, Value>>) {
    if let Some(stored) = stored {
        for (k, v) in stored {
            output.insert(k.clone(), v.clone());
        }
    }
}

impl RunItem {
    fn from_record(rec: RunRecord) -> Result<Self, OrchaError> {
        Ok(Self {
            task_idf: required(rec.task_idf, "task_idf")?,
            set_idf: required(rec.set_idf, "set_idf")?,
            run_type: decode(rec.run_type, "run_type")?,
            scheduled_time: required(rec.scheduled_time, "scheduled_time")?,
            start_time: rec.start_time,
            end_time: rec.end_time,
            last_active: rec.last_active,
            config: rec.config.map(|j| j.0).unwrap_or(Value::Null),
            status: decode(rec.status, "status")?,
            output: rec.output.map(|j| j.0),
            run_idk: rec.run_idk,
            run_times: Arc::default(),
        })
    }

    fn to_record(&self) -> RunRecord {
        RunRecord {
            run_idk: self.run_idk.clone(),
            task_idf: Some(self.task_idf.clone()),
            set_idf: Some(self.set_idf.clone()),
            run_type: Some(self.run_type.as_str().to_string()),
            scheduled_time: Some(self.scheduled_time),
            start_time: self.start_time,
            end_time: self.end_time,
            last_active: self.last_active,
            config: Some(Json(self.config.clone())),
            status: Some(self.status.as_str().to_string()),
            output: self.output.clone().map(Json),
        }
    }

    /// Take the stored state, keeping this item's module timings.
    fn sync_from(&mut self, stored: RunItem) {
        let run_times = self.run_times.clone();
        *self = stored;
        self.run_times = run_times;
    }

    #[cfg(test)]
    pub(crate) fn detached(
        task: &TaskItem,
        schedule: &ScheduleSet,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        Self {
            run_idk: Uuid::new_v4().to_string(),
            task_idf: task.task_idk.clone(),
            set_idf: schedule.set_idk.clone().unwrap_or_default(),
            run_type: RunType::Manual,
            scheduled_time,
            start_time: None,
            end_time: None,
            last_active: None,
            config: schedule.config.clone(),
            status: RunStatus::Queued,
            output: None,
            run_times: Arc::default(),
        }
    }

    /// Queue a new run. The schedule set must already be keyed.
    pub async fn create(
        task: &TaskItem,
        run_type: RunType,
        schedule: &ScheduleSet,
        scheduled_time: DateTime<Utc>,
    ) -> Result<RunItem, OrchaError> {
        let core = confirm_initialised()?;
        let set_idf = schedule.key()?.to_string();
        let run = RunItem {
            run_idk: Uuid::new_v4().to_string(),
            task_idf: task.task_idk.clone(),
            set_idf,
            run_type,
            scheduled_time,
            start_time: None,
            end_time: None,
            last_active: None,
            config: schedule.config.clone(),
            status: RunStatus::Queued,
            output: None,
            run_times: Arc::default(),
        };
        run.write(&core).await?;
        Ok(run)
    }

    async fn query<'a>(
        task: TaskRef<'a>,
        filter: RunFilter<'_>,
    ) -> Result<Vec<RunItem>, OrchaError> {
        let core = confirm_initialised()?;
        let task = task.resolve().await?;
        core.storage()
            .list_runs(&task.task_idk, &filter)
            .await?
            .into_iter()
            .map(RunItem::from_record)
            .collect()
    }

    /// Runs of a task scheduled at or after `since` (all of them when `None`).
    ///
    /// A given schedule set must belong to the task.
    pub async fn get_all<'a>(
        task: impl Into<TaskRef<'a>>,
        since: Option<DateTime<Utc>>,
        schedule: Option<&ScheduleSet>,
        run_type: Option<RunType>,
    ) -> Result<Vec<RunItem>, OrchaError> {
        confirm_initialised()?;
        let task = task.into().resolve().await?;
        let set_idf = match schedule {
            Some(s) => {
                let key = s.set_idk.as_deref();
                if !task.schedule_sets.iter().any(|t| t.set_idk.as_deref() == key) || key.is_none()
                {
                    return Err(OrchaError::ScheduleSetNotFound {
                        task_idk: task.task_idk.clone(),
                    });
                }
                key
            }
            None => None,
        };
        Self::query(
            TaskRef::Item(&task),
            RunFilter {
                since,
                set_idf,
                run_type,
                status: None,
            },
        )
        .await
    }

    async fn get_by_status<'a>(
        task: TaskRef<'a>,
        schedule: Option<&ScheduleSet>,
        status: RunStatus,
    ) -> Result<Vec<RunItem>, OrchaError> {
        confirm_initialised()?;
        Self::query(
            task,
            RunFilter {
                set_idf: schedule.and_then(|s| s.set_idk.as_deref()),
                status: Some(status),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn get_all_queued<'a>(
        task: impl Into<TaskRef<'a>>,
        schedule: Option<&ScheduleSet>,
    ) -> Result<Vec<RunItem>, OrchaError> {
        Self::get_by_status(task.into(), schedule, RunStatus::Queued).await
    }

    pub async fn get_running_runs<'a>(
        task: impl Into<TaskRef<'a>>,
        schedule: Option<&ScheduleSet>,
    ) -> Result<Vec<RunItem>, OrchaError> {
        Self::get_by_status(task.into(), schedule, RunStatus::Running).await
    }

    /// The run with the latest scheduled time.
    ///
    /// With a schedule set, only the last two intervals before the most recent
    /// cron occurrence are searched first; the full history is the fallback.
    pub async fn get_latest<'a>(
        task: impl Into<TaskRef<'a>>,
        schedule: Option<&ScheduleSet>,
        run_type: Option<RunType>,
    ) -> Result<Option<RunItem>, OrchaError> {
        confirm_initialised()?;
        let task = task.into().resolve().await?;
        let mut runs = Vec::new();
        if let Some(schedule) = schedule {
            let last = task.get_last_scheduled(schedule)?;
            let gap = task.get_time_between_runs(schedule)?;
            runs = Self::get_all(&*task, Some(last - gap * 2), Some(schedule), run_type)
                .await?;
        }
        if runs.is_empty() {
            runs = Self::get_all(&*task, None, schedule, run_type).await?;
        }
        Ok(runs.into_iter().max_by_key(|r| r.scheduled_time))
    }

    pub async fn get(run_id: &str) -> Result<Option<RunItem>, OrchaError> {
        let core = confirm_initialised()?;
        core.storage()
            .get_run(run_id)
            .await?
            .map(RunItem::from_record)
            .transpose()
    }

    pub async fn reload(&mut self) -> Result<(), OrchaError> {
        let stored = RunItem::get(&self.run_idk)
            .await?
            .ok_or_else(|| OrchaError::RunNotFound(self.run_idk.clone()))?;
        self.sync_from(stored);
        Ok(())
    }

    /// Removes the database row; the item itself is left as is.
    pub async fn delete(&self) -> Result<(), OrchaError> {
        let core = confirm_initialised()?;
        core.storage().delete_run(&self.run_idk).await
    }

    /// Stamp `last_active` without touching any other column.
    pub async fn update_active(&mut self) -> Result<(), OrchaError> {
        let core = confirm_initialised()?;
        let now = clock::now();
        if !core.storage().touch_run(&self.run_idk, now).await? {
            return Err(OrchaError::RunNotFound(self.run_idk.clone()));
        }
        self.last_active = Some(now);
        Ok(())
    }

    /// Write this item as is, bypassing the state checks.
    pub async fn save(&self) -> Result<(), OrchaError> {
        let core = confirm_initialised()?;
        self.write(&core).await
    }

    async fn write(&self, core: &Core) -> Result<(), OrchaError> {
        core.storage().upsert_run(&self.to_record()).await
    }

    /// Check `to` against the stored row and merge its output into `output`.
    async fn prepare(
        &mut self,
        to: RunStatus,
        output: &mut Map<String, Value>,
    ) -> Result<Prepared, OrchaError> {
        let Some(db) = RunItem::get(&self.run_idk).await? else {
            return Ok(Prepared::Apply(None));
        };
        match db.status.transition_to(to) {
            None => Err(OrchaError::InvalidRunTransition {
                from: db.status,
                to,
            }),
            Some(Transition::Skip) => {
                self.sync_from(db);
                Ok(Prepared::Skip)
            }
            Some(Transition::Apply) => {
                merge_stored(output, db.output.as_ref());
                Ok(Prepared::Apply(Some(db)))
            }
        }
    }

    /// Apply a change, writing only when it differs from `stored`.
    async fn update(
        &mut self,
        stored: Option<RunItem>,
        status: RunStatus,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        output: Option<Map<String, Value>>,
    ) -> Result<(), OrchaError> {
        let core = confirm_initialised()?;
        self.status = status;
        self.start_time = start_time;
        self.end_time = end_time;
        self.output = output;

        let needs_update = match &stored {
            None => true,
            Some(db) => {
                db.status != self.status
                    || db.start_time != self.start_time
                    || db.end_time != self.end_time
                    || db.output != self.output
            }
        };
        if needs_update {
            if let Some(db) = stored {
                self.last_active = db.last_active;
            }
            self.write(&core).await?;
        }
        Ok(())
    }

    /// `queued` -> `running`. A no-op when already running.
    pub async fn set_running(&mut self, output: Value) -> Result<(), OrchaError> {
        let mut output = into_output(output);
        let Prepared::Apply(stored) = self.prepare(RunStatus::Running, &mut output).await? else {
            return Ok(());
        };
        self.update(stored, RunStatus::Running, Some(clock::now()), None, Some(output))
            .await
    }

    /// Refused once the run has failed or warned.
    pub async fn set_success(&mut self, output: Value) -> Result<(), OrchaError> {
        let mut output = into_output(output);
        let Prepared::Apply(stored) = self.prepare(RunStatus::Success, &mut output).await? else {
            return Ok(());
        };
        let start = self.stored_start(stored.as_ref());
        self.update(stored, RunStatus::Success, start, Some(clock::now()), Some(output))
            .await
    }

    /// Refused once the run has failed.
    pub async fn set_warn(&mut self, output: Value) -> Result<(), OrchaError> {
        let mut output = into_output(output);
        let Prepared::Apply(stored) = self.prepare(RunStatus::Warn, &mut output).await? else {
            return Ok(());
        };
        let start = self.stored_start(stored.as_ref());
        self.update(stored, RunStatus::Warn, start, Some(clock::now()), Some(output))
            .await
    }

    /// A cancelled run stays cancelled.
    ///
    /// With `zero_duration` the end time is the start time, for runs whose
    /// real end is unknown.
    pub async fn set_failed(&mut self, output: Value, zero_duration: bool) -> Result<(), OrchaError> {
        let mut output = into_output(output);
        let Prepared::Apply(stored) = self.prepare(RunStatus::Failed, &mut output).await? else {
            return Ok(());
        };
        let start = self.stored_start(stored.as_ref());
        let end = if zero_duration { start } else { Some(clock::now()) };
        self.update(stored, RunStatus::Failed, start, end, Some(output))
            .await
    }

    pub async fn set_cancelled(
        &mut self,
        output: Value,
        zero_duration: bool,
    ) -> Result<(), OrchaError> {
        let mut output = into_output(output);
        let Prepared::Apply(stored) = self.prepare(RunStatus::Cancelled, &mut output).await? else {
            return Ok(());
        };
        let start = self.stored_start(stored.as_ref());
        let end = if zero_duration { start } else { Some(clock::now()) };
        self.update(stored, RunStatus::Cancelled, start, end, Some(output))
            .await
    }

    /// Replace the output, or merge into it when `merge` is set (new keys win).
    ///
    /// Status and times are left as stored.
    pub async fn set_output(&mut self, output: Option<Value>, merge: bool) -> Result<(), OrchaError> {
        let stored = RunItem::get(&self.run_idk)
            .await?
            .ok_or_else(|| OrchaError::RunNotFound(self.run_idk.clone()))?;
        let output = output.map(into_output);
        let new_output = if merge {
            let mut merged = stored.output.clone().unwrap_or_default();
            if let Some(output) = output {
                merged.extend(output);
            }
            Some(merged)
        } else {
            output
        };
        let (status, start, end) = (stored.status, stored.start_time, stored.end_time);
        self.update(Some(stored), status, start, end, new_output)
            .await
    }

    fn stored_start(&self, stored: Option<&RunItem>) -> Option<DateTime<Utc>> {
        stored
            .and_then(|db| db.start_time)
            .or(self.start_time)
    }

    /// Record a module timing against this run.
    pub fn record_run_time(&self, run_time: ModuleRunTime) {
        self.run_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(run_time);
    }

    pub fn run_times(&self) -> Vec<ModuleRunTime> {
        self.run_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// `{"run_times": [...]}`, ready to merge into the output.
    pub fn run_times_output(&self) -> Value {
        let times = self.run_times();
        serde_json::json!({ "run_times": times })
    }
}
