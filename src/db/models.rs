use crate::types::ScheduleSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use sqlx::types::Json;

/// One version of a task as stored in `orcha.tasks`.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRecord {
    pub task_idk: String,
    pub version: DateTime<Utc>,
    pub task_metadata: Option<Json<Value>>,
    pub task_tags: Option<Json<Vec<String>>>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub schedule_sets: Option<Json<Vec<ScheduleSet>>>,
    pub thread_group: Option<String>,
    pub last_active: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub notes: Option<String>,
}

/// A row of `orcha.runs`.
#[derive(Debug, Clone, FromRow)]
pub struct RunRecord {
    pub run_idk: String,
    pub task_idf: Option<String>,
    pub set_idf: Option<String>,
    pub run_type: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub config: Option<Json<Value>>,
    pub status: Option<String>,
    pub output: Option<Json<Map<String, Value>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ServiceStatusRecord {
    pub service_type: String,
    pub service_idf: String,
    pub status_time: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct LogRecord {
    pub created: Option<DateTime<Utc>>,
    pub id: uuid::Uuid,
    pub actor: Option<String>,
    pub source: Option<String>,
    pub category: Option<String>,
    pub text: Option<String>,
    pub json: Option<Json<Value>>,
}
