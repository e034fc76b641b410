use crate::types::status::RunStatus;
use sqlx::Error as SqlxError;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum OrchaError {
    #[error("orcha not initialised. Call orcha::initialise() first")]
    NotInitialised,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] SqlxError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid cron schedule '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Table {table} does not match the definition in the code: {reason}")]
    SchemaMismatch { table: String, reason: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Schedule set not found for task {task_idk}")]
    ScheduleSetNotFound { task_idk: String },

    #[error("Schedule set idk not set")]
    ScheduleSetWithoutKey,

    #[error("Run status is {from}, cannot set to {to}")]
    InvalidRunTransition { from: RunStatus, to: RunStatus },

    #[error("No task runner registered")]
    NoTaskRunner,

    #[error("Default task runner already set")]
    RunnerAlreadySet,

    #[error("task_id {0} does not implement task_function")]
    MissingTaskFunction(String),

    #[error("Exception in {name} ({module_idk}) module: {reason}")]
    Module {
        module_idk: String,
        name: String,
        reason: String,
    },

    #[error("{0}")]
    Task(String),

    #[error("Ractor error: {0}")]
    RactorError(String),

    #[error("Database not ready after {attempts} attempts: {source}")]
    NotReady {
        attempts: usize,
        #[source]
        source: Box<OrchaError>,
    },
}

impl OrchaError {
    /// Convenience for task functions reporting their own failures.
    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }
}

/// Errors worth retrying while the database is still coming up.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for SqlxError {
    fn is_retryable(&self) -> bool {
        match self {
            SqlxError::Io(_) | SqlxError::PoolTimedOut | SqlxError::Tls(_) => true,
            // 57P03: cannot_connect_now, the server is still starting up
            SqlxError::Database(db) => db.code().as_deref() == Some("57P03"),
            _ => false,
        }
    }
}

impl IsRetryable for OrchaError {
    fn is_retryable(&self) -> bool {
        match self {
            OrchaError::DatabaseError(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Configuration loading/validation errors.
#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("Missing credential: {0} must be set and non-empty")]
    MissingCredential(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to extract configuration: {0}")]
    Extract(#[from] figment::Error),
}

pub type Result<T> = std::result::Result<T, OrchaError>;
