//! Building blocks task functions use to move data around.
//!
//! A module is anything with a [`ModuleInfo`]. Sources fetch rows, sinks save
//! them and validations check them. Rows are JSON objects. When a module is
//! called with a run, its duration is recorded on that run and ends up under
//! `output.run_times` once the runner finishes it. Errors are rewrapped so the
//! run output names the module that failed.

use crate::error::OrchaError;
use crate::runs::RunItem;
use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::PgPool;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub type Row = Map<String, Value>;
pub type Rows = Vec<Row>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub module_idk: String,
    pub name: String,
    pub description: String,
}

impl ModuleInfo {
    pub fn new(
        module_idk: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            module_idk: module_idk.into(),
            name: name.into(),
            description: description.into(),
        }
    }

    /// Attach this module's identity to an error.
    pub fn wrap_error(&self, err: OrchaError) -> OrchaError {
        if let OrchaError::Module { module_idk, .. } = &err {
            if module_idk == &self.module_idk {
                return err;
            }
        }
        OrchaError::Module {
            module_idk: self.module_idk.clone(),
            name: self.name.clone(),
            reason: err.to_string(),
        }
    }
}

/// How long one module call took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRunTime {
    pub module_idk: String,
    pub start_time_posix: f64,
    pub end_time_posix: f64,
    pub duration_seconds: f64,
}

fn posix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Await `fut`, recording its duration on `run` and rewrapping any error.
pub async fn timed<T, F>(info: &ModuleInfo, run: Option<&RunItem>, fut: F) -> Result<T, OrchaError>
where
    F: Future<Output = Result<T, OrchaError>>,
{
    let start = posix_now();
    let res = fut.await;
    let end = posix_now();
    if let Some(run) = run {
        run.record_run_time(ModuleRunTime {
            module_idk: info.module_idk.clone(),
            start_time_posix: start,
            end_time_posix: end,
            duration_seconds: end - start,
        });
    }
    debug!(module_idk = %info.module_idk, duration = end - start, ok = res.is_ok(), "module call finished");
    res.map_err(|e| info.wrap_error(e))
}

/// Credentials for an external system.
#[derive(Clone)]
pub struct Entity {
    pub info: ModuleInfo,
    pub user_name: String,
    pub password: String,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("info", &self.info)
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Entity {
    pub fn new(info: ModuleInfo, user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            info,
            user_name: user_name.into(),
            password: password.into(),
        }
    }
}

#[ractor::async_trait]
pub trait Source: Send + Sync {
    fn info(&self) -> &ModuleInfo;

    async fn fetch(&self, params: &Value) -> Result<Rows, OrchaError>;

    /// [`Source::fetch`], timed against `run`.
    async fn get(&self, run: Option<&RunItem>, params: &Value) -> Result<Rows, OrchaError> {
        timed(self.info(), run, self.fetch(params)).await
    }
}

#[ractor::async_trait]
pub trait Sink: Send + Sync {
    fn info(&self) -> &ModuleInfo;

    async fn write(&self, rows: &Rows, params: &Value) -> Result<u64, OrchaError>;

    /// [`Sink::write`], timed against `run`. Returns the number of rows saved.
    async fn save(&self, run: Option<&RunItem>, rows: &Rows, params: &Value) -> Result<u64, OrchaError> {
        timed(self.info(), run, self.write(rows, params)).await
    }
}

type SourceFn = dyn Fn(Value) -> BoxFuture<'static, Result<Rows, OrchaError>> + Send + Sync;
type SinkFn = dyn Fn(Rows, Value) -> BoxFuture<'static, Result<u64, OrchaError>> + Send + Sync;

/// A source backed by an async closure.
#[derive(Clone)]
pub struct FnSource {
    info: ModuleInfo,
    entity: Option<Entity>,
    function: Arc<SourceFn>,
}

impl FnSource {
    pub fn new<F, Fut>(info: ModuleInfo, entity: Option<Entity>, function: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rows, OrchaError>> + Send + 'static,
    {
        Self {
            info,
            entity,
            function: Arc::new(
                move |params: Value| -> BoxFuture<'static, Result<Rows, OrchaError>> {
                    Box::pin(function(params))
                },
            ),
        }
    }

    pub fn entity(&self) -> Option<&Entity> {
        self.entity.as_ref()
    }
}

#[ractor::async_trait]
impl Source for FnSource {
    fn info(&self) -> &ModuleInfo {
        &self.info
    }

    async fn fetch(&self, params: &Value) -> Result<Rows, OrchaError> {
        (self.function)(params.clone()).await
    }
}

/// A sink backed by an async closure.
#[derive(Clone)]
pub struct FnSink {
    info: ModuleInfo,
    entity: Option<Entity>,
    function: Arc<SinkFn>,
}

impl FnSink {
    pub fn new<F, Fut>(info: ModuleInfo, entity: Option<Entity>, function: F) -> Self
    where
        F: Fn(Rows, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<u64, OrchaError>> + Send + 'static,
    {
        Self {
            info,
            entity,
            function: Arc::new(
                move |rows: Rows, params: Value| -> BoxFuture<'static, Result<u64, OrchaError>> {
                    Box::pin(function(rows, params))
                },
            ),
        }
    }

    pub fn entity(&self) -> Option<&Entity> {
        self.entity.as_ref()
    }
}

#[ractor::async_trait]
impl Sink for FnSink {
    fn info(&self) -> &ModuleInfo {
        &self.info
    }

    async fn write(&self, rows: &Rows, params: &Value) -> Result<u64, OrchaError> {
        (self.function)(rows.clone(), params.clone()).await
    }
}

type ValidationFn = dyn Fn(&Rows) -> Result<bool, OrchaError> + Send + Sync;

/// A check over rows, usually between a source and a sink.
#[derive(Clone)]
pub struct Validation {
    info: ModuleInfo,
    function: Arc<ValidationFn>,
}

impl Validation {
    pub fn new<F>(info: ModuleInfo, function: F) -> Self
    where
        F: Fn(&Rows) -> Result<bool, OrchaError> + Send + Sync + 'static,
    {
        Self {
            info,
            function: Arc::new(function),
        }
    }

    pub fn info(&self) -> &ModuleInfo {
        &self.info
    }

    pub async fn validate(&self, run: Option<&RunItem>, rows: &Rows) -> Result<bool, OrchaError> {
        timed(&self.info, run, async { (self.function)(rows) }).await
    }
}

/// A Postgres database reachable with an entity's credentials.
#[derive(Clone)]
pub struct PostgresEntity {
    pub entity: Entity,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub schema_name: String,
    pool: PgPool,
}

impl fmt::Debug for PostgresEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresEntity")
            .field("entity", &self.entity)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_name", &self.database_name)
            .field("schema_name", &self.schema_name)
            .finish()
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

impl PostgresEntity {
    /// Connections are opened lazily on first query.
    pub fn new(
        entity: Entity,
        host: impl Into<String>,
        port: u16,
        database_name: impl Into<String>,
        schema_name: impl Into<String>,
    ) -> Self {
        let host = host.into();
        let database_name = database_name.into();
        let options = PgConnectOptions::new()
            .host(&host)
            .port(port)
            .username(&entity.user_name)
            .password(&entity.password)
            .database(&database_name)
            .application_name(&entity.info.module_idk);
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy_with(options);
        Self {
            entity,
            host,
            port,
            database_name,
            schema_name: schema_name.into(),
            pool,
        }
    }

    pub fn info(&self) -> &ModuleInfo {
        &self.entity.info
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `schema.table`, quoted.
    pub fn qualified_table(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema_name), quote_ident(table))
    }

    /// Run a query and return each row as a JSON object.
    pub async fn fetch_rows(&self, query: &str) -> Result<Rows, OrchaError> {
        let wrapped = format!("SELECT row_to_json(q)::jsonb FROM ({query}) AS q");
        let rows: Vec<(Json<Row>,)> = sqlx::query_as(&wrapped).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(row,)| row.0).collect())
    }

    /// Run a statement, returning the number of rows affected.
    pub async fn execute(&self, statement: &str) -> Result<u64, OrchaError> {
        let res = sqlx::query(statement).execute(&self.pool).await?;
        Ok(res.rows_affected())
    }
}

/// Rows from a query against a [`PostgresEntity`].
#[derive(Debug, Clone)]
pub struct PostgresSource {
    info: ModuleInfo,
    pub entity: PostgresEntity,
    pub query: String,
}

impl PostgresSource {
    pub fn new(info: ModuleInfo, entity: PostgresEntity, query: impl Into<String>) -> Self {
        Self {
            info,
            entity,
            query: query.into(),
        }
    }
}

#[ractor::async_trait]
impl Source for PostgresSource {
    fn info(&self) -> &ModuleInfo {
        &self.info
    }

    async fn fetch(&self, _params: &Value) -> Result<Rows, OrchaError> {
        self.entity.fetch_rows(&self.query).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfExists {
    Append,
    /// Empty the table before inserting.
    Replace,
}

/// Inserts rows into an existing table, matching JSON keys to column names.
#[derive(Debug, Clone)]
pub struct PostgresSink {
    info: ModuleInfo,
    pub entity: PostgresEntity,
    pub table_name: String,
    pub if_exists: IfExists,
}

impl PostgresSink {
    pub fn new(
        info: ModuleInfo,
        entity: PostgresEntity,
        table_name: impl Into<String>,
        if_exists: IfExists,
    ) -> Self {
        Self {
            info,
            entity,
            table_name: table_name.into(),
            if_exists,
        }
    }
}

#[ractor::async_trait]
impl Sink for PostgresSink {
    fn info(&self) -> &ModuleInfo {
        &self.info
    }

    async fn write(&self, rows: &Rows, _params: &Value) -> Result<u64, OrchaError> {
        let table = self.entity.qualified_table(&self.table_name);
        let mut tx = self.entity.pool().begin().await?;
        if self.if_exists == IfExists::Replace {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        let res = sqlx::query(&format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1)"
        ))
        .bind(Json(rows))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(res.rows_affected())
    }
}
