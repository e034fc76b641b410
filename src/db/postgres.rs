use crate::config::CoreCredentials;
use crate::db::models::{RunRecord, TaskRecord};
use crate::db::schema::{CREATE_INDEXES, CREATE_SCHEMAS, EXPECTED_TABLES, column_mismatch};
use crate::error::{IsRetryable, OrchaError};
use crate::types::{RunStatus, RunType};
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

const TASK_COLUMNS: &str = "task_idk, version, task_metadata, task_tags, name, description, \
     schedule_sets, thread_group, last_active, status, notes";

const RUN_COLUMNS: &str = "run_idk, task_idf, set_idf, run_type, scheduled_time, start_time, \
     end_time, last_active, config, status, output";

pub fn connect_options(
    creds: &CoreCredentials,
    application_name: &str,
) -> Result<PgConnectOptions, OrchaError> {
    let (host, port) = creds.host_port()?;
    Ok(PgConnectOptions::new()
        .host(&host)
        .port(port)
        .username(&creds.user)
        .password(&creds.password)
        .database(&creds.db)
        .application_name(application_name))
}

/// Open the shared pool. Connections are established lazily on first use.
pub fn connect(creds: &CoreCredentials, application_name: &str) -> Result<PgPool, OrchaError> {
    let options = connect_options(creds, application_name)?;
    Ok(PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect_lazy_with(options))
}

/// `SELECT 1` round trip.
pub async fn ping(pool: &PgPool) -> Result<(), OrchaError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

fn timed_out(what: &str) -> OrchaError {
    OrchaError::DatabaseError(sqlx::Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        what.to_string(),
    )))
}

async fn probe(options: &PgConnectOptions, deadline: Instant) -> Result<(), OrchaError> {
    let attempt = async {
        let mut conn = PgConnection::connect_with(options).await?;
        sqlx::query("SELECT 1").execute(&mut conn).await?;
        conn.close().await?;
        Ok::<(), sqlx::Error>(())
    };
    let budget = CONNECT_ATTEMPT_TIMEOUT.min(deadline.saturating_duration_since(Instant::now()));
    match tokio::time::timeout(budget, attempt).await {
        Ok(res) => res.map_err(OrchaError::from),
        Err(_) => Err(timed_out("connection attempt timed out")),
    }
}

/// Poll the database until it answers `SELECT 1`, giving up once `timeout` has passed.
///
/// Connection-level failures are retried with exponential backoff. Anything
/// else (bad password, unknown database) is returned straight away.
pub async fn wait_for_database(
    creds: &CoreCredentials,
    timeout: Duration,
) -> Result<(), OrchaError> {
    let options = connect_options(creds, "orcha_readiness")?;
    let deadline = Instant::now() + timeout;
    let policy = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_max_delay(MAX_BACKOFF)
        .with_max_times(usize::MAX)
        .with_jitter();
    let attempts = Arc::new(AtomicUsize::new(0));

    info!(server = %creds.server, db = %creds.db, ?timeout, "waiting for database");
    let counter = attempts.clone();
    let retrying = (|| async {
        counter.fetch_add(1, Ordering::Relaxed);
        probe(&options, deadline).await
    })
    .retry(policy)
    .when(|e: &OrchaError| e.is_retryable())
    .notify(|err, dur: Duration| {
        warn!("Database not ready ({}), retrying in {:?}", err, dur);
    });
    let result = tokio::time::timeout_at(deadline.into(), retrying)
        .await
        .unwrap_or_else(|_| Err(timed_out("readiness budget spent")));

    let attempts = attempts.load(Ordering::Relaxed);
    match result {
        Ok(()) => {
            info!(attempts, "database is ready");
            Ok(())
        }
        Err(e) if e.is_retryable() => Err(OrchaError::NotReady {
            attempts,
            source: Box::new(e),
        }),
        Err(e) => Err(e),
    }
}

/// Filters for run queries. `None` fields are not applied.
#[derive(Debug, Clone, Default)]
pub struct RunFilter<'a> {
    pub since: Option<DateTime<Utc>>,
    pub set_idf: Option<&'a str>,
    pub run_type: Option<RunType>,
    pub status: Option<RunStatus>,
}

#[derive(Clone)]
pub struct OrchaStorage {
    pool: PgPool,
}

impl OrchaStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create schemas, tables and indexes, checking any existing table first.
    pub async fn build_schema(&self) -> Result<(), OrchaError> {
        for stmt in CREATE_SCHEMAS {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        self.check_definitions().await?;
        for def in EXPECTED_TABLES {
            sqlx::query(def.create).execute(&self.pool).await?;
        }
        for stmt in CREATE_INDEXES {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        debug!("orcha schema is up to date");
        Ok(())
    }

    /// Tables that already exist must have exactly the expected columns.
    pub async fn check_definitions(&self) -> Result<(), OrchaError> {
        for def in EXPECTED_TABLES {
            let actual: Vec<(String, String)> = sqlx::query_as(
                r#"SELECT column_name::text, data_type::text
                   FROM information_schema.columns
                   WHERE table_schema = $1 AND table_name = $2"#,
            )
            .bind(def.schema)
            .bind(def.table)
            .fetch_all(&self.pool)
            .await?;
            if actual.is_empty() {
                continue;
            }
            if let Some(reason) = column_mismatch(def, &actual) {
                return Err(OrchaError::SchemaMismatch {
                    table: def.qualified_name(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Latest version of every task.
    pub async fn latest_tasks(&self) -> Result<Vec<TaskRecord>, OrchaError> {
        let rows = sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT DISTINCT ON (task_idk) {TASK_COLUMNS} FROM orcha.tasks \
             ORDER BY task_idk, version DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn latest_task(&self, task_idk: &str) -> Result<Option<TaskRecord>, OrchaError> {
        let row = sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM orcha.tasks WHERE task_idk = $1 \
             ORDER BY version DESC LIMIT 1"
        ))
        .bind(task_idk)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Insert a task version, overwriting it if `(task_idk, version)` already exists.
    pub async fn upsert_task(&self, rec: &TaskRecord) -> Result<(), OrchaError> {
        sqlx::query(
            r#"
            INSERT INTO orcha.tasks (
                task_idk, version, task_metadata, task_tags, name, description,
                schedule_sets, thread_group, last_active, status, notes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (task_idk, version) DO UPDATE SET
                task_metadata = EXCLUDED.task_metadata,
                task_tags = EXCLUDED.task_tags,
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                schedule_sets = EXCLUDED.schedule_sets,
                thread_group = EXCLUDED.thread_group,
                last_active = EXCLUDED.last_active,
                status = EXCLUDED.status,
                notes = EXCLUDED.notes
            "#,
        )
        .bind(&rec.task_idk)
        .bind(rec.version)
        .bind(&rec.task_metadata)
        .bind(&rec.task_tags)
        .bind(&rec.name)
        .bind(&rec.description)
        .bind(&rec.schedule_sets)
        .bind(&rec.thread_group)
        .bind(rec.last_active)
        .bind(&rec.status)
        .bind(&rec.notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamp `last_active` on the newest version of a task.
    pub async fn touch_task(
        &self,
        task_idk: &str,
        last_active: DateTime<Utc>,
    ) -> Result<bool, OrchaError> {
        let res = sqlx::query(
            r#"UPDATE orcha.tasks SET last_active = $2
               WHERE task_idk = $1
                 AND version = (SELECT max(version) FROM orcha.tasks WHERE task_idk = $1)"#,
        )
        .bind(task_idk)
        .bind(last_active)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn upsert_run(&self, rec: &RunRecord) -> Result<(), OrchaError> {
        sqlx::query(
            r#"
            INSERT INTO orcha.runs (
                run_idk, task_idf, set_idf, run_type, scheduled_time, start_time,
                end_time, last_active, config, status, output
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (run_idk) DO UPDATE SET
                task_idf = EXCLUDED.task_idf,
                set_idf = EXCLUDED.set_idf,
                run_type = EXCLUDED.run_type,
                scheduled_time = EXCLUDED.scheduled_time,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                last_active = EXCLUDED.last_active,
                config = EXCLUDED.config,
                status = EXCLUDED.status,
                output = EXCLUDED.output
            "#,
        )
        .bind(&rec.run_idk)
        .bind(&rec.task_idf)
        .bind(&rec.set_idf)
        .bind(&rec.run_type)
        .bind(rec.scheduled_time)
        .bind(rec.start_time)
        .bind(rec.end_time)
        .bind(rec.last_active)
        .bind(&rec.config)
        .bind(&rec.status)
        .bind(&rec.output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, run_idk: &str) -> Result<Option<RunRecord>, OrchaError> {
        let row = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM orcha.runs WHERE run_idk = $1"
        ))
        .bind(run_idk)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Runs of a task, newest scheduled first.
    pub async fn list_runs(
        &self,
        task_idf: &str,
        filter: &RunFilter<'_>,
    ) -> Result<Vec<RunRecord>, OrchaError> {
        let rows = sqlx::query_as::<_, RunRecord>(&format!(
            r#"SELECT {RUN_COLUMNS} FROM orcha.runs
               WHERE task_idf = $1
                 AND ($2::timestamptz IS NULL OR scheduled_time >= $2)
                 AND ($3::text IS NULL OR set_idf = $3)
                 AND ($4::text IS NULL OR run_type = $4)
                 AND ($5::text IS NULL OR status = $5)
               ORDER BY scheduled_time DESC"#
        ))
        .bind(task_idf)
        .bind(filter.since)
        .bind(filter.set_idf)
        .bind(filter.run_type.map(|t| t.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn touch_run(
        &self,
        run_idk: &str,
        last_active: DateTime<Utc>,
    ) -> Result<bool, OrchaError> {
        let res = sqlx::query("UPDATE orcha.runs SET last_active = $2 WHERE run_idk = $1")
            .bind(run_idk)
            .bind(last_active)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn delete_run(&self, run_idk: &str) -> Result<(), OrchaError> {
        sqlx::query("DELETE FROM orcha.runs WHERE run_idk = $1")
            .bind(run_idk)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a task's runs scheduled before `cutoff`. Returns the number deleted.
    pub async fn prune_runs(
        &self,
        task_idf: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, OrchaError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"WITH deleted AS (
                   DELETE FROM orcha.runs
                   WHERE task_idf = $1 AND scheduled_time < $2
                   RETURNING 1
               )
               SELECT COUNT(*) FROM deleted"#,
        )
        .bind(task_idf)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readiness_gives_up_within_its_budget() {
        // Accepts connections at the TCP level but never speaks the protocol.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let creds = CoreCredentials::new("orcha_user", "secret", format!("127.0.0.1:{port}"), "orcha");

        let started = Instant::now();
        let res = wait_for_database(&creds, Duration::from_secs(2)).await;
        let elapsed = started.elapsed();

        assert!(matches!(res, Err(OrchaError::NotReady { .. })), "got {res:?}");
        assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
        drop(listener);
    }

    #[tokio::test]
    async fn unreachable_server_is_retried_until_the_deadline() {
        // Bound then dropped, so nothing listens on the port.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let creds = CoreCredentials::new("orcha_user", "secret", format!("127.0.0.1:{port}"), "orcha");

        let started = Instant::now();
        match wait_for_database(&creds, Duration::from_secs(1)).await {
            Err(OrchaError::NotReady { attempts, .. }) => assert!(attempts >= 2),
            other => panic!("expected NotReady, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
