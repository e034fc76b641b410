#![allow(dead_code)]

use orcha::tasks::TaskFunction;
use orcha::{CoreCredentials, LogManager, OrchaError, ScheduleSet, TaskDefinition, TaskItem};
use serde_json::{Value, json};
use std::time::Duration;

/// Fails fast when the database variables are missing.
pub fn credentials() -> CoreCredentials {
    CoreCredentials::from_env().expect("ORCHA_CORE_USER/PASSWORD/SERVER/DB must all be set")
}

pub async fn wait_for_database() {
    orcha::db::wait_for_database(&credentials(), Duration::from_secs(60))
        .await
        .expect("database never became ready");
}

/// Ready, initialised and empty.
pub async fn setup() -> LogManager {
    wait_for_database().await;
    let log = orcha::initialise(&credentials(), "orcha_tests")
        .await
        .expect("initialise failed");
    empty_database().await;
    log
}

pub async fn empty_database() {
    let core = orcha::confirm_initialised().expect("core not initialised");
    sqlx::query(
        r#"
        DO $$
        BEGIN
            IF EXISTS (SELECT FROM information_schema.tables WHERE table_schema = 'orcha' AND table_name = 'tasks') THEN
                EXECUTE 'TRUNCATE TABLE orcha.tasks';
            END IF;
            IF EXISTS (SELECT FROM information_schema.tables WHERE table_schema = 'orcha' AND table_name = 'runs') THEN
                EXECUTE 'TRUNCATE TABLE orcha.runs';
            END IF;
            IF EXISTS (SELECT FROM information_schema.tables WHERE table_schema = 'orcha_logs' AND table_name = 'logs') THEN
                EXECUTE 'TRUNCATE TABLE orcha_logs.logs';
            END IF;
        END $$;
        "#,
    )
    .execute(core.storage().pool())
    .await
    .expect("truncating orcha tables failed");
}

pub fn every_minute() -> ScheduleSet {
    ScheduleSet::new("* * * * *", json!({}))
}

pub fn task_id(number: &str) -> String {
    format!("test_task_{number}")
}

/// `test_task_{number}` in `test_thread_group`, doing nothing unless `function` is given.
pub fn test_task(number: &str, schedule_sets: Vec<ScheduleSet>, register: bool) -> TaskDefinition {
    TaskDefinition::new(
        task_id(number),
        format!("Test Task {number}"),
        format!("A test task for task {number}"),
    )
    .schedule_sets(schedule_sets)
    .thread_group("test_thread_group")
    .register_with_runner(register)
    .function(|_task: TaskItem, _run: orcha::RunItem, _config: Value| async {
        Ok::<_, OrchaError>(())
    })
}

pub async fn create_test_task(number: &str, register: bool) -> TaskItem {
    TaskItem::create(test_task(number, vec![every_minute()], register))
        .await
        .expect("creating test task failed")
}

pub async fn create_task_with(
    number: &str,
    schedule_sets: Vec<ScheduleSet>,
    function: impl TaskFunction + 'static,
) -> TaskItem {
    TaskItem::create(test_task(number, schedule_sets, true).function(function))
        .await
        .expect("creating test task failed")
}

pub fn since_yesterday() -> Option<chrono::DateTime<chrono::Utc>> {
    Some(orcha::clock::now() - chrono::Duration::days(1))
}
