//! Database-backed tests. Each test initialises the core afresh and empties the
//! tables, so they share one database and must not run in parallel.

mod common;

use chrono::Duration as ChronoDuration;
use common::{create_task_with, create_test_task, every_minute, setup, since_yesterday, task_id};
use orcha::modules::{
    Entity, FnSource, IfExists, ModuleInfo, PostgresEntity, PostgresSink, PostgresSource, Rows, Sink,
    Source,
};
use orcha::service::{Scheduler, SchedulerConfig, TaskRunner, TaskRunnerConfig};
use orcha::{OrchaError, RunItem, RunStatus, RunType, ScheduleSet, TaskItem, TaskStatus};
use serde_json::{Value, json};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

fn runner_config() -> TaskRunnerConfig {
    TaskRunnerConfig {
        run_in_background: false,
        heartbeat_secs: 1,
        ..Default::default()
    }
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_secs: 3600,
        task_refresh_secs: 0,
        prune_secs: 0,
        ..Default::default()
    }
}

/// A started scheduler with its first pass done.
async fn started_scheduler() -> Scheduler {
    let scheduler = Scheduler::new(scheduler_config());
    scheduler.start().await.unwrap();
    scheduler.tick_now().await.unwrap();
    scheduler
}

fn rows(values: &[i64]) -> Rows {
    values
        .iter()
        .map(|v| json!({ "test": v }).as_object().cloned().unwrap())
        .collect()
}

async fn runs_for(task: &TaskItem, set: usize) -> Vec<RunItem> {
    RunItem::get_all(task, since_yesterday(), Some(&task.schedule_sets[set]), None)
        .await
        .unwrap()
}

// ---- tasks ----

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn no_tasks_after_emptying() {
    setup().await;
    assert!(TaskItem::get_all().await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn create_task() {
    setup().await;
    create_test_task("a_003_test_task", false).await;
    let task = TaskItem::get(&task_id("a_003_test_task")).await.unwrap();
    assert!(task.is_some());

    let all = TaskItem::get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].task_idk, task_id("a_003_test_task"));

    create_test_task("a_003_test_task_2", false).await;
    assert_eq!(TaskItem::get_all().await.unwrap().len(), 2);
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn schedule_sets_are_keyed_by_task_and_cron() {
    setup().await;
    let task = create_test_task("a_004_test_task", false).await;
    assert_eq!(
        task.schedule_sets[0].set_idk.as_deref(),
        Some("test_task_a_004_test_task_* * * * *")
    );
    let stored = TaskItem::get(&task.task_idk).await.unwrap().unwrap();
    assert_eq!(stored.schedule_sets, task.schedule_sets);
    assert!(stored.get_schedule_set("test_task_a_004_test_task_* * * * *").is_some());
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn recreating_a_task_only_versions_real_changes() {
    setup().await;
    let first = create_test_task("a_005_test_task", false).await;
    let again = create_test_task("a_005_test_task", false).await;
    assert_eq!(first.version, again.version);

    let changed = TaskItem::create(
        common::test_task("a_005_test_task", vec![every_minute()], false).metadata(json!({ "k": 1 })),
    )
    .await
    .unwrap();
    assert!(changed.version > first.version);

    let mut task = TaskItem::get(&first.task_idk).await.unwrap().unwrap();
    task.set_status(TaskStatus::Disabled, "test status change").await.unwrap();
    let recreated = TaskItem::create(
        common::test_task("a_005_test_task", vec![every_minute()], false).metadata(json!({ "k": 1 })),
    )
    .await
    .unwrap();
    assert_eq!(recreated.status, TaskStatus::Disabled);

    task.set_status(TaskStatus::Inactive, "test status change").await.unwrap();
    let recreated = TaskItem::create(
        common::test_task("a_005_test_task", vec![every_minute()], false).metadata(json!({ "k": 1 })),
    )
    .await
    .unwrap();
    assert_eq!(recreated.status, TaskStatus::Enabled);
    assert!(recreated.version > task.version);
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn invalid_cron_is_rejected() {
    setup().await;
    let def = common::test_task(
        "a_006_bad_cron",
        vec![ScheduleSet::new("not a cron", json!({}))],
        false,
    );
    assert!(matches!(
        TaskItem::create(def).await,
        Err(OrchaError::InvalidCron { .. })
    ));
    assert!(TaskItem::get(&task_id("a_006_bad_cron")).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn task_status_changes_are_stored() {
    setup().await;
    create_test_task("a_006_test_task", false).await;
    let id = task_id("a_006_test_task");
    let mut task = TaskItem::get(&id).await.unwrap().unwrap();
    for status in [
        TaskStatus::Enabled,
        TaskStatus::Disabled,
        TaskStatus::Inactive,
        TaskStatus::Deleted,
    ] {
        task.set_status(status, "test status change").await.unwrap();
        assert_eq!(task.status, status);
        task = TaskItem::get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, status);
        assert_eq!(task.notes.as_deref(), Some("test status change"));
    }
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn schedule_timings_and_set_enabled() {
    setup().await;
    let mut task = create_test_task("a_006_timings", false).await;
    let set = task.schedule_sets[0].clone();
    assert_eq!(task.get_time_between_runs(&set).unwrap(), ChronoDuration::minutes(1));

    let next = task.get_next_scheduled_time(None).unwrap();
    assert_eq!(task.get_next_scheduled_time(Some(&set)).unwrap(), next);
    assert!(next > orcha::clock::now());
    let gap = next - task.get_last_scheduled(&set).unwrap();
    assert!(gap >= ChronoDuration::minutes(1) && gap <= ChronoDuration::minutes(2));

    let version = task.version;
    task.set_enabled("already enabled").await.unwrap();
    assert_eq!(task.version, version);

    task.set_status(TaskStatus::Disabled, "off").await.unwrap();
    task.set_enabled("back on").await.unwrap();
    let stored = TaskItem::get(&task.task_idk).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Enabled);
    assert_eq!(stored.notes.as_deref(), Some("back on"));
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn run_is_due_without_runs() {
    setup().await;
    let task = create_test_task("a_007_test_task", false).await;
    let (due, last) = task.is_run_due_with_last(&task.schedule_sets[0]).await.unwrap();
    assert!(due);
    assert!(last.is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn run_not_due_after_scheduling() {
    setup().await;
    let task = create_test_task("a_008_test_task", false).await;
    let run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    let (due, last) = task.is_run_due_with_last(&task.schedule_sets[0]).await.unwrap();
    assert!(!due);
    let last = last.unwrap();
    assert_eq!(last.run_idk, run.run_idk);
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.run_type, RunType::Scheduled);
    assert!(run.scheduled_time <= orcha::clock::now());
}

// ---- runs ----

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn prune_and_schedule_runs() {
    setup().await;
    let task = create_test_task("b_003_test_task", false).await;

    assert_eq!(task.prune_runs(Some(ChronoDuration::zero())).await.unwrap(), 0);
    assert!(runs_for(&task, 0).await.is_empty());
    assert!(task.is_run_due(&task.schedule_sets[0]).await.unwrap());

    let run_1 = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    let run_2 = task.schedule_run(&task.schedule_sets[0]).await.unwrap();

    let all = runs_for(&task, 0).await;
    assert_eq!(all.len(), 2);
    for run in &all {
        assert!([&run_1.run_idk, &run_2.run_idk].contains(&&run.run_idk));
        assert_eq!(run.set_idf.as_str(), task.schedule_sets[0].set_idk.as_deref().unwrap());
        assert_eq!(run.status, RunStatus::Queued);
    }

    let mut old = run_1.clone();
    old.scheduled_time = orcha::clock::now() - ChronoDuration::days(3);
    old.save().await.unwrap();
    assert_eq!(task.prune_runs(Some(ChronoDuration::days(1))).await.unwrap(), 1);
    assert!(RunItem::get(&run_1.run_idk).await.unwrap().is_none());
    assert!(RunItem::get(&run_2.run_idk).await.unwrap().is_some());
    assert_eq!(task.prune_runs(None).await.unwrap(), 0);
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn update_run_status() {
    setup().await;
    let task = create_test_task("b_004_test_task", false).await;
    let mut run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    assert_eq!(run.status, RunStatus::Queued);

    run.set_running(json!({ "test": "output" })).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.output, json!({ "test": "output" }).as_object().cloned());
    assert!(run.start_time.is_some());

    run.set_success(json!({ "test": "success" })).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    // Keys already stored win over the new ones.
    assert_eq!(run.output, json!({ "test": "output" }).as_object().cloned());

    run.set_warn(json!({ "test": "warn" })).await.unwrap();
    assert_eq!(run.status, RunStatus::Warn);
    run.set_failed(json!({ "test": "failed" }), false).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    for res in [
        run.clone().set_running(json!({})).await,
        run.clone().set_success(json!({})).await,
        run.clone().set_warn(json!({})).await,
    ] {
        assert!(matches!(
            res,
            Err(OrchaError::InvalidRunTransition {
                from: RunStatus::Failed,
                ..
            })
        ));
    }

    // Failing twice leaves the row alone.
    run.set_failed(json!({ "again": true }), false).await.unwrap();
    let stored = RunItem::get(&run.run_idk).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(!stored.output.unwrap().contains_key("again"));
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn cancelled_runs_stay_cancelled() {
    setup().await;
    let task = create_test_task("b_004_cancel", false).await;
    let mut run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    run.set_cancelled(json!({ "reason": "test" }), true).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    run.set_failed(json!({}), false).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.set_running(json!({})).await.is_err());
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn zero_duration_failure_ends_at_start() {
    setup().await;
    let task = create_test_task("b_004_zero", false).await;
    let mut run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    run.set_running(json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    run.set_failed(json!({ "message": "gone" }), true).await.unwrap();

    let stored = RunItem::get(&run.run_idk).await.unwrap().unwrap();
    assert!(stored.start_time.is_some());
    assert_eq!(stored.end_time, stored.start_time);
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn set_output_replaces_or_merges() {
    setup().await;
    let task = create_test_task("b_004_output", false).await;
    let mut run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();

    run.set_output(Some(json!({ "a": 1 })), false).await.unwrap();
    run.set_output(Some(json!({ "b": 2 })), true).await.unwrap();
    run.set_output(Some(json!({ "a": 3 })), true).await.unwrap();
    let stored = RunItem::get(&run.run_idk).await.unwrap().unwrap();
    assert_eq!(stored.output, json!({ "a": 3, "b": 2 }).as_object().cloned());
    assert_eq!(stored.status, RunStatus::Queued);

    run.set_output(None, false).await.unwrap();
    assert!(RunItem::get(&run.run_idk).await.unwrap().unwrap().output.is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn deleted_run_cannot_be_touched() {
    setup().await;
    let task = create_test_task("b_004_delete", false).await;
    let mut run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    run.update_active().await.unwrap();
    assert!(run.last_active.is_some());

    run.delete().await.unwrap();
    assert!(RunItem::get(&run.run_idk).await.unwrap().is_none());
    assert!(matches!(
        run.update_active().await,
        Err(OrchaError::RunNotFound(_))
    ));
    assert!(matches!(run.reload().await, Err(OrchaError::RunNotFound(_))));
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn runs_belong_to_their_task_and_schedule() {
    setup().await;
    let s_1min = ScheduleSet::new("* * * * *", json!({ "test": "1min" }));
    let s_5min = ScheduleSet::new("*/5 * * * *", json!({ "test": "5min" }));
    let task_1 = TaskItem::create(common::test_task(
        "b_005_test_task",
        vec![s_1min.clone(), s_5min.clone()],
        false,
    ))
    .await
    .unwrap();
    let task_2 = TaskItem::create(common::test_task("b_005_test_task_2", vec![s_5min.clone()], false))
        .await
        .unwrap();

    let t1_1min = ScheduleSet::with_key(
        format!("{}_{}", task_1.task_idk, s_1min.cron_schedule),
        s_1min.cron_schedule.clone(),
        s_1min.config.clone(),
    );
    let t1_5min = s_5min.keyed_for(&task_1.task_idk);
    let t2_5min = s_5min.keyed_for(&task_2.task_idk);

    let run_t1_1min = task_1.schedule_run(&t1_1min).await.unwrap();
    let run_t1_5min = task_1.schedule_run(&t1_5min).await.unwrap();
    let run_t2_5min = task_2.schedule_run(&t2_5min).await.unwrap();
    assert_eq!(run_t1_5min.config, json!({ "test": "5min" }));

    let id_1 = task_id("b_005_test_task");
    let id_2 = task_id("b_005_test_task_2");
    let runs = RunItem::get_all(&id_1, since_yesterday(), Some(&t1_1min), None).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_idk, run_t1_1min.run_idk);

    let runs = RunItem::get_all(&id_1, since_yesterday(), Some(&t1_5min), None).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_idk, run_t1_5min.run_idk);

    let runs = RunItem::get_all(&id_2, since_yesterday(), Some(&t2_5min), None).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_idk, run_t2_5min.run_idk);

    let runs = RunItem::get_all(&id_1, since_yesterday(), None, None).await.unwrap();
    assert_eq!(runs.len(), 2);
    for run in &runs {
        assert!([&run_t1_1min.run_idk, &run_t1_5min.run_idk].contains(&&run.run_idk));
    }

    // Another task's schedule set, and an unkeyed one, are refused.
    assert!(matches!(
        RunItem::get_all(&id_1, since_yesterday(), Some(&t2_5min), None).await,
        Err(OrchaError::ScheduleSetNotFound { .. })
    ));
    assert!(RunItem::get_all(&id_1, since_yesterday(), Some(&s_1min), None).await.is_err());
    assert!(matches!(
        RunItem::get_all("no_such_task", None, None, None).await,
        Err(OrchaError::TaskNotFound(_))
    ));
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn queued_and_running_runs() {
    setup().await;
    let task = create_test_task("b_006_test_task", false).await;
    let id = task_id("b_006_test_task");
    let mut run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();

    let queued = RunItem::get_all_queued(&id, None).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].run_idk, run.run_idk);
    assert!(RunItem::get_running_runs(&id, None).await.unwrap().is_empty());

    run.set_running(json!({ "test": "output" })).await.unwrap();
    let running = task.get_running_runs().await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].run_idk, run.run_idk);
    assert_eq!(running[0].output, json!({ "test": "output" }).as_object().cloned());

    run.set_success(json!({ "test": "success" })).await.unwrap();
    assert!(RunItem::get_running_runs(&id, None).await.unwrap().is_empty());
    assert!(task.get_queued_runs().await.unwrap().is_empty());

    let latest = task.get_last_run(None).await.unwrap().unwrap();
    assert_eq!(latest.run_idk, run.run_idk);
    assert_eq!(latest.status, RunStatus::Success);
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn manual_runs_do_not_count_as_scheduled() {
    setup().await;
    let task = create_test_task("b_007_manual", false).await;
    let set = &task.schedule_sets[0];
    RunItem::create(&task, RunType::Manual, set, orcha::clock::now())
        .await
        .unwrap();
    assert!(task.is_run_due(set).await.unwrap());
    let manual = RunItem::get_all(&task, None, Some(set), Some(RunType::Manual)).await.unwrap();
    assert_eq!(manual.len(), 1);
}

// ---- scheduler and runner ----

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn scheduler_queues_and_runner_completes() {
    setup().await;
    let runner = TaskRunner::new(runner_config(), true).unwrap();
    let s_1min = ScheduleSet::new("* * * * *", json!({ "test": "1min" }));
    let s_5min = ScheduleSet::new("*/5 * * * *", json!({ "test": "5min" }));

    let task_1 = create_task_with(
        "c_001_test_task",
        vec![s_1min.clone(), s_5min.clone()],
        |_task: TaskItem, mut run: RunItem, _config: Value| async move {
            run.set_output(Some(json!({ "data": "test_output" })), false).await
        },
    )
    .await;
    let task_2 = TaskItem::create(common::test_task("c_001_test_task_2", vec![s_5min], true))
        .await
        .unwrap();

    assert!(runs_for(&task_1, 0).await.is_empty());
    assert!(runs_for(&task_2, 0).await.is_empty());

    let scheduler = started_scheduler().await;
    assert_eq!(runs_for(&task_1, 0).await.len(), 1);
    assert_eq!(runs_for(&task_1, 1).await.len(), 1);
    assert_eq!(runs_for(&task_2, 0).await.len(), 1);

    assert_eq!(runner.process_all_tasks().await.unwrap(), 3);

    let runs = runs_for(&task_1, 0).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(
        runs[0].output,
        json!({ "data": "test_output", "run_times": [] }).as_object().cloned()
    );
    assert_eq!(runs[0].config, json!({ "test": "1min" }));
    let runs = runs_for(&task_2, 0).await;
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(runs[0].output, json!({ "run_times": [] }).as_object().cloned());

    // Nothing is due again within the same minute, and finished runs are not rerun.
    assert_eq!(runner.process_all_tasks().await.unwrap(), 0);

    scheduler.stop().await;
    runner.stop_all(true).await;
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn second_schedule_queues_again() {
    setup().await;
    let runner = TaskRunner::new(runner_config(), true).unwrap();
    let task = TaskItem::create(common::test_task(
        "c_001_seconds",
        vec![ScheduleSet::new("*/2 * * * * *", json!({}))],
        true,
    ))
    .await
    .unwrap();

    let scheduler = started_scheduler().await;
    runner.process_all_tasks().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2100)).await;
    scheduler.tick_now().await.unwrap();
    runner.process_all_tasks().await.unwrap();

    let runs = runs_for(&task, 0).await;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Success));
    // Newest first.
    assert!(runs[0].scheduled_time > runs[1].scheduled_time);

    scheduler.stop().await;
    runner.stop_all(true).await;
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn runs_that_warn_or_fail() {
    setup().await;
    let runner = TaskRunner::new(runner_config(), true).unwrap();

    let task_warn = create_task_with(
        "c_002_test_task_warn",
        vec![every_minute()],
        |_task: TaskItem, mut run: RunItem, _config: Value| async move {
            run.set_warn(json!({ "message": "test warning" })).await
        },
    )
    .await;
    let task_fail = create_task_with(
        "c_002_test_task_fail",
        vec![every_minute()],
        |_task: TaskItem, mut run: RunItem, _config: Value| async move {
            run.set_failed(json!({ "message": "test failure" }), false).await
        },
    )
    .await;
    let task_error = create_task_with(
        "c_002_test_task_error",
        vec![every_minute()],
        |_task: TaskItem, _run: RunItem, _config: Value| async move {
            Err::<(), _>(OrchaError::task("boom"))
        },
    )
    .await;

    let scheduler = started_scheduler().await;
    assert_eq!(runs_for(&task_warn, 0).await.len(), 1);
    assert_eq!(runs_for(&task_fail, 0).await.len(), 1);
    runner.process_all_tasks().await.unwrap();

    let run_warn = &runs_for(&task_warn, 0).await[0];
    assert_eq!(run_warn.status, RunStatus::Warn);
    assert_eq!(
        run_warn.output,
        json!({ "message": "test warning", "run_times": [] }).as_object().cloned()
    );

    let run_fail = &runs_for(&task_fail, 0).await[0];
    assert_eq!(run_fail.status, RunStatus::Failed);
    assert_eq!(
        run_fail.output,
        json!({ "message": "test failure", "run_times": [] }).as_object().cloned()
    );

    let run_error = &runs_for(&task_error, 0).await[0];
    assert_eq!(run_error.status, RunStatus::Failed);
    assert_eq!(
        run_error.output,
        json!({ "exception": "boom", "run_times": [] }).as_object().cloned()
    );
    assert!(run_error.end_time >= run_error.start_time);

    scheduler.stop().await;
    runner.stop_all(true).await;
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn slow_runs_time_out_and_heartbeat() {
    setup().await;
    let runner = TaskRunner::new(
        TaskRunnerConfig {
            run_timeout_secs: Some(3),
            ..runner_config()
        },
        true,
    )
    .unwrap();

    let slow = create_task_with(
        "c_002_slow",
        vec![every_minute()],
        |_task: TaskItem, _run: RunItem, _config: Value| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), OrchaError>(())
        },
    )
    .await;
    let steady = create_task_with(
        "c_002_steady",
        vec![every_minute()],
        |_task: TaskItem, _run: RunItem, _config: Value| async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            Ok::<(), OrchaError>(())
        },
    )
    .await;
    slow.schedule_run(&slow.schedule_sets[0]).await.unwrap();
    steady.schedule_run(&steady.schedule_sets[0]).await.unwrap();
    runner.process_all_tasks().await.unwrap();

    let run = &runs_for(&slow, 0).await[0];
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.output.as_ref().unwrap()["message"], json!("Run timed out"));

    let run = &runs_for(&steady, 0).await[0];
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.last_active.is_some());

    runner.stop_all(true).await;
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn expiry_and_pruning() {
    setup().await;
    let task = create_test_task("c_003_test_task_old", false).await;

    let mut run_old = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    run_old.scheduled_time = orcha::clock::now() - ChronoDuration::minutes(2);
    run_old.save().await.unwrap();

    let mut run_to_be_pruned = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    run_to_be_pruned.scheduled_time = orcha::clock::now() - ChronoDuration::days(1000);
    run_to_be_pruned.save().await.unwrap();

    let scheduler = started_scheduler().await;

    let run_old = RunItem::get(&run_old.run_idk).await.unwrap().unwrap();
    assert_eq!(run_old.status, RunStatus::Failed);
    assert_eq!(run_old.output.as_ref().unwrap()["message"], json!("Run failed to start"));
    assert_eq!(run_old.end_time, run_old.start_time);

    assert!(RunItem::get(&run_to_be_pruned.run_idk).await.unwrap().is_none());

    // The task was active after the failed run was scheduled, so a fresh run is queued.
    let queued = task.get_queued_runs().await.unwrap();
    assert_eq!(queued.len(), 1);

    scheduler.stop().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn stale_tasks_go_inactive_until_a_runner_picks_them_up() {
    setup().await;
    let task = TaskItem::create(common::test_task(
        "c_003_stale",
        vec![ScheduleSet::new("* * * * * *", json!({}))],
        false,
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let scheduler = started_scheduler().await;
    let stored = TaskItem::get(&task.task_idk).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Inactive);
    assert_eq!(stored.notes.as_deref(), Some("Task set inactive due to inactivity"));
    let runs = runs_for(&task, 0).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_idk, run.run_idk);
    assert_eq!(runs[0].status, RunStatus::Failed);
    scheduler.stop().await;

    let runner = TaskRunner::new(runner_config(), false).unwrap();
    runner.register_task(task.clone()).await.unwrap();
    assert_eq!(runner.process_all_tasks().await.unwrap(), 0);
    let stored = TaskItem::get(&task.task_idk).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Enabled);
    assert!(stored.last_active > run.scheduled_time);
    runner.stop_all(true).await;
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn module_timings_land_in_the_output() {
    setup().await;
    let runner = TaskRunner::new(runner_config(), true).unwrap();

    let source = Arc::new(FnSource::new(
        ModuleInfo::new("test_source", "Test Source", "A test source"),
        None,
        |_params: Value| async { Ok::<_, OrchaError>(rows(&[1, 2, 3])) },
    ));
    let task = create_task_with("c_004_test_task", vec![every_minute()], {
        let source = source.clone();
        move |_task: TaskItem, mut run: RunItem, _config: Value| {
            let source = source.clone();
            async move {
                let data = source.get(Some(&run), &json!({})).await?;
                run.set_output(Some(json!({ "data": data })), false).await?;
                Ok::<(), OrchaError>(())
            }
        }
    })
    .await;

    let sleep_source = Arc::new(FnSource::new(
        ModuleInfo::new("test_sleep_source", "Sleep Source", "A slow source"),
        None,
        |_params: Value| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, OrchaError>(Rows::new())
        },
    ));
    let sleep_task = create_task_with("c_004_test_task_2", vec![every_minute()], {
        let source = sleep_source.clone();
        move |_task: TaskItem, mut run: RunItem, _config: Value| {
            let source = source.clone();
            async move {
                let data = source.get(Some(&run), &json!({})).await?;
                run.set_output(Some(json!({ "data": data })), false).await?;
                Ok::<(), OrchaError>(())
            }
        }
    })
    .await;

    task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    sleep_task.schedule_run(&sleep_task.schedule_sets[0]).await.unwrap();
    assert_eq!(runner.process_all_tasks().await.unwrap(), 2);

    let run = &runs_for(&task, 0).await[0];
    assert_eq!(run.status, RunStatus::Success);
    let output = run.output.as_ref().unwrap();
    assert_eq!(output["data"], json!([{ "test": 1 }, { "test": 2 }, { "test": 3 }]));
    let run_times = output["run_times"].as_array().unwrap();
    assert_eq!(run_times.len(), 1);
    let timing = run_times[0].as_object().unwrap();
    for key in ["module_idk", "start_time_posix", "end_time_posix", "duration_seconds"] {
        assert!(timing.contains_key(key), "missing {key}");
    }
    assert_eq!(timing["module_idk"], json!("test_source"));
    assert!(timing["duration_seconds"].as_f64().unwrap() < 1.0);

    let run = &runs_for(&sleep_task, 0).await[0];
    assert_eq!(run.status, RunStatus::Success);
    let output = run.output.as_ref().unwrap();
    assert_eq!(output["data"], json!([]));
    let duration = output["run_times"][0]["duration_seconds"].as_f64().unwrap();
    assert!(duration > 0.9 && duration < 2.0, "took {duration}s");

    runner.stop_all(true).await;
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn module_errors_are_wrapped() {
    setup().await;
    let runner = TaskRunner::new(runner_config(), true).unwrap();
    let source = Arc::new(FnSource::new(
        ModuleInfo::new("broken_source", "Broken Source", "Always fails"),
        None,
        |_params: Value| async { Err::<Rows, _>(OrchaError::task("no data")) },
    ));
    let task = create_task_with("c_004_broken", vec![every_minute()], {
        move |_task: TaskItem, run: RunItem, _config: Value| {
            let source = source.clone();
            async move {
                source.get(Some(&run), &json!({})).await?;
                Ok::<(), OrchaError>(())
            }
        }
    })
    .await;
    task.schedule_run(&task.schedule_sets[0]).await.unwrap();
    runner.process_all_tasks().await.unwrap();

    let run = &runs_for(&task, 0).await[0];
    assert_eq!(run.status, RunStatus::Failed);
    let output = run.output.as_ref().unwrap();
    assert_eq!(
        output["exception"],
        json!("Exception in Broken Source (broken_source) module: no data")
    );
    assert_eq!(output["run_times"].as_array().unwrap().len(), 1);

    runner.stop_all(true).await;
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn postgres_source_and_sink() {
    setup().await;
    let creds = common::credentials();
    let (host, port) = creds.host_port().unwrap();
    let entity = PostgresEntity::new(
        Entity::new(
            ModuleInfo::new("test_pg_entity", "Test Postgres", "The test database"),
            creds.user.clone(),
            creds.password.clone(),
        ),
        host,
        port,
        creds.db.clone(),
        "public",
    );
    entity
        .execute("CREATE TABLE IF NOT EXISTS public.orcha_module_test (id integer, label text)")
        .await
        .unwrap();
    entity.execute("TRUNCATE public.orcha_module_test").await.unwrap();

    let task = create_test_task("c_004_pg", false).await;
    let run = task.schedule_run(&task.schedule_sets[0]).await.unwrap();

    let sink = PostgresSink::new(
        ModuleInfo::new("test_pg_sink", "Test Sink", "Writes test rows"),
        entity.clone(),
        "orcha_module_test",
        IfExists::Append,
    );
    let batch: Rows = [json!({ "id": 1, "label": "a" }), json!({ "id": 2, "label": "b" })]
        .iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
    assert_eq!(sink.save(Some(&run), &batch, &json!({})).await.unwrap(), 2);
    assert_eq!(sink.save(Some(&run), &batch, &json!({})).await.unwrap(), 2);

    let source = PostgresSource::new(
        ModuleInfo::new("test_pg_source", "Test Source", "Reads test rows"),
        entity.clone(),
        "SELECT id, label FROM public.orcha_module_test ORDER BY id",
    );
    assert_eq!(source.get(Some(&run), &json!({})).await.unwrap().len(), 4);

    let replace = PostgresSink::new(
        ModuleInfo::new("test_pg_replace", "Test Replace", "Replaces test rows"),
        entity.clone(),
        "orcha_module_test",
        IfExists::Replace,
    );
    assert_eq!(replace.save(Some(&run), &batch, &json!({})).await.unwrap(), 2);
    let got = source.get(Some(&run), &json!({})).await.unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(got[1]["label"], json!("b"));

    entity.execute("DROP TABLE public.orcha_module_test").await.unwrap();
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn runner_thread_groups() {
    setup().await;
    let runner = TaskRunner::new(runner_config(), true).unwrap();
    assert!(matches!(
        TaskRunner::new(runner_config(), true),
        Err(OrchaError::RunnerAlreadySet)
    ));

    let task = TaskItem::create(common::test_task("c_005_a", vec![every_minute()], true).thread_group("group_a"))
        .await
        .unwrap();
    TaskItem::create(common::test_task("c_005_b", vec![every_minute()], true).thread_group("group_b"))
        .await
        .unwrap();
    assert_eq!(runner.thread_groups().await, vec!["group_a", "group_b"]);
    assert_eq!(runner.task_group(&task.task_idk).await.as_deref(), Some("group_a"));

    // Re-registering moves the task.
    TaskItem::create(common::test_task("c_005_a", vec![every_minute()], true).thread_group("group_b"))
        .await
        .unwrap();
    assert_eq!(runner.task_group(&task.task_idk).await.as_deref(), Some("group_b"));

    runner.stop_all(false).await;
    assert!(runner.thread_groups().await.is_empty());

    let shared = TaskRunner::new(
        TaskRunnerConfig {
            use_thread_groups: false,
            ..runner_config()
        },
        false,
    )
    .unwrap();
    shared.register_task(task.clone()).await.unwrap();
    assert_eq!(shared.thread_groups().await, vec![orcha::service::BASE_THREAD_GROUP]);
    shared.stop_all(false).await;
    assert_eq!(shared.thread_groups().await, vec![orcha::service::BASE_THREAD_GROUP]);
    shared.stop_all(true).await;
    assert!(shared.thread_groups().await.is_empty());
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn scheduler_pause_resume_and_heartbeat() {
    setup().await;
    let scheduler = Scheduler::new(scheduler_config());
    assert!(scheduler.is_paused().await.unwrap());

    scheduler.start().await.unwrap();
    assert!(!scheduler.is_paused().await.unwrap());
    scheduler.pause().await.unwrap();
    assert!(scheduler.is_paused().await.unwrap());
    scheduler.start().await.unwrap();
    assert!(!scheduler.is_paused().await.unwrap());

    scheduler.tick_now().await.unwrap();
    let status = orcha::db::service_status::get_latest("scheduler", "orcha_tests")
        .await
        .unwrap()
        .unwrap();
    assert!(status.status_time <= orcha::clock::now());

    scheduler.stop().await;
    assert!(!scheduler.is_running().await);
    assert!(scheduler.is_paused().await.unwrap());
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn custom_log_entries_are_stored() {
    let log = setup().await;
    assert_eq!(log.source(), "orcha_custom");
    let id = log
        .add_entry("tests", "info", "hello from the tests", json!({ "k": 1 }))
        .await
        .unwrap();

    let recent = log.recent(10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, id);
    assert_eq!(recent[0].text.as_deref(), Some("hello from the tests"));
    assert_eq!(recent[0].json.as_ref().map(|j| j.0.clone()), Some(json!({ "k": 1 })));
}

// ---- initialisation ----

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn altered_tables_fail_initialisation() {
    setup().await;
    let pool = orcha::confirm_initialised().unwrap().storage().pool().clone();
    sqlx::query("ALTER TABLE orcha.service_status ADD COLUMN legacy text")
        .execute(&pool)
        .await
        .unwrap();

    let res = orcha::initialise(&common::credentials(), "orcha_tests").await;

    sqlx::query("ALTER TABLE orcha.service_status DROP COLUMN legacy")
        .execute(&pool)
        .await
        .unwrap();
    match res {
        Err(OrchaError::SchemaMismatch { table, .. }) => assert_eq!(table, "orcha.service_status"),
        other => panic!("expected SchemaMismatch, got {:?}", other.map(|_| ())),
    }
    assert!(orcha::initialise(&common::credentials(), "orcha_tests").await.is_ok());
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn bad_password_is_not_retried() {
    let good = common::credentials();
    common::wait_for_database().await;
    let bad = orcha::CoreCredentials::new(
        good.user.clone(),
        format!("{}_wrong", good.password),
        good.server.clone(),
        good.db.clone(),
    );

    let started = std::time::Instant::now();
    let res = orcha::db::wait_for_database(&bad, Duration::from_secs(30)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    match res {
        Err(OrchaError::DatabaseError(_)) => {}
        other => panic!("expected an immediate database error, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
#[ignore = "requires postgres; run with --include-ignored"]
async fn reinitialising_stops_the_old_default_runner() {
    setup().await;
    let runner = TaskRunner::new(runner_config(), true).unwrap();
    create_test_task("e_001_runner", true).await;
    assert_eq!(runner.thread_groups().await, vec!["test_thread_group"]);

    setup().await;
    assert!(runner.thread_groups().await.is_empty());
    assert_eq!(runner.task_group(&task_id("e_001_runner")).await, None);

    let replacement = TaskRunner::new(runner_config(), true).unwrap();
    replacement.stop_all(true).await;
}
