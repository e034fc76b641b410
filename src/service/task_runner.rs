use crate::core::confirm_initialised;
use crate::error::OrchaError;
use crate::runs::RunItem;
use crate::tasks::TaskItem;
use crate::types::RunStatus;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Group used for every task when thread groups are disabled.
pub const BASE_THREAD_GROUP: &str = "base_thread";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRunnerConfig {
    /// One worker per task thread group. When off, everything shares `base_thread`.
    pub use_thread_groups: bool,
    /// Poll on a timer. When off, tasks only run through `process_all_tasks`.
    pub run_in_background: bool,
    pub poll_secs: u64,
    pub heartbeat_secs: u64,
    pub run_timeout_secs: Option<u64>,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            use_thread_groups: true,
            run_in_background: true,
            poll_secs: 15,
            heartbeat_secs: 30,
            run_timeout_secs: None,
        }
    }
}

impl TaskRunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

/// Messages handled by a thread group worker.
#[derive(Debug)]
pub enum ThreadGroupMessage {
    /// Add a task, replacing any earlier registration with the same id.
    AddTask(TaskItem),
    RemoveTask(String),
    /// Timer driven pass over all tasks (internal).
    Tick,
    /// Process every task once and reply with the number of runs executed.
    ProcessNow(RpcReplyPort<usize>),
}

struct ThreadGroupState {
    group: String,
    tasks: Vec<TaskItem>,
    config: TaskRunnerConfig,
}

/// Runs the tasks of one thread group, one after the other.
struct ThreadGroupActor;

#[ractor::async_trait]
impl Actor for ThreadGroupActor {
    type Msg = ThreadGroupMessage;
    type State = ThreadGroupState;
    type Arguments = (String, TaskRunnerConfig);

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        (group, config): Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(group = %group, "thread group started");
        Ok(ThreadGroupState {
            group,
            tasks: Vec::new(),
            config,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if state.config.run_in_background {
            schedule_tick(myself, state.config.poll_interval());
        }
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ThreadGroupMessage::AddTask(task) => {
                debug!(group = %state.group, task_idk = %task.task_idk, "task registered");
                match state.tasks.iter_mut().find(|t| t.task_idk == task.task_idk) {
                    Some(existing) => *existing = task,
                    None => state.tasks.push(task),
                }
            }
            ThreadGroupMessage::RemoveTask(task_idk) => {
                state.tasks.retain(|t| t.task_idk != task_idk);
            }
            ThreadGroupMessage::Tick => {
                process_group(state).await;
                schedule_tick(myself, state.config.poll_interval());
            }
            ThreadGroupMessage::ProcessNow(reply) => {
                let processed = process_group(state).await;
                let _ = reply.send(processed);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        info!(group = %state.group, "thread group stopped");
        Ok(())
    }
}

fn schedule_tick(actor: ActorRef<ThreadGroupMessage>, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = ractor::cast!(actor, ThreadGroupMessage::Tick);
    });
}

async fn process_group(state: &mut ThreadGroupState) -> usize {
    let mut processed = 0;
    for task in state.tasks.iter_mut() {
        match process_task(task, &state.config).await {
            Ok(n) => processed += n,
            Err(e) => warn!(group = %state.group, task_idk = %task.task_idk, "processing task failed: {e}"),
        }
    }
    processed
}

/// Mark the task active and execute the latest run of each schedule set if it is queued.
///
/// Older queued runs are left for the scheduler to fail.
pub async fn process_task(task: &mut TaskItem, config: &TaskRunnerConfig) -> Result<usize, OrchaError> {
    task.update_active().await?;
    let mut processed = 0;
    for schedule in task.schedule_sets.clone() {
        let Some(run) = RunItem::get_latest(&*task, Some(&schedule), None).await? else {
            continue;
        };
        if run.status != RunStatus::Queued {
            continue;
        }
        execute_run(task, run, config).await?;
        processed += 1;
    }
    Ok(processed)
}

enum Outcome {
    Finished(Result<(), OrchaError>),
    TimedOut,
    Panicked(String),
}

async fn execute_run(
    task: &TaskItem,
    mut run: RunItem,
    config: &TaskRunnerConfig,
) -> Result<(), OrchaError> {
    // Started before the heartbeat so it never stamps the queued row.
    run.set_running(json!({})).await?;
    info!(task_idk = %task.task_idk, run_idk = %run.run_idk, "run started");

    let heartbeat = spawn_heartbeat(run.clone(), config.heartbeat_interval());

    let worker = {
        let task = task.clone();
        let run = run.clone();
        let run_config = run.config.clone();
        tokio::spawn(async move { task.run_function(run, run_config).await })
    };
    let abort = worker.abort_handle();
    let outcome = match config.run_timeout() {
        Some(limit) => match tokio::time::timeout(limit, worker).await {
            Ok(joined) => joined_outcome(joined),
            Err(_) => {
                abort.abort();
                Outcome::TimedOut
            }
        },
        None => joined_outcome(worker.await),
    };
    heartbeat.abort();

    let run_times = run.run_times_output();
    match outcome {
        Outcome::Finished(Ok(())) => {
            run.reload().await?;
            if run.status == RunStatus::Running {
                run.set_success(run_times).await?;
            } else {
                run.set_output(Some(run_times), true).await?;
            }
            info!(task_idk = %task.task_idk, run_idk = %run.run_idk, status = %run.status, "run finished");
        }
        failed => {
            let output = match failed {
                Outcome::TimedOut => json!({ "message": "Run timed out" }),
                Outcome::Panicked(msg) => json!({ "exception": msg }),
                Outcome::Finished(Err(e)) => json!({ "exception": e.to_string() }),
                Outcome::Finished(Ok(())) => json!({}),
            };
            error!(task_idk = %task.task_idk, run_idk = %run.run_idk, %output, "run failed");
            run.set_failed(output, false).await?;
            run.set_output(Some(run_times), true).await?;
        }
    }
    Ok(())
}

fn joined_outcome(joined: Result<Result<(), OrchaError>, tokio::task::JoinError>) -> Outcome {
    match joined {
        Ok(res) => Outcome::Finished(res),
        Err(e) if e.is_panic() => Outcome::Panicked(format!("task function panicked: {e}")),
        Err(e) => Outcome::Panicked(e.to_string()),
    }
}

fn spawn_heartbeat(mut run: RunItem, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            if let Err(e) = run.update_active().await {
                warn!(run_idk = %run.run_idk, "heartbeat failed: {e}");
            }
        }
    })
}

struct GroupHandle {
    actor: ActorRef<ThreadGroupMessage>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct RunnerState {
    groups: HashMap<String, GroupHandle>,
    /// task_idk -> thread group it was registered in
    task_groups: HashMap<String, String>,
}

/// Executes queued runs for registered tasks.
///
/// Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct TaskRunner {
    config: TaskRunnerConfig,
    state: Arc<Mutex<RunnerState>>,
}

impl TaskRunner {
    /// With `default_runner`, tasks created with `register_with_runner` land here.
    /// Only one default runner can exist per initialised core.
    pub fn new(config: TaskRunnerConfig, default_runner: bool) -> Result<Self, OrchaError> {
        let runner = Self {
            config,
            state: Arc::new(Mutex::new(RunnerState::default())),
        };
        if default_runner {
            confirm_initialised()?.set_default_runner(runner.clone())?;
        }
        Ok(runner)
    }

    pub fn config(&self) -> &TaskRunnerConfig {
        &self.config
    }

    fn group_for(&self, task: &TaskItem) -> String {
        if self.config.use_thread_groups {
            task.thread_group.clone()
        } else {
            BASE_THREAD_GROUP.to_string()
        }
    }

    pub async fn register_task(&self, task: TaskItem) -> Result<(), OrchaError> {
        let group = self.group_for(&task);
        let mut state = self.state.lock().await;

        if let Some(previous) = state
            .task_groups
            .insert(task.task_idk.clone(), group.clone())
            .filter(|prev| prev != &group)
            && let Some(handle) = state.groups.get(&previous)
        {
            if let Err(e) = ractor::cast!(
                handle.actor,
                ThreadGroupMessage::RemoveTask(task.task_idk.clone())
            ) {
                warn!(task_idk = %task.task_idk, group = %previous, "removing task from its old group failed: {e}");
            }
        }

        if !state.groups.contains_key(&group) {
            let (actor, join) =
                Actor::spawn(None, ThreadGroupActor, (group.clone(), self.config.clone()))
                    .await
                    .map_err(|e| {
                        OrchaError::RactorError(format!("spawning thread group {group} failed: {e}"))
                    })?;
            state.groups.insert(group.clone(), GroupHandle { actor, join });
        }

        if let Some(handle) = state.groups.get(&group) {
            ractor::cast!(handle.actor, ThreadGroupMessage::AddTask(task)).map_err(|e| {
                OrchaError::RactorError(format!("registering task with {group} failed: {e}"))
            })?;
        }
        Ok(())
    }

    pub async fn register_tasks(&self, tasks: Vec<TaskItem>) -> Result<(), OrchaError> {
        for task in tasks {
            self.register_task(task).await?;
        }
        Ok(())
    }

    /// Process every group once, waiting for each. Returns the number of runs executed.
    pub async fn process_all_tasks(&self) -> Result<usize, OrchaError> {
        let actors: Vec<_> = {
            let state = self.state.lock().await;
            state.groups.values().map(|h| h.actor.clone()).collect()
        };
        let mut processed = 0;
        for actor in actors {
            processed += ractor::call!(actor, ThreadGroupMessage::ProcessNow)
                .map_err(|e| OrchaError::RactorError(format!("ProcessNow RPC failed: {e}")))?;
        }
        Ok(processed)
    }

    /// Stop the workers. `base_thread` keeps running unless `stop_base` is set.
    pub async fn stop_all(&self, stop_base: bool) {
        let stopping: Vec<(String, GroupHandle)> = {
            let mut state = self.state.lock().await;
            let names: Vec<String> = state
                .groups
                .keys()
                .filter(|g| stop_base || g.as_str() != BASE_THREAD_GROUP)
                .cloned()
                .collect();
            state.task_groups.retain(|_, g| !names.contains(g));
            names
                .into_iter()
                .filter_map(|g| state.groups.remove(&g).map(|h| (g, h)))
                .collect()
        };
        for (group, handle) in stopping {
            handle.actor.stop(None);
            if let Err(e) = handle.join.await {
                warn!(group = %group, "thread group did not stop cleanly: {e}");
            }
        }
    }

    pub async fn thread_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.state.lock().await.groups.keys().cloned().collect();
        groups.sort();
        groups
    }

    /// The group a task is registered in, if any.
    pub async fn task_group(&self, task_idk: &str) -> Option<String> {
        self.state.lock().await.task_groups.get(task_idk).cloned()
    }
}
