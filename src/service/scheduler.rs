use crate::core::confirm_initialised;
use crate::db::service_status;
use crate::error::OrchaError;
use crate::tasks::TaskItem;
use crate::types::{RunStatus, ScheduleSet, TaskStatus};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const SERVICE_TYPE: &str = "scheduler";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    /// How long the cached task list is trusted before re-reading it.
    pub task_refresh_secs: u64,
    pub prune_secs: u64,
    /// Runs scheduled longer ago than this are pruned. `None` keeps everything.
    pub run_max_age_days: Option<u64>,
    pub fail_unstarted_runs: bool,
    pub disable_stale_tasks: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 10,
            task_refresh_secs: 60,
            prune_secs: 3600,
            run_max_age_days: Some(30),
            fail_unstarted_runs: true,
            disable_stale_tasks: true,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    fn run_max_age(&self) -> Option<chrono::Duration> {
        self.run_max_age_days
            .and_then(|days| i64::try_from(days).ok())
            .map(chrono::Duration::days)
    }
}

#[derive(Debug)]
pub enum SchedulerMessage {
    Tick,
    SetPaused(bool),
    IsPaused(RpcReplyPort<bool>),
    /// Run one scheduling pass immediately, paused or not.
    TickNow(RpcReplyPort<()>),
}

struct SchedulerState {
    config: SchedulerConfig,
    service_idf: String,
    tasks: Vec<TaskItem>,
    last_refresh: Option<Instant>,
    last_prune: Option<Instant>,
    paused: bool,
}

impl SchedulerState {
    fn refresh_due(&self) -> bool {
        self.tasks.is_empty()
            || self
                .last_refresh
                .is_none_or(|t| t.elapsed() >= Duration::from_secs(self.config.task_refresh_secs))
    }

    fn prune_due(&self) -> bool {
        self.last_prune
            .is_none_or(|t| t.elapsed() >= Duration::from_secs(self.config.prune_secs))
    }
}

struct SchedulerActor;

#[ractor::async_trait]
impl Actor for SchedulerActor {
    type Msg = SchedulerMessage;
    type State = SchedulerState;
    type Arguments = SchedulerConfig;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        config: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let core = confirm_initialised()?;
        info!(tick_secs = config.tick_secs, "scheduler started");
        Ok(SchedulerState {
            config,
            service_idf: core.application_name().to_string(),
            tasks: Vec::new(),
            last_refresh: None,
            last_prune: None,
            paused: false,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let _ = ractor::cast!(myself, SchedulerMessage::Tick);
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SchedulerMessage::Tick => {
                if !state.paused {
                    run_cycle(state).await;
                }
                let every = state.config.tick_interval();
                tokio::spawn(async move {
                    tokio::time::sleep(every).await;
                    let _ = ractor::cast!(myself, SchedulerMessage::Tick);
                });
            }
            SchedulerMessage::SetPaused(paused) => {
                if state.paused != paused {
                    info!(paused, "scheduler pause state changed");
                }
                state.paused = paused;
            }
            SchedulerMessage::IsPaused(reply) => {
                let _ = reply.send(state.paused);
            }
            SchedulerMessage::TickNow(reply) => {
                run_cycle(state).await;
                let _ = reply.send(());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        info!("scheduler stopped");
        Ok(())
    }
}

async fn run_cycle(state: &mut SchedulerState) {
    if state.refresh_due() {
        match TaskItem::get_all().await {
            Ok(tasks) => {
                debug!(count = tasks.len(), "scheduler refreshed tasks");
                state.tasks = tasks;
                state.last_refresh = Some(Instant::now());
            }
            Err(e) => warn!("scheduler could not load tasks: {e}"),
        }
    }

    for task in state.tasks.iter_mut() {
        if task.status != TaskStatus::Enabled {
            continue;
        }
        for schedule in task.schedule_sets.clone() {
            match schedule_task(task, &schedule, &state.config).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => warn!(
                    task_idk = %task.task_idk,
                    set_idk = schedule.set_idk.as_deref().unwrap_or_default(),
                    "scheduling failed: {e}"
                ),
            }
        }
    }

    if state.prune_due() {
        let max_age = state.config.run_max_age();
        for task in &state.tasks {
            match task.prune_runs(max_age).await {
                Ok(0) => {}
                Ok(n) => info!(task_idk = %task.task_idk, pruned = n, "old runs pruned"),
                Err(e) => warn!(task_idk = %task.task_idk, "pruning runs failed: {e}"),
            }
        }
        state.last_prune = Some(Instant::now());
    }

    if let Err(e) = service_status::update_status(SERVICE_TYPE, &state.service_idf).await {
        warn!("scheduler heartbeat failed: {e}");
    }
}

/// Queue a run for one schedule set if it is due.
///
/// Returns `false` once the task has been set inactive, so remaining sets are skipped.
async fn schedule_task(
    task: &mut TaskItem,
    schedule: &ScheduleSet,
    config: &SchedulerConfig,
) -> Result<bool, OrchaError> {
    let (due, last) = task.is_run_due_with_last(schedule).await?;
    if !due {
        return Ok(true);
    }

    if let Some(mut last) = last {
        if config.fail_unstarted_runs && last.status == RunStatus::Queued && last.start_time.is_none()
        {
            last.set_failed(json!({ "message": "Run failed to start" }), true)
                .await?;
            info!(run_idk = %last.run_idk, "queued run never started");
        }

        if config.disable_stale_tasks {
            // The cached copy lags behind runner heartbeats.
            if let Some(stored) = TaskItem::get(&task.task_idk).await? {
                task.last_active = stored.last_active;
                task.status = stored.status;
                task.version = stored.version;
            }
            if task.status != TaskStatus::Enabled {
                return Ok(false);
            }
            if task.last_active < last.scheduled_time {
                task.set_status(TaskStatus::Inactive, "Task set inactive due to inactivity")
                    .await?;
                warn!(task_idk = %task.task_idk, "task set inactive due to inactivity");
                return Ok(false);
            }
        }
    }

    let run = task.schedule_run(schedule).await?;
    debug!(task_idk = %task.task_idk, run_idk = %run.run_idk, scheduled_time = %run.scheduled_time, "run queued");
    Ok(true)
}

/// Handle to the scheduler actor.
pub struct Scheduler {
    config: SchedulerConfig,
    actor: Mutex<Option<(ActorRef<SchedulerMessage>, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            actor: Mutex::new(None),
        }
    }

    /// Start ticking, or resume if paused.
    pub async fn start(&self) -> Result<(), OrchaError> {
        confirm_initialised()?;
        let mut slot = self.actor.lock().await;
        if let Some((actor, _)) = slot.as_ref() {
            return ractor::cast!(actor, SchedulerMessage::SetPaused(false))
                .map_err(|e| OrchaError::RactorError(format!("resuming scheduler failed: {e}")));
        }
        let spawned = Actor::spawn(None, SchedulerActor, self.config.clone())
            .await
            .map_err(|e| OrchaError::RactorError(format!("spawning scheduler failed: {e}")))?;
        *slot = Some(spawned);
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), OrchaError> {
        let slot = self.actor.lock().await;
        match slot.as_ref() {
            Some((actor, _)) => ractor::cast!(actor, SchedulerMessage::SetPaused(true))
                .map_err(|e| OrchaError::RactorError(format!("pausing scheduler failed: {e}"))),
            None => Ok(()),
        }
    }

    /// A scheduler that is not running counts as paused.
    pub async fn is_paused(&self) -> Result<bool, OrchaError> {
        let actor = match self.actor.lock().await.as_ref() {
            Some((actor, _)) => actor.clone(),
            None => return Ok(true),
        };
        ractor::call!(actor, SchedulerMessage::IsPaused)
            .map_err(|e| OrchaError::RactorError(format!("IsPaused RPC failed: {e}")))
    }

    pub async fn is_running(&self) -> bool {
        self.actor.lock().await.is_some()
    }

    /// Run one pass now and wait for it.
    pub async fn tick_now(&self) -> Result<(), OrchaError> {
        let actor = match self.actor.lock().await.as_ref() {
            Some((actor, _)) => actor.clone(),
            None => return Err(OrchaError::RactorError("scheduler is not running".to_string())),
        };
        ractor::call!(actor, SchedulerMessage::TickNow)
            .map_err(|e| OrchaError::RactorError(format!("TickNow RPC failed: {e}")))
    }

    pub async fn stop(&self) {
        let Some((actor, join)) = self.actor.lock().await.take() else {
            return;
        };
        actor.stop(None);
        if let Err(e) = join.await {
            warn!("scheduler did not stop cleanly: {e}");
        }
    }
}
