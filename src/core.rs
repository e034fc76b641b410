//! Process-wide orcha state.
//!
//! Nothing touches the database until [`initialise`] has run. Every data
//! operation starts with [`confirm_initialised`] and returns
//! [`OrchaError::NotInitialised`] otherwise.

use crate::config::CoreCredentials;
use crate::db::{self, OrchaStorage};
use crate::error::OrchaError;
use crate::log::LogManager;
use crate::service::task_runner::TaskRunner;
use serde_json::json;
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

static CORE: RwLock<Option<Arc<Core>>> = RwLock::new(None);

pub struct Core {
    storage: OrchaStorage,
    application_name: String,
    runner: Mutex<Option<TaskRunner>>,
}

impl Core {
    pub fn storage(&self) -> &OrchaStorage {
        &self.storage
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    /// The runner tasks register with when created.
    pub fn default_runner(&self) -> Result<TaskRunner, OrchaError> {
        self.runner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(OrchaError::NoTaskRunner)
    }

    pub(crate) fn set_default_runner(&self, runner: TaskRunner) -> Result<(), OrchaError> {
        let mut slot = self.runner.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return Err(OrchaError::RunnerAlreadySet);
        }
        *slot = Some(runner);
        Ok(())
    }
}

/// Connect, build the schema and install the process-wide core.
///
/// Calling this again replaces the previous core and stops every thread group
/// of its default runner. Returns a [`LogManager`] for custom application logs.
pub async fn initialise(
    creds: &CoreCredentials,
    application_name: &str,
) -> Result<LogManager, OrchaError> {
    let pool = db::connect(creds, application_name)?;
    let storage = OrchaStorage::new(pool);
    storage.build_schema().await?;

    let core = Arc::new(Core {
        storage,
        application_name: application_name.to_string(),
        runner: Mutex::new(None),
    });
    let previous = CORE.write().unwrap_or_else(|p| p.into_inner()).replace(core);
    let previous_runner = match previous {
        Some(old) => {
            let mut slot = old.runner.lock().unwrap_or_else(|p| p.into_inner());
            slot.take()
        }
        None => None,
    };
    if let Some(runner) = previous_runner {
        runner.stop_all(true).await;
        info!("default runner of the previous core stopped");
    }
    info!(server = %creds.server, db = %creds.db, application_name, "orcha initialised");

    LogManager::new("orcha")
        .add_entry("orcha", "info", "Initialised orcha", json!({}))
        .await?;
    Ok(LogManager::new("orcha_custom"))
}

pub fn confirm_initialised() -> Result<Arc<Core>, OrchaError> {
    CORE.read()
        .unwrap_or_else(|p| p.into_inner())
        .clone()
        .ok_or(OrchaError::NotInitialised)
}

pub fn is_initialised() -> bool {
    confirm_initialised().is_ok()
}
