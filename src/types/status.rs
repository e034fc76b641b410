use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a task. Only enabled tasks are queued by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Enabled,
    Disabled,
    /// Set by the scheduler when a task stops reporting activity.
    Inactive,
    Deleted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Inactive => "inactive",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            "inactive" => Ok(Self::Inactive),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Warn,
    Failed,
    Cancelled,
}

/// What a status change should do given the stored status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply,
    /// Already in the target (or a terminal state that absorbs it); leave the row alone.
    Skip,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Warn => "warn",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Checks moving from `self` (the stored status) to `to`.
    ///
    /// Returns `None` when the move is not allowed.
    pub fn transition_to(self, to: RunStatus) -> Option<Transition> {
        use RunStatus::*;
        match (to, self) {
            (Running, Running) => Some(Transition::Skip),
            (Running, Queued) => Some(Transition::Apply),
            (Running, _) => None,

            (Success, Failed | Warn) => None,
            (Success, Success) => Some(Transition::Skip),
            (Success, _) => Some(Transition::Apply),

            (Warn, Failed) => None,
            (Warn, Warn) => Some(Transition::Skip),
            (Warn, _) => Some(Transition::Apply),

            (Failed, Failed | Cancelled) => Some(Transition::Skip),
            (Failed, _) => Some(Transition::Apply),

            (Cancelled, Cancelled) => Some(Transition::Skip),
            (Cancelled, _) => Some(Transition::Apply),

            (Queued, _) => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Warn | Self::Failed | Self::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "warn" => Ok(Self::Warn),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// How a run came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    /// Created by the scheduler.
    Scheduled,
    /// A one-off.
    Manual,
    Retry,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown run type: {other}")),
        }
    }
}
