//! Execution Status

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a state execution instance or a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    #[default]
    New,
    Queued,
    Running,
    Success,
    Failed,
    Error,
    Paused,
    Aborted,
    Waiting,
    Discontinuing,
}

impl ExecutionStatus {
    /// Statuses that still have work pending.
    pub const ACTIVE: [ExecutionStatus; 6] = [
        Self::New,
        Self::Queued,
        Self::Running,
        Self::Paused,
        Self::Waiting,
        Self::Discontinuing,
    ];

    /// True for SUCCESS, FAILED, ERROR and ABORTED.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Error | Self::Aborted
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_final()
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Error | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Paused => "PAUSED",
            Self::Aborted => "ABORTED",
            Self::Waiting => "WAITING",
            Self::Discontinuing => "DISCONTINUING",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
