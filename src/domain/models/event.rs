//! Stage events streamed to task subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse stage a task is in when the event was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    Planning,
    Executing,
    Reflecting,
    Replanning,
    AwaitingUser,
    Finished,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Reflecting => "reflecting",
            Self::Replanning => "replanning",
            Self::AwaitingUser => "awaiting_user",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Final event of a task stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One streamed progress message. `seq` is assigned by the per-task event
/// bus and is strictly monotonic within the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub task_id: Uuid,
    pub seq: u64,
    pub stage: Stage,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Stage::AwaitingUser).unwrap(),
            "\"awaiting_user\""
        );
        assert_eq!(Stage::AwaitingUser.as_str(), "awaiting_user");
    }

    #[test]
    fn test_terminal_stages() {
        assert!(Stage::Finished.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(Stage::Cancelled.is_terminal());
        assert!(!Stage::Executing.is_terminal());
    }
}
