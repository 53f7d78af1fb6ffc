//! Task domain model.
//!
//! A task is one natural-language instruction driven from admission to a
//! terminal state by a single dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::Plan;

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted but the dispatcher has not started yet
    Pending,
    /// Dispatcher loop is driving the task
    Running,
    /// All subtasks finished
    Completed,
    /// Terminal failure (step budget, backend loss, internal error)
    Failed,
    /// Cancelled cooperatively by a client
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions from this status. The lifecycle is a monotone DAG:
    /// `pending -> running -> {completed, failed, cancelled}`, with the one
    /// shortcut `pending -> cancelled` when cancellation precedes start.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Cancelled],
            Self::Running => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Execution mode selecting the action-generator family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Normal,
    Fast,
}

impl Default for TaskMode {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Fast => "fast",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "normal" => Some(Self::Normal),
            "fast" => Some(Self::Fast),
            _ => None,
        }
    }
}

/// Target platform of the controlled display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Windows,
    Linux,
    Macos,
    Android,
}

impl Default for Platform {
    fn default() -> Self {
        Self::Linux
    }
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::Macos => "macos",
            Self::Android => "android",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "windows" => Some(Self::Windows),
            "linux" | "ubuntu" => Some(Self::Linux),
            "macos" | "darwin" => Some(Self::Macos),
            "android" => Some(Self::Android),
            _ => None,
        }
    }
}

/// Accumulated execution statistics for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskStats {
    pub steps: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub currency: String,
}

impl Default for TaskStats {
    fn default() -> Self {
        Self {
            steps: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            currency: "USD".to_string(),
        }
    }
}

/// The full task record as persisted by the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub instruction: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub sandbox_id: Option<String>,
    pub destroy_sandbox_on_exit: bool,
    pub mode: TaskMode,
    pub max_steps: u32,
    pub platform: Platform,
    pub stats: TaskStats,
    pub final_message: Option<String>,
    pub plan: Plan,
    /// Opaque LLM message history, images stripped.
    pub conversation: Vec<serde_json::Value>,
}

impl Task {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            instruction: instruction.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            sandbox_id: None,
            destroy_sandbox_on_exit: false,
            mode: TaskMode::Normal,
            max_steps: 50,
            platform: Platform::default(),
            stats: TaskStats::default(),
            final_message: None,
            plan: Plan::default(),
            conversation: Vec::new(),
        }
    }
}

/// Partial update applied by the store; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub sandbox_id: Option<String>,
    pub stats: Option<TaskStats>,
    pub final_message: Option<String>,
    pub plan: Option<Plan>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.started_at.is_none()
            && self.ended_at.is_none()
            && self.sandbox_id.is_none()
            && self.stats.is_none()
            && self.final_message.is_none()
            && self.plan.is_none()
    }

    /// Apply this patch to a task record, last writer wins per field.
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(at) = self.started_at {
            task.started_at = Some(at);
        }
        if let Some(at) = self.ended_at {
            task.ended_at = Some(at);
        }
        if let Some(ref id) = self.sandbox_id {
            task.sandbox_id = Some(id.clone());
        }
        if let Some(ref stats) = self.stats {
            task.stats = stats.clone();
        }
        if let Some(ref msg) = self.final_message {
            task.final_message = Some(msg.clone());
        }
        if let Some(ref plan) = self.plan {
            task.plan = plan.clone();
        }
    }
}
