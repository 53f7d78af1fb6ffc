//! Service request and configuration DTOs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{Platform, TaskMode};
use crate::domain::errors::CoreError;

/// Which device backend executes the neutral actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Lybic,
    LybicMobile,
    LocalGui,
    Vm,
    Adb,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Lybic
    }
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lybic => "lybic",
            Self::LybicMobile => "lybic_mobile",
            Self::LocalGui => "local_gui",
            Self::Vm => "vm",
            Self::Adb => "adb",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "lybic" => Some(Self::Lybic),
            "lybic_mobile" => Some(Self::LybicMobile),
            "local_gui" => Some(Self::LocalGui),
            "vm" => Some(Self::Vm),
            "adb" => Some(Self::Adb),
            _ => None,
        }
    }
}

/// Per-tool provider/model overrides, forwarded opaquely to the tool layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOverride {
    pub provider: Option<String>,
    pub model_name: Option<String>,
    pub api_key: Option<String>,
    pub api_endpoint: Option<String>,
}

/// Recognized per-run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub backend: BackendKind,
    pub mode: TaskMode,
    pub max_steps: u32,
    pub platform: Platform,
    /// Backend-specific sandbox shape string
    pub shape: Option<String>,
    pub enable_search: bool,
    pub enable_takeover: bool,
    pub per_tool_overrides: HashMap<String, ToolOverride>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            mode: TaskMode::Normal,
            max_steps: 50,
            platform: Platform::default(),
            shape: None,
            enable_search: false,
            enable_takeover: false,
            per_tool_overrides: HashMap::new(),
        }
    }
}

/// Reference to (or request for) a sandbox environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSpec {
    /// Existing sandbox to attach to; when absent one is created
    pub id: Option<String>,
    pub name: Option<String>,
    pub max_life_seconds: Option<u64>,
    pub project_id: Option<String>,
    pub shape: Option<String>,
}

/// Handle returned when a sandbox is provisioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub shape: String,
    pub status: String,
}

/// A client's request to run one instruction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub instruction: String,
    pub sandbox: Option<SandboxSpec>,
    pub config: Option<RunConfig>,
    pub destroy_sandbox: bool,
    pub continue_context: bool,
    pub previous_task_id: Option<Uuid>,
}

impl RunRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..Default::default()
        }
    }

    /// Surface malformed requests before admission.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.instruction.trim().is_empty() {
            return Err(CoreError::Validation("instruction must not be empty".into()));
        }
        if let Some(ref config) = self.config {
            if config.max_steps == 0 {
                return Err(CoreError::Validation("max_steps must be >= 1".into()));
            }
        }
        if self.continue_context && self.previous_task_id.is_none() {
            return Err(CoreError::Validation(
                "continue_context requires previous_task_id".into(),
            ));
        }
        Ok(())
    }

    pub fn effective_config(&self) -> RunConfig {
        self.config.clone().unwrap_or_default()
    }
}

/// Static information about this agent service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub version: String,
    pub max_concurrent: usize,
    pub log_level: String,
    pub domain: String,
}
