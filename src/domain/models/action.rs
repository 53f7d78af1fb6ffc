//! Neutral action schema.
//!
//! Actions are declarative: they say *what* should happen on the device,
//! never *how*. Backends translate the intent into concrete device or API
//! calls. The wire form is a tagged JSON object (`"type": "click"`, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl Default for MouseButton {
    fn default() -> Self {
        Self::Left
    }
}

impl MouseButton {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "left" => Some(Self::Left),
            "middle" => Some(Self::Middle),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

fn default_count() -> u8 {
    1
}

/// A declarative device operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Screenshot,
    Click {
        xy: [i32; 2],
        #[serde(default)]
        button: MouseButton,
        #[serde(default = "default_count")]
        count: u8,
        #[serde(default)]
        hold_keys: Vec<String>,
    },
    Type {
        text: String,
        #[serde(default)]
        xy: Option<[i32; 2]>,
        #[serde(default)]
        overwrite: bool,
        #[serde(default)]
        press_enter: bool,
    },
    Drag {
        start: [i32; 2],
        end: [i32; 2],
        #[serde(default)]
        hold_keys: Vec<String>,
    },
    Scroll {
        xy: [i32; 2],
        clicks: i32,
        #[serde(default)]
        vertical: bool,
    },
    Hotkey {
        keys: Vec<String>,
    },
    HoldAndPress {
        hold_keys: Vec<String>,
        press_keys: Vec<String>,
    },
    Open {
        app_or_filename: String,
    },
    SwitchApp {
        app_code: String,
    },
    Wait {
        seconds: f64,
    },
    Done {
        #[serde(default)]
        return_value: Option<serde_json::Value>,
    },
    Fail,
}

impl Action {
    /// Wire name of the action variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Screenshot => "screenshot",
            Self::Click { .. } => "click",
            Self::Type { .. } => "type",
            Self::Drag { .. } => "drag",
            Self::Scroll { .. } => "scroll",
            Self::Hotkey { .. } => "hotkey",
            Self::HoldAndPress { .. } => "hold_and_press",
            Self::Open { .. } => "open",
            Self::SwitchApp { .. } => "switch_app",
            Self::Wait { .. } => "wait",
            Self::Done { .. } => "done",
            Self::Fail => "fail",
        }
    }

    /// Whether executing this action requires the device at all. `done` and
    /// `fail` are control markers consumed by the dispatcher.
    pub fn is_control_marker(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Fail)
    }
}

/// One executed (or control) action in the durable trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step: u32,
    pub timestamp: DateTime<Utc>,
    /// Name of the subtask the action served
    pub subtask: String,
    /// High-level description from the action generator
    pub description: String,
    pub action: Action,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Workspace-relative screenshot path taken before the action
    #[serde(default)]
    pub screenshot: Option<String>,
}
