//! Domain models.

pub mod action;
pub mod event;
pub mod plan;
pub mod quality;
pub mod request;
pub mod task;

pub use action::{Action, ActionRecord, MouseButton};
pub use event::{Stage, StageEvent};
pub use plan::{Plan, PlanGraph, Subtask};
pub use quality::{QualityReport, QualityStatus, Recommendation};
pub use request::{
    AgentInfo, BackendKind, RunConfig, RunRequest, SandboxHandle, SandboxSpec, ToolOverride,
};
pub use task::{Platform, Task, TaskMode, TaskPatch, TaskStats, TaskStatus};
