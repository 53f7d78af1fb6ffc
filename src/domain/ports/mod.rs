//! Ports: interfaces the core consumes, implemented by adapters and fakes.

pub mod backend;
pub mod task_store;
pub mod tool_invoker;

pub use backend::{Backend, BackendError, ExecOutcome, SandboxProvider};
pub use task_store::TaskStore;
pub use tool_invoker::{ToolCall, ToolError, ToolErrorKind, ToolInvoker, ToolName, ToolResponse};
