//! Backend port: neutral action execution against a device or sandbox.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::models::{Action, BackendKind, Platform, SandboxHandle, SandboxSpec};

#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport-level problem worth retrying.
    #[error("transport error: {0}")]
    Transport(String),

    /// The per-call deadline elapsed; surfaced as retryable.
    #[error("backend call timed out after {0} seconds")]
    Timeout(u64),

    /// The in-flight call observed cancellation.
    #[error("cancelled")]
    Cancelled,

    /// This backend cannot serve the request at all.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Result of executing one neutral action. Logical failures (element not
/// found, permission denied) arrive as `success = false`, not as errors.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub success: bool,
    /// Screenshot bytes when the action produces an observation
    pub observation: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl ExecOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            observation: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            observation: None,
            error: Some(error.into()),
        }
    }
}

/// A connected device/sandbox executing the neutral action schema.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute one action. The only place the core blocks on device I/O.
    async fn execute(
        &self,
        action: &Action,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, BackendError>;

    /// Declared screen dimensions in pixels (width, height).
    fn screen_size(&self) -> (u32, u32);

    /// The sandbox this backend is attached to, if any.
    fn sandbox_id(&self) -> Option<String>;

    /// Tear the remote environment down.
    async fn release_sandbox(&self) -> Result<(), BackendError>;
}

/// Provisions sandboxes and connects backends to them.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, BackendError>;

    /// Build a connected backend for a task, creating a sandbox when the
    /// spec carries no existing id.
    async fn connect(
        &self,
        kind: BackendKind,
        platform: Platform,
        sandbox: Option<SandboxSpec>,
    ) -> Result<Arc<dyn Backend>, BackendError>;
}
