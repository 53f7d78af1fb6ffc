//! HTTP sandbox backend.
//!
//! Translates the neutral action schema into calls against a remote
//! sandbox control API: actions POST to the sandbox's action endpoint,
//! screenshots GET raw bytes, sandbox lifecycle maps to create/delete.
//! Transport failures retry (the action contract's 2x bound is enforced by
//! the dispatcher); logical failures come back as `success = false`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::models::{Action, BackendKind, Platform, SandboxHandle, SandboxSpec};
use crate::domain::ports::{Backend, BackendError, ExecOutcome, SandboxProvider};
use crate::services::config::SandboxConfig;

/// Default screen dimensions per platform, used when the sandbox API does
/// not report a size.
fn default_screen(platform: Platform) -> (u32, u32) {
    match platform {
        Platform::Android => (1080, 1920),
        _ => (1280, 720),
    }
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateSandboxResponse {
    #[serde(alias = "id")]
    sandbox_id: String,
    #[serde(default)]
    shape: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    screen_width: Option<u32>,
    #[serde(default)]
    screen_height: Option<u32>,
}

/// A backend bound to one remote sandbox.
pub struct HttpSandboxBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    sandbox_id: String,
    screen: (u32, u32),
}

impl HttpSandboxBackend {
    fn action_url(&self) -> String {
        format!("{}/sandboxes/{}/actions", self.base_url, self.sandbox_id)
    }

    fn screenshot_url(&self) -> String {
        format!("{}/sandboxes/{}/screenshot", self.base_url, self.sandbox_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn fetch_screenshot(&self) -> Result<Vec<u8>, BackendError> {
        let response = self
            .authorize(self.client.get(self.screenshot_url()))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BackendError::Transport(format!(
                "screenshot returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn post_action(&self, action: &Action) -> Result<ExecOutcome, BackendError> {
        let response = self
            .authorize(self.client.post(self.action_url()))
            .json(action)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BackendError::Transport(format!("action returned {status}")));
        }
        let body: ActionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(format!("bad action response: {e}")))?;

        Ok(ExecOutcome {
            success: body.success,
            observation: None,
            error: body.error,
        })
    }
}

#[async_trait]
impl Backend for HttpSandboxBackend {
    async fn execute(
        &self,
        action: &Action,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        debug!(sandbox_id = %self.sandbox_id, action = action.kind(), "dispatching action");

        let work = async {
            match action {
                Action::Screenshot => {
                    let bytes = self.fetch_screenshot().await?;
                    Ok(ExecOutcome {
                        success: true,
                        observation: Some(bytes),
                        error: None,
                    })
                }
                Action::Wait { seconds } => {
                    tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                    Ok(ExecOutcome::ok())
                }
                // done/fail are dispatcher control markers; the device has
                // nothing to do.
                Action::Done { .. } | Action::Fail => Ok(ExecOutcome::ok()),
                other => self.post_action(other).await,
            }
        };

        tokio::select! {
            result = work => result,
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
        }
    }

    fn screen_size(&self) -> (u32, u32) {
        self.screen
    }

    fn sandbox_id(&self) -> Option<String> {
        Some(self.sandbox_id.clone())
    }

    async fn release_sandbox(&self) -> Result<(), BackendError> {
        let url = format!("{}/sandboxes/{}", self.base_url, self.sandbox_id);
        let response = self
            .authorize(self.client.delete(url))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BackendError::Transport(format!(
                "release returned {}",
                response.status()
            )));
        }
        debug!(sandbox_id = %self.sandbox_id, "sandbox released");
        Ok(())
    }
}

/// Provisions sandboxes over the control API and connects backends.
pub struct HttpSandboxProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpSandboxProvider {
    pub fn new(config: &SandboxConfig) -> Result<Self, BackendError> {
        let base_url = config
            .api_url
            .clone()
            .ok_or_else(|| BackendError::Unsupported("sandbox api_url is not configured".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn create_remote(
        &self,
        spec: &SandboxSpec,
    ) -> Result<CreateSandboxResponse, BackendError> {
        let response = self
            .authorize(self.client.post(format!("{}/sandboxes", self.base_url)))
            .json(&serde_json::json!({
                "name": spec.name,
                "max_life_seconds": spec.max_life_seconds,
                "project_id": spec.project_id,
                "shape": spec.shape,
            }))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Transport(format!(
                "sandbox create returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| BackendError::Transport(format!("bad sandbox response: {e}")))
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, BackendError> {
        let created = self.create_remote(spec).await?;
        Ok(SandboxHandle {
            sandbox_id: created.sandbox_id,
            shape: created.shape.unwrap_or_default(),
            status: created.status.unwrap_or_else(|| "ready".to_string()),
        })
    }

    async fn connect(
        &self,
        kind: BackendKind,
        platform: Platform,
        sandbox: Option<SandboxSpec>,
    ) -> Result<Arc<dyn Backend>, BackendError> {
        if kind == BackendKind::LocalGui {
            return Err(BackendError::Unsupported(
                "local display driver is not bundled with this build".into(),
            ));
        }

        let spec = sandbox.unwrap_or_default();
        let (sandbox_id, screen) = match spec.id {
            Some(ref id) => (id.clone(), default_screen(platform)),
            None => {
                let created = self.create_remote(&spec).await?;
                let screen = match (created.screen_width, created.screen_height) {
                    (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
                    _ => default_screen(platform),
                };
                debug!(sandbox_id = %created.sandbox_id, "created sandbox for task");
                (created.sandbox_id, screen)
            }
        };

        Ok(Arc::new(HttpSandboxBackend {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            sandbox_id,
            screen,
        }))
    }
}

/// Provider used when no sandbox API is configured: task submission still
/// works against pre-attached sandboxes in tests, everything else refuses.
pub struct UnconfiguredProvider;

#[async_trait]
impl SandboxProvider for UnconfiguredProvider {
    async fn create_sandbox(&self, _spec: &SandboxSpec) -> Result<SandboxHandle, BackendError> {
        warn!("sandbox creation requested but no sandbox API is configured");
        Err(BackendError::Unsupported(
            "sandbox api_url is not configured".into(),
        ))
    }

    async fn connect(
        &self,
        _kind: BackendKind,
        _platform: Platform,
        _sandbox: Option<SandboxSpec>,
    ) -> Result<Arc<dyn Backend>, BackendError> {
        Err(BackendError::Unsupported(
            "sandbox api_url is not configured".into(),
        ))
    }
}
