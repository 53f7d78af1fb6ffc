//! Shared fakes and fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use marionette::domain::models::{
    Action, BackendKind, Platform, SandboxHandle, SandboxSpec,
};
use marionette::domain::ports::{
    Backend, BackendError, ExecOutcome, SandboxProvider, ToolCall, ToolError, ToolInvoker,
    ToolName, ToolResponse,
};
use marionette::services::config::Config;
use marionette::services::metrics::Metrics;
use marionette::services::task_manager::TaskManager;
use marionette::adapters::store::MemoryTaskStore;
use marionette::domain::ports::TaskStore;

/// A canned reply for one tool call.
#[derive(Clone)]
pub struct Scripted {
    pub text: String,
    pub delay: Duration,
}

impl Scripted {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(text: impl Into<String>, delay: Duration) -> Self {
        Self {
            text: text.into(),
            delay,
        }
    }
}

/// Tool invoker fed from per-tool reply queues. When a queue runs dry the
/// tool falls back to a benign default so tests only script what they
/// assert on.
#[derive(Default)]
pub struct ScriptedInvoker {
    queues: Mutex<HashMap<ToolName, Vec<Scripted>>>,
    pub calls: Mutex<Vec<(ToolName, String)>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tool: ToolName, reply: Scripted) {
        self.queues.lock().unwrap().entry(tool).or_default().push(reply);
    }

    pub fn push_text(&self, tool: ToolName, text: impl Into<String>) {
        self.push(tool, Scripted::text(text));
    }

    pub fn calls_for(&self, tool: ToolName) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == tool)
            .count()
    }

    /// The prompts sent to one tool, in call order.
    pub fn prompts_for(&self, tool: ToolName) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == tool)
            .map(|(_, text)| text.clone())
            .collect()
    }

    fn default_reply(tool: ToolName) -> String {
        match tool {
            ToolName::SubtaskPlanner => "1. DefaultStep: carry on".to_string(),
            // Unparseable on purpose: the planner degrades to the linear
            // order instead of silently adopting a default graph.
            ToolName::DagTranslator => "no graph available".to_string(),
            ToolName::Grounding => "(100, 100)".to_string(),
            ToolName::TrajReflector => {
                r#"{"status": "good", "recommendation": "continue", "confidence": 0.9}"#.to_string()
            }
            _ => "done()".to_string(),
        }
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        call: ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResponse, ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((call.tool, call.text.clone()));
        let reply = {
            let mut queues = self.queues.lock().unwrap();
            match queues.get_mut(&call.tool) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Scripted::text(Self::default_reply(call.tool)),
            }
        };

        if !reply.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(reply.delay) => {}
                _ = cancel.cancelled() => {
                    return Err(ToolError::provider("cancelled", false));
                }
            }
        }

        Ok(ToolResponse {
            text: reply.text,
            input_tokens: 100,
            output_tokens: 20,
            cost: 0.001,
        })
    }
}

/// Backend that records every executed action and serves unique
/// screenshots so the frozen-screen rule stays quiet.
pub struct ScriptedBackend {
    pub executed: Mutex<Vec<Action>>,
    frame: AtomicU64,
    screen: (u32, u32),
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            executed: Mutex::new(Vec::new()),
            frame: AtomicU64::new(0),
            screen: (1280, 720),
        })
    }

    pub fn executed_kinds(&self) -> Vec<&'static str> {
        self.executed.lock().unwrap().iter().map(|a| a.kind()).collect()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            frame: AtomicU64::new(0),
            screen: (1280, 720),
        }
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn execute(
        &self,
        action: &Action,
        _cancel: &CancellationToken,
    ) -> Result<ExecOutcome, BackendError> {
        match action {
            Action::Screenshot => {
                let frame = self.frame.fetch_add(1, Ordering::SeqCst);
                Ok(ExecOutcome {
                    success: true,
                    observation: Some(format!("frame-{frame}").into_bytes()),
                    error: None,
                })
            }
            other => {
                self.executed.lock().unwrap().push(other.clone());
                Ok(ExecOutcome::ok())
            }
        }
    }

    fn screen_size(&self) -> (u32, u32) {
        self.screen
    }

    fn sandbox_id(&self) -> Option<String> {
        Some("sbx-test".to_string())
    }

    async fn release_sandbox(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Provider that always hands out the same scripted backend.
pub struct FakeProvider {
    pub backend: Arc<ScriptedBackend>,
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, BackendError> {
        Ok(SandboxHandle {
            sandbox_id: "sbx-created".to_string(),
            shape: spec.shape.clone().unwrap_or_else(|| "small".to_string()),
            status: "ready".to_string(),
        })
    }

    async fn connect(
        &self,
        _kind: BackendKind,
        _platform: Platform,
        _sandbox: Option<SandboxSpec>,
    ) -> Result<Arc<dyn Backend>, BackendError> {
        Ok(Arc::clone(&self.backend) as Arc<dyn Backend>)
    }
}

/// Config tuned for tests: tight linger, workspace under a temp dir.
pub fn test_config(log_dir: &std::path::Path, max_concurrent: usize) -> Config {
    let mut config = Config::default();
    config.service.max_concurrent_tasks = max_concurrent;
    config.service.stream_linger_secs = 1;
    config.service.backend_timeout_secs = 5;
    config.service.tool_timeout_secs = 60;
    config.storage.log_dir = log_dir.to_path_buf();
    config
}

pub struct TestHarness {
    pub manager: TaskManager,
    pub invoker: Arc<ScriptedInvoker>,
    pub backend: Arc<ScriptedBackend>,
    pub store: Arc<MemoryTaskStore>,
    pub log_dir: tempfile::TempDir,
}

/// Build a full manager over in-memory parts.
pub async fn harness(max_concurrent: usize) -> TestHarness {
    harness_with(max_concurrent, ScriptedInvoker::new()).await
}

pub async fn harness_with(max_concurrent: usize, invoker: ScriptedInvoker) -> TestHarness {
    let log_dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(log_dir.path(), max_concurrent);
    let invoker = Arc::new(invoker);
    let backend = ScriptedBackend::new();
    let store = Arc::new(MemoryTaskStore::new());
    let metrics = Arc::new(Metrics::new(true, max_concurrent));

    let manager = TaskManager::new(
        config,
        Arc::clone(&store) as Arc<dyn TaskStore>,
        Arc::clone(&invoker) as Arc<dyn ToolInvoker>,
        Arc::new(FakeProvider {
            backend: Arc::clone(&backend),
        }),
        metrics,
    )
    .await
    .expect("manager");

    TestHarness {
        manager,
        invoker,
        backend,
        store,
        log_dir,
    }
}
