//! Task manager: the public service surface.
//!
//! Owns the `task_id -> handle` map and the admission semaphore. Admission
//! is non-blocking: when every slot is busy the caller gets `Unavailable`
//! instead of queueing, because tasks are minutes of wall-clock and real
//! money; backpressure belongs at the client. Each admitted task gets a
//! workspace, an event bus and one spawned dispatcher; the permit returns
//! when the dispatcher finishes, and the bus lingers briefly for late
//! subscribers before it is torn down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    AgentInfo, RunRequest, SandboxHandle, SandboxSpec, Stage, Task, TaskStatus,
};
use crate::domain::ports::{SandboxProvider, TaskStore, ToolInvoker};
use crate::services::config::Config;
use crate::services::dispatcher::{Dispatcher, DispatcherConfig};
use crate::services::event_bus::{EventSubscription, TaskEventBus};
use crate::services::metrics::Metrics;
use crate::services::tooling::MeteredInvoker;
use crate::services::workspace::Workspace;

struct TaskHandle {
    bus: Arc<TaskEventBus>,
    cancel: CancellationToken,
}

struct ManagerInner {
    config: Config,
    store: Arc<dyn TaskStore>,
    invoker: Arc<dyn ToolInvoker>,
    provider: Arc<dyn SandboxProvider>,
    metrics: Arc<Metrics>,
    tasks: RwLock<HashMap<Uuid, TaskHandle>>,
    slots: Arc<Semaphore>,
}

/// Admission control, lifecycle and lookup for agent tasks.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    /// Build the manager and run store crash recovery.
    pub async fn new(
        config: Config,
        store: Arc<dyn TaskStore>,
        invoker: Arc<dyn ToolInvoker>,
        provider: Arc<dyn SandboxProvider>,
        metrics: Arc<Metrics>,
    ) -> CoreResult<Self> {
        let recovered = store.recover_interrupted().await?;
        if recovered > 0 {
            warn!(count = recovered, "marked interrupted tasks failed on startup");
        }

        let metered: Arc<dyn ToolInvoker> = Arc::new(MeteredInvoker::new(
            invoker,
            &config.tools,
            Arc::clone(&metrics),
            config.service.tool_timeout_secs,
        ));
        let slots = Arc::new(Semaphore::new(config.service.max_concurrent_tasks));

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                invoker: metered,
                provider,
                metrics,
                tasks: RwLock::new(HashMap::new()),
                slots,
            }),
        })
    }

    /// Admit a task and start its dispatcher. Returns the new task id, or
    /// `Unavailable` when the concurrency bound is reached.
    pub async fn submit(&self, request: RunRequest) -> CoreResult<Uuid> {
        request.validate()?;

        // A dangling previous_task_id is a client bug, not a fresh start.
        if request.continue_context {
            if let Some(previous) = request.previous_task_id {
                if self.inner.store.get(previous).await.is_err() {
                    return Err(CoreError::Validation(format!(
                        "previous_task_id {previous} is unknown"
                    )));
                }
            }
        }

        let permit = Arc::clone(&self.inner.slots).try_acquire_owned().map_err(|_| {
            CoreError::Unavailable(format!(
                "max concurrent tasks ({}) reached",
                self.inner.config.service.max_concurrent_tasks
            ))
        })?;

        let config = request.effective_config();
        let mut task = Task::new(request.instruction.clone());
        task.mode = config.mode;
        task.max_steps = config.max_steps;
        task.platform = config.platform;
        task.destroy_sandbox_on_exit = request.destroy_sandbox;
        if let Some(ref sandbox) = request.sandbox {
            task.sandbox_id = sandbox.id.clone();
        }
        if request.continue_context {
            if let Some(previous) = request.previous_task_id {
                if let Ok(prior) = self.inner.store.get(previous).await {
                    task.conversation = prior.conversation;
                }
            }
        }

        let task_id = task.id;
        self.inner.store.create(&task).await?;
        self.inner.metrics.record_task_created(task.status.as_str());

        let workspace = Arc::new(
            Workspace::create(&self.inner.config.storage.log_dir, task_id)
                .await
                .map_err(|e| CoreError::Fatal(format!("workspace creation failed: {e}")))?,
        );
        let bus = TaskEventBus::new(task_id);
        let cancel = CancellationToken::new();
        self.inner.tasks.write().await.insert(
            task_id,
            TaskHandle {
                bus: Arc::clone(&bus),
                cancel: cancel.clone(),
            },
        );

        info!(task_id = %task_id, instruction = %task.instruction, "task admitted");
        let inner = Arc::clone(&self.inner);
        let request_sandbox = request.sandbox.clone();
        tokio::spawn(async move {
            run_task(
                inner,
                task,
                request_sandbox,
                config,
                workspace,
                bus,
                cancel,
                permit,
            )
            .await;
        });

        Ok(task_id)
    }

    /// Synchronous variant: admit and attach to the event stream in one
    /// call. The stream ends when the task is terminal and the bus closes.
    pub async fn run_streaming(
        &self,
        request: RunRequest,
    ) -> CoreResult<(Uuid, EventSubscription)> {
        let task_id = self.submit(request).await?;
        let subscription = self.subscribe(task_id).await?;
        Ok((task_id, subscription))
    }

    /// Attach to a task's event stream. Late subscribers get replayed
    /// history; after the linger window the bus is gone and the stored
    /// record is the only trace.
    pub async fn subscribe(&self, task_id: Uuid) -> CoreResult<EventSubscription> {
        let tasks = self.inner.tasks.read().await;
        match tasks.get(&task_id) {
            Some(handle) => Ok(handle.bus.subscribe()),
            None => {
                // Distinguish a finished task from an unknown one.
                match self.inner.store.get(task_id).await {
                    Ok(_) => Err(CoreError::AlreadyTerminal(task_id)),
                    Err(_) => Err(CoreError::not_found_task(task_id)),
                }
            }
        }
    }

    /// Current record for one task.
    pub async fn query(&self, task_id: Uuid) -> CoreResult<Task> {
        self.inner.store.get(task_id).await
    }

    /// Request cooperative cancellation. Idempotent: `true` while the task
    /// can still be cancelled, `false` once it is terminal.
    pub async fn cancel(&self, task_id: Uuid) -> CoreResult<bool> {
        let task = self.inner.store.get(task_id).await?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        let tasks = self.inner.tasks.read().await;
        match tasks.get(&task_id) {
            Some(handle) => {
                handle.cancel.cancel();
                info!(task_id = %task_id, "cancellation requested");
                Ok(true)
            }
            // Terminal write may still be in flight; the record decides.
            None => Ok(false),
        }
    }

    /// Reverse-chronological task listing.
    pub async fn list(&self, limit: usize, offset: usize) -> CoreResult<(Vec<Task>, usize)> {
        self.inner.store.list(limit, offset).await
    }

    pub fn agent_info(&self) -> AgentInfo {
        AgentInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_concurrent: self.inner.config.service.max_concurrent_tasks,
            log_level: self.inner.config.logging.level.clone(),
            domain: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }

    /// Provision a sandbox without running a task.
    pub async fn create_sandbox(&self, spec: SandboxSpec) -> CoreResult<SandboxHandle> {
        let handle = self
            .inner
            .provider
            .create_sandbox(&spec)
            .await
            .map_err(|e| CoreError::Transient(format!("sandbox creation failed: {e}")))?;
        self.inner.metrics.record_sandbox_created(&handle.shape);
        Ok(handle)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Tasks currently admitted and not yet terminal.
    pub fn active_count(&self) -> usize {
        self.inner.config.service.max_concurrent_tasks - self.inner.slots.available_permits()
    }
}

/// The spawned per-task routine: connect the backend, run the dispatcher,
/// then linger the bus and drop the handle.
#[allow(clippy::too_many_arguments)]
async fn run_task(
    inner: Arc<ManagerInner>,
    task: Task,
    sandbox: Option<SandboxSpec>,
    run_config: crate::domain::models::RunConfig,
    workspace: Arc<Workspace>,
    bus: Arc<TaskEventBus>,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
) {
    let queued_at = Instant::now();
    let task_id = task.id;
    let backend_kind = run_config.backend;

    // Cancellation that lands before anything ran takes the
    // pending -> cancelled shortcut without touching the backend.
    if cancel.is_cancelled() {
        bus.publish(Stage::Cancelled, "cancelled before start", None);
        let _ = inner
            .store
            .update(
                task_id,
                crate::domain::models::TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    ended_at: Some(chrono::Utc::now()),
                    final_message: Some("cancelled before start".to_string()),
                    ..Default::default()
                },
            )
            .await;
        inner
            .metrics
            .record_task_created(TaskStatus::Cancelled.as_str());
        finalize(inner, task_id, bus, permit).await;
        return;
    }

    // The status machine never skips `running`: connecting the backend is
    // already part of the run.
    let _ = inner
        .store
        .update(
            task_id,
            crate::domain::models::TaskPatch {
                status: Some(TaskStatus::Running),
                started_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await;

    let backend = match inner
        .provider
        .connect(backend_kind, task.platform, sandbox)
        .await
    {
        Ok(backend) => backend,
        Err(err) => {
            error!(task_id = %task_id, error = %err, "backend connection failed");
            bus.publish(Stage::Starting, "Task starting", None);
            bus.publish(
                Stage::Failed,
                format!("backend connection failed: {err}"),
                None,
            );
            let _ = inner
                .store
                .update(
                    task_id,
                    crate::domain::models::TaskPatch {
                        status: Some(TaskStatus::Failed),
                        ended_at: Some(chrono::Utc::now()),
                        final_message: Some(format!("backend connection failed: {err}")),
                        ..Default::default()
                    },
                )
                .await;
            inner.metrics.record_task_created(TaskStatus::Failed.as_str());
            finalize(inner, task_id, bus, permit).await;
            return;
        }
    };

    if backend.sandbox_id().is_some() && task.sandbox_id.is_none() {
        inner.metrics.record_sandbox_created(backend_kind.as_str());
    }

    inner
        .metrics
        .task_started(queued_at.elapsed().as_secs_f64());

    let dispatcher = Dispatcher::new(
        Arc::clone(&inner.store),
        Arc::clone(&inner.invoker),
        backend,
        workspace,
        Arc::clone(&bus),
        Arc::clone(&inner.metrics),
        cancel,
        DispatcherConfig {
            backend_timeout_secs: inner.config.service.backend_timeout_secs,
            reflection_interval_steps: inner.config.service.reflection_interval_steps,
            enable_search: run_config.enable_search,
            enable_takeover: run_config.enable_takeover,
            cleanup_workspace: inner.config.service.cleanup_workspace,
            per_tool_overrides: run_config.per_tool_overrides,
        },
    );
    dispatcher.run(task).await;

    finalize(inner, task_id, bus, permit).await;
}

/// Release the admission slot immediately, keep the bus alive for late
/// subscribers through the linger window, then drop the handle.
async fn finalize(
    inner: Arc<ManagerInner>,
    task_id: Uuid,
    bus: Arc<TaskEventBus>,
    permit: OwnedSemaphorePermit,
) {
    drop(permit);
    let linger = Duration::from_secs(inner.config.linger_secs());
    tokio::time::sleep(linger).await;
    bus.close();
    inner.tasks.write().await.remove(&task_id);
}
