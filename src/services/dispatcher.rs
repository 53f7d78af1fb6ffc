//! Dispatcher: the single-threaded loop driving one task to a terminal
//! state.
//!
//! Per step: check cancellation, pop a subtask when none is active, take a
//! screenshot, ask the worker for the next action, execute it, record it,
//! reflect, and re-check the step budget. Every transition publishes a
//! stage event and mirrors state to the store and workspace. Tool and
//! backend failures never escape to the client as errors; the task
//! terminates `failed` with a message instead.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    Action, ActionRecord, QualityReport, Recommendation, Stage, Subtask, Task, TaskPatch,
    TaskStatus,
};
use crate::domain::ports::{Backend, BackendError, ExecOutcome, TaskStore, ToolInvoker};
use crate::services::event_bus::TaskEventBus;
use crate::services::metrics::Metrics;
use crate::services::planner::{Planner, PlanningContext};
use crate::services::reflector::{ReflectionInput, Reflector};
use crate::services::tooling::UsageTrackingInvoker;
use crate::services::worker::{Worker, WorkerContext, WorkerDecision};
use crate::services::workspace::Workspace;

/// How many recent actions and screenshot digests feed the reflector.
const REFLECTION_WINDOW: usize = 5;
/// Transport retries for one backend action.
const BACKEND_RETRIES: usize = 2;
/// Back-to-back worker `fail()` decisions before the task aborts instead
/// of replanning again.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Dispatcher tuning, copied out of the service and run configs at spawn
/// time.
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    pub backend_timeout_secs: u64,
    pub reflection_interval_steps: u32,
    pub enable_search: bool,
    pub enable_takeover: bool,
    pub cleanup_workspace: bool,
    pub per_tool_overrides: std::collections::HashMap<String, crate::domain::models::ToolOverride>,
}

/// Drives exactly one task. Owns the task's mutable state for its lifetime;
/// nothing else writes the status while the loop runs.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    backend: Arc<dyn Backend>,
    workspace: Arc<Workspace>,
    bus: Arc<TaskEventBus>,
    metrics: Arc<Metrics>,
    usage: Arc<UsageTrackingInvoker>,
    planner: Planner,
    worker: Worker,
    reflector: Reflector,
    cancel: CancellationToken,
    config: DispatcherConfig,
}

/// Loop-internal trajectory state.
struct Trajectory {
    current: Option<Subtask>,
    subtask_steps: u32,
    steps_since_check: u32,
    /// Worker `fail()` decisions with no progress in between. Survives
    /// replans so a fail -> replan -> fail cycle stays bounded.
    consecutive_failures: u32,
    recent_actions: VecDeque<ActionRecord>,
    screenshot_digests: VecDeque<u64>,
    last_reflection: Option<String>,
    grounding_failed: bool,
}

impl Trajectory {
    fn new() -> Self {
        Self {
            current: None,
            subtask_steps: 0,
            steps_since_check: 0,
            consecutive_failures: 0,
            recent_actions: VecDeque::new(),
            screenshot_digests: VecDeque::new(),
            last_reflection: None,
            grounding_failed: false,
        }
    }

    fn push_action(&mut self, record: ActionRecord) {
        if self.recent_actions.len() >= REFLECTION_WINDOW {
            self.recent_actions.pop_front();
        }
        self.recent_actions.push_back(record);
    }

    fn push_digest(&mut self, digest: u64) {
        if self.screenshot_digests.len() >= REFLECTION_WINDOW {
            self.screenshot_digests.pop_front();
        }
        self.screenshot_digests.push_back(digest);
    }

    fn reset_for_subtask(&mut self) {
        self.subtask_steps = 0;
    }

    fn reset_after_replan(&mut self) {
        self.current = None;
        self.subtask_steps = 0;
        self.recent_actions.clear();
        self.screenshot_digests.clear();
        self.last_reflection = None;
        self.grounding_failed = false;
    }
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        invoker: Arc<dyn ToolInvoker>,
        backend: Arc<dyn Backend>,
        workspace: Arc<Workspace>,
        bus: Arc<TaskEventBus>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
        config: DispatcherConfig,
    ) -> Self {
        let invoker: Arc<dyn ToolInvoker> = if config.per_tool_overrides.is_empty() {
            invoker
        } else {
            Arc::new(crate::services::tooling::OverridingInvoker::new(
                invoker,
                config.per_tool_overrides.clone(),
            ))
        };
        let usage = Arc::new(UsageTrackingInvoker::new(invoker));
        let tools: Arc<dyn ToolInvoker> = Arc::clone(&usage) as Arc<dyn ToolInvoker>;
        Self {
            store,
            backend,
            workspace,
            bus,
            metrics,
            planner: Planner::new(Arc::clone(&tools)),
            worker: Worker::new(Arc::clone(&tools)),
            reflector: Reflector::new(tools, config.reflection_interval_steps),
            usage,
            cancel,
            config,
        }
    }

    /// Run the task to a terminal state. Never returns an error: every
    /// failure mode maps to a terminal status on the record.
    pub async fn run(mut self, mut task: Task) {
        let started = tokio::time::Instant::now();

        // Cancellation that precedes start skips `running` entirely.
        if self.cancel.is_cancelled() {
            self.finish(&mut task, TaskStatus::Cancelled, "cancelled before start".into())
                .await;
            return;
        }

        self.bus.publish(Stage::Starting, "Task starting", None);
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        self.persist(
            task.id,
            TaskPatch {
                status: Some(TaskStatus::Running),
                started_at: task.started_at,
                sandbox_id: self.backend.sandbox_id(),
                ..Default::default()
            },
        )
        .await;
        let _ = self
            .workspace
            .write_state(
                "instruction.json",
                &json!({"text": task.instruction, "created_at": task.created_at}),
            )
            .await;

        match self.drive(&mut task).await {
            Ok((status, message)) => {
                self.finish(&mut task, status, message).await;
            }
            Err(err) => {
                let (status, message) = if self.cancel.is_cancelled() {
                    (TaskStatus::Cancelled, "cancelled by client".to_string())
                } else {
                    error!(task_id = %task.id, error = %err, "task failed");
                    (TaskStatus::Failed, format!("task failed: {err}"))
                };
                self.finish(&mut task, status, message).await;
            }
        }

        self.metrics.task_finished(
            task.status.as_str(),
            started.elapsed().as_secs_f64(),
            task.stats.steps,
        );
    }

    /// The state machine proper. Returns the terminal status and message;
    /// errors are internal failures the caller maps to `failed`.
    async fn drive(&mut self, task: &mut Task) -> CoreResult<(TaskStatus, String)> {
        let planning_ctx = PlanningContext {
            task_id: task.id,
            instruction: task.instruction.clone(),
            enable_search: self.config.enable_search,
        };
        let worker_ctx = WorkerContext {
            task_id: task.id,
            instruction: task.instruction.clone(),
            mode: task.mode,
            enable_takeover: self.config.enable_takeover,
            screen: self.backend.screen_size(),
        };

        // First observation feeds the planner.
        let first_shot = self.take_screenshot(task).await.ok();

        self.check_cancelled()?;
        self.bus.publish(Stage::Planning, "Generating plan", None);
        let outcome = self
            .planner
            .initial_plan(&planning_ctx, first_shot.as_deref(), &self.cancel)
            .await?;
        if outcome.degraded {
            self.bus.publish(
                Stage::Planning,
                "Dependency graph unusable, using linear plan",
                None,
            );
        }
        info!(task_id = %task.id, subtasks = outcome.subtasks.len(), "initial plan ready");
        task.plan.install(outcome.subtasks);
        self.sync_plan(task).await;
        self.append_conversation(
            task.id,
            vec![json!({
                "role": "assistant",
                "content": format!(
                    "Planned {} subtasks: {}",
                    task.plan.remaining.len(),
                    task.plan.remaining.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
                ),
            })],
        )
        .await;

        let mut trajectory = Trajectory::new();

        loop {
            self.check_cancelled()?;

            // Advance to the next subtask; an empty queue completes the task.
            if trajectory.current.is_none() {
                match task.plan.pop_front() {
                    Some(subtask) => {
                        info!(task_id = %task.id, subtask = %subtask.name, "starting subtask");
                        trajectory.current = Some(subtask);
                        trajectory.reset_for_subtask();
                        self.sync_plan(task).await;
                    }
                    None => {
                        return Ok((TaskStatus::Completed, "all subtasks completed".into()));
                    }
                }
            }

            if task.stats.steps >= task.max_steps {
                return Ok((TaskStatus::Failed, "step_budget_exhausted".into()));
            }

            let screenshot = self.take_screenshot(task).await?;
            let shot_path = self
                .workspace
                .save_screenshot(&screenshot)
                .await
                .ok()
                .map(|p| p.display().to_string());
            trajectory.push_digest(Reflector::screenshot_digest(&screenshot));

            let subtask = trajectory
                .current
                .clone()
                .ok_or_else(|| CoreError::Fatal("no active subtask".into()))?;

            self.check_cancelled()?;
            let step = self
                .worker
                .next_action(
                    &worker_ctx,
                    &subtask,
                    &task.plan,
                    &screenshot,
                    trajectory.last_reflection.as_deref(),
                    &self.cancel,
                )
                .await?;
            trajectory.grounding_failed = step.grounding_failed;
            self.append_conversation(
                task.id,
                vec![json!({"role": "assistant", "content": step.raw_plan})],
            )
            .await;

            match step.decision {
                WorkerDecision::Done { return_value } => {
                    self.bus.publish(
                        Stage::Executing,
                        format!("Subtask {} completed", subtask.name),
                        return_value.clone().map(|v| json!({"return_value": v})),
                    );
                    let record = self
                        .record_action(
                            task,
                            &subtask,
                            Action::Done { return_value },
                            format!("subtask {} done", subtask.name),
                            true,
                            None,
                            shot_path,
                        )
                        .await;
                    trajectory.push_action(record);
                    task.stats.steps += 1;
                    trajectory.steps_since_check += 1;
                    trajectory.consecutive_failures = 0;

                    let finished = trajectory.current.take().unwrap_or(subtask);
                    task.plan.complete(finished);
                    trajectory.last_reflection = None;
                    self.sync_plan(task).await;
                    self.persist_stats(task).await;
                    continue;
                }
                WorkerDecision::Fail => {
                    let failed = trajectory.current.take().unwrap_or(subtask);
                    warn!(task_id = %task.id, subtask = %failed.name, "worker reported subtask failure");
                    let record = self
                        .record_action(
                            task,
                            &failed,
                            Action::Fail,
                            format!("subtask {} failed", failed.name),
                            false,
                            Some("worker returned fail".into()),
                            shot_path,
                        )
                        .await;
                    trajectory.push_action(record);
                    task.stats.steps += 1;
                    trajectory.steps_since_check += 1;
                    trajectory.consecutive_failures += 1;
                    task.plan.fail(failed);
                    self.persist_stats(task).await;

                    if trajectory.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        return Ok((
                            TaskStatus::Failed,
                            format!(
                                "{} consecutive subtask failures",
                                trajectory.consecutive_failures
                            ),
                        ));
                    }
                    self.replan(task, &planning_ctx, &mut trajectory, "worker_fail", &screenshot)
                        .await?;
                    continue;
                }
                WorkerDecision::Takeover { message } => {
                    self.bus
                        .publish(Stage::AwaitingUser, message.clone(), None);
                    let record = self
                        .record_action(
                            task,
                            &subtask,
                            Action::Wait { seconds: 2.0 },
                            format!("awaiting user: {message}"),
                            true,
                            None,
                            shot_path,
                        )
                        .await;
                    trajectory.push_action(record);
                    task.stats.steps += 1;
                    trajectory.steps_since_check += 1;
                    trajectory.subtask_steps += 1;
                    self.persist_stats(task).await;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                    continue;
                }
                WorkerDecision::Act { action, description } => {
                    self.bus.publish(
                        Stage::Executing,
                        description.clone(),
                        Some(json!({"action": action.kind()})),
                    );
                    let outcome = self.execute_action(&action).await?;
                    let record = self
                        .record_action(
                            task,
                            &subtask,
                            action,
                            description,
                            outcome.success,
                            outcome.error.clone(),
                            shot_path,
                        )
                        .await;
                    trajectory.push_action(record);
                    task.stats.steps += 1;
                    trajectory.steps_since_check += 1;
                    trajectory.subtask_steps += 1;
                    if outcome.success {
                        trajectory.consecutive_failures = 0;
                    }
                    self.persist_stats(task).await;
                    self.append_conversation(
                        task.id,
                        vec![json!({
                            "role": "user",
                            "content": match &outcome.error {
                                Some(error) => format!("Observation: action failed: {error}"),
                                None => "Observation: action executed".to_string(),
                            },
                        })],
                    )
                    .await;
                }
            }

            // Reflect on the trajectory after each executed action.
            if let Some(report) = self.reflect(task, &subtask, &mut trajectory).await {
                if report.recommendation == Recommendation::Replan {
                    let failed = trajectory.current.take().unwrap_or(subtask);
                    task.plan.fail(failed);
                    self.replan(
                        task,
                        &planning_ctx,
                        &mut trajectory,
                        report.trigger.as_deref().unwrap_or("reflector"),
                        &screenshot,
                    )
                    .await?;
                }
            }
        }
    }

    /// Quality check plus its bookkeeping. Returns the report if one fired.
    async fn reflect(
        &self,
        task: &mut Task,
        subtask: &Subtask,
        trajectory: &mut Trajectory,
    ) -> Option<QualityReport> {
        let recent: Vec<ActionRecord> = trajectory.recent_actions.iter().cloned().collect();
        let digests: Vec<u64> = trajectory.screenshot_digests.iter().copied().collect();
        let input = ReflectionInput {
            subtask,
            recent_actions: &recent,
            subtask_steps: trajectory.subtask_steps,
            screenshot_digests: &digests,
            steps_since_check: trajectory.steps_since_check,
            grounding_failed: trajectory.grounding_failed,
        };
        let screenshot = self.workspace.latest_screenshot().await.unwrap_or_default();
        let report = self
            .reflector
            .assess(task.id, &input, &screenshot, &self.cancel)
            .await?;

        trajectory.steps_since_check = 0;
        trajectory.last_reflection = Some(summarize_report(&report));
        self.bus.publish(
            Stage::Reflecting,
            summarize_report(&report),
            serde_json::to_value(&report).ok(),
        );
        let _ = self.workspace.append_jsonl("reflections.jsonl", &report).await;
        report.into()
    }

    /// Replace the queue after a failure and reset the trajectory window.
    async fn replan(
        &self,
        task: &mut Task,
        ctx: &PlanningContext,
        trajectory: &mut Trajectory,
        reason: &str,
        screenshot: &[u8],
    ) -> CoreResult<()> {
        self.bus.publish(
            Stage::Replanning,
            format!("Replanning ({reason})"),
            None,
        );
        let outcome = self
            .planner
            .replan(ctx, &task.plan, reason, Some(screenshot), &self.cancel)
            .await?;
        if outcome.degraded {
            self.bus.publish(
                Stage::Replanning,
                "Dependency graph unusable, using linear plan",
                None,
            );
        }
        info!(task_id = %task.id, subtasks = outcome.subtasks.len(), reason, "replanned");
        task.plan.install(outcome.subtasks);
        trajectory.reset_after_replan();
        self.sync_plan(task).await;
        Ok(())
    }

    /// Execute one backend action with timeout and bounded transport retry.
    async fn execute_action(&self, action: &Action) -> CoreResult<ExecOutcome> {
        let timeout = Duration::from_secs(self.config.backend_timeout_secs.max(1));
        let mut attempt = 0;
        loop {
            self.check_cancelled()?;
            let result = tokio::time::timeout(timeout, self.backend.execute(action, &self.cancel))
                .await
                .unwrap_or(Err(BackendError::Timeout(timeout.as_secs())));
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(BackendError::Cancelled) => return Err(CoreError::Cancelled),
                Err(err) if err.is_retryable() && attempt < BACKEND_RETRIES => {
                    warn!(attempt = attempt + 1, error = %err, "transient backend failure, retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(err) => {
                    return Err(CoreError::Transient(format!("backend: {err}")));
                }
            }
        }
    }

    /// Capture the current screen.
    async fn take_screenshot(&self, task: &Task) -> CoreResult<Vec<u8>> {
        let outcome = self.execute_action(&Action::Screenshot).await?;
        match outcome.observation {
            Some(bytes) if !bytes.is_empty() => Ok(bytes),
            _ => Err(CoreError::Transient(format!(
                "backend returned no screenshot for task {}",
                task.id
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_action(
        &self,
        task: &Task,
        subtask: &Subtask,
        action: Action,
        description: String,
        success: bool,
        error: Option<String>,
        screenshot: Option<String>,
    ) -> ActionRecord {
        let record = ActionRecord {
            step: task.stats.steps + 1,
            timestamp: Utc::now(),
            subtask: subtask.name.clone(),
            description,
            action,
            success,
            error,
            screenshot,
        };
        let _ = self.workspace.append_jsonl("actions.jsonl", &record).await;
        self.workspace
            .append_log(&format!(
                "step {} [{}] {} -> {}",
                record.step,
                record.action.kind(),
                record.description,
                if record.success { "ok" } else { "failed" }
            ))
            .await;
        record
    }

    /// Mirror the plan to the store and workspace.
    async fn sync_plan(&self, task: &Task) {
        self.persist(
            task.id,
            TaskPatch {
                plan: Some(task.plan.clone()),
                ..Default::default()
            },
        )
        .await;
        let _ = self.workspace.write_state("plan.json", &task.plan).await;
    }

    async fn persist_stats(&self, task: &mut Task) {
        let (input_tokens, output_tokens, cost) = self.usage.usage();
        task.stats.input_tokens = input_tokens;
        task.stats.output_tokens = output_tokens;
        task.stats.cost = cost;
        self.persist(
            task.id,
            TaskPatch {
                stats: Some(task.stats.clone()),
                ..Default::default()
            },
        )
        .await;
    }

    /// Store writes must not kill a running task; failures are logged and
    /// the durable state catches up on the next write.
    async fn persist(&self, id: Uuid, patch: TaskPatch) {
        if let Err(err) = self.store.update(id, patch).await {
            error!(task_id = %id, error = %err, "state store write failed");
        }
    }

    async fn append_conversation(&self, id: Uuid, messages: Vec<serde_json::Value>) {
        if let Err(err) = self.store.append_conversation(id, messages).await {
            error!(task_id = %id, error = %err, "conversation append failed");
        }
    }

    fn check_cancelled(&self) -> CoreResult<()> {
        if self.cancel.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drive the task into its terminal state: persist, publish the final
    /// event, write the termination marker, release the sandbox.
    async fn finish(&self, task: &mut Task, status: TaskStatus, message: String) {
        if task.status.is_terminal() {
            return;
        }
        if !task.status.can_transition_to(status) {
            error!(task_id = %task.id, from = task.status.as_str(), to = status.as_str(), "refusing invalid terminal transition");
            return;
        }

        task.status = status;
        task.ended_at = Some(Utc::now());
        task.final_message = Some(message.clone());
        let (input_tokens, output_tokens, cost) = self.usage.usage();
        task.stats.input_tokens = input_tokens;
        task.stats.output_tokens = output_tokens;
        task.stats.cost = cost;

        self.persist(
            task.id,
            TaskPatch {
                status: Some(status),
                ended_at: task.ended_at,
                final_message: Some(message.clone()),
                stats: Some(task.stats.clone()),
                plan: Some(task.plan.clone()),
                ..Default::default()
            },
        )
        .await;
        let _ = self
            .workspace
            .write_state(
                "termination.json",
                &json!({
                    "status": status.as_str(),
                    "reason": message.clone(),
                    "ended_at": task.ended_at,
                }),
            )
            .await;

        let stage = match status {
            TaskStatus::Completed => Stage::Finished,
            TaskStatus::Cancelled => Stage::Cancelled,
            _ => Stage::Failed,
        };
        self.bus.publish(stage, message.clone(), None);
        self.workspace
            .append_log(&format!("terminal {}: {}", status.as_str(), message))
            .await;
        info!(task_id = %task.id, status = status.as_str(), steps = task.stats.steps, "task terminal");

        if task.destroy_sandbox_on_exit {
            if let Err(err) = self.backend.release_sandbox().await {
                warn!(task_id = %task.id, error = %err, "sandbox release failed");
            }
        }
        if self.config.cleanup_workspace {
            if let Err(err) = self.workspace.remove().await {
                warn!(task_id = %task.id, error = %err, "workspace cleanup failed");
            }
        }
    }
}

fn summarize_report(report: &QualityReport) -> String {
    let detail = report
        .issues
        .first()
        .or_else(|| report.suggestions.first())
        .cloned()
        .unwrap_or_default();
    if detail.is_empty() {
        format!("quality {:?}, recommend {:?}", report.status, report.recommendation)
    } else {
        format!(
            "quality {:?}, recommend {:?}: {detail}",
            report.status, report.recommendation
        )
    }
}
