//! Worker: produces the next concrete action for the current subtask.
//!
//! One step is two tool calls: the action generator proposes a high-level
//! plan ending in a pseudocode call like `click("the File menu", 1,
//! "left")`, and the grounding model resolves element descriptions to
//! pixel coordinates. Subtask completion flows back as a tagged decision
//! (`Done` / `Fail`), never as an error path.

use std::sync::Arc;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{Action, MouseButton, Plan, Subtask, TaskMode};
use crate::domain::ports::{ToolCall, ToolInvoker, ToolName};
use crate::services::tooling::invoke_with_retry;

/// What the worker wants the dispatcher to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerDecision {
    /// The current subtask is complete
    Done { return_value: Option<serde_json::Value> },
    /// The current subtask cannot be completed; replan
    Fail,
    /// Hand control to a human before continuing
    Takeover { message: String },
    /// Execute this device action
    Act { action: Action, description: String },
}

/// One worker step with its provenance.
#[derive(Debug, Clone)]
pub struct WorkerStep {
    pub decision: WorkerDecision,
    /// Raw generator output, for the conversation trail
    pub raw_plan: String,
    /// True when grounding failed and the action degraded to a wait
    pub grounding_failed: bool,
}

/// Inputs the dispatcher passes per step; the worker holds no task state.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub task_id: Uuid,
    pub instruction: String,
    pub mode: TaskMode,
    pub enable_takeover: bool,
    /// Actual screenshot dimensions, used for coordinate validation
    pub screen: (u32, u32),
}

pub struct Worker {
    invoker: Arc<dyn ToolInvoker>,
}

impl Worker {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }

    fn generator_tool(mode: TaskMode, enable_takeover: bool) -> ToolName {
        match (mode, enable_takeover) {
            (TaskMode::Normal, false) => ToolName::ActionGenerator,
            (TaskMode::Normal, true) => ToolName::ActionGeneratorWithTakeover,
            (TaskMode::Fast, false) => ToolName::FastActionGenerator,
            (TaskMode::Fast, true) => ToolName::FastActionGeneratorWithTakeover,
        }
    }

    /// Produce the next action for `subtask` given the current screenshot.
    pub async fn next_action(
        &self,
        ctx: &WorkerContext,
        subtask: &Subtask,
        plan: &Plan,
        screenshot: &[u8],
        reflection: Option<&str>,
        cancel: &CancellationToken,
    ) -> CoreResult<WorkerStep> {
        let message = compose_generator_message(ctx, subtask, plan, reflection);
        let call = ToolCall::new(Self::generator_tool(ctx.mode, ctx.enable_takeover), ctx.task_id, message)
            .with_image(screenshot.to_vec());

        let response = invoke_with_retry(self.invoker.as_ref(), call, cancel)
            .await
            .map_err(|e| CoreError::Transient(format!("action_generator: {e}")))?;

        let raw_plan = response.text;
        let parsed = match parse_pseudocode(&raw_plan) {
            Some(parsed) => parsed,
            None => {
                warn!(task_id = %ctx.task_id, "no parseable action in generator output, waiting one step");
                return Ok(WorkerStep {
                    decision: WorkerDecision::Act {
                        action: Action::Wait { seconds: 1.0 },
                        description: "unparseable generator output".to_string(),
                    },
                    raw_plan,
                    grounding_failed: true,
                });
            }
        };

        let (decision, grounding_failed) = self
            .resolve_call(ctx, parsed, screenshot, cancel)
            .await;

        Ok(WorkerStep {
            decision,
            raw_plan,
            grounding_failed,
        })
    }

    /// Turn a parsed pseudocode call into a decision, grounding element
    /// descriptions to coordinates where needed. Grounding failures degrade
    /// to a one-second wait so the reflector can see the stall.
    async fn resolve_call(
        &self,
        ctx: &WorkerContext,
        call: PseudoCall,
        screenshot: &[u8],
        cancel: &CancellationToken,
    ) -> (WorkerDecision, bool) {
        let degraded = |description: String| WorkerDecision::Act {
            action: Action::Wait { seconds: 1.0 },
            description,
        };

        match call.name.as_str() {
            "done" => (
                WorkerDecision::Done {
                    return_value: call.args.first().map(PseudoArg::to_json),
                },
                false,
            ),
            "fail" => (WorkerDecision::Fail, false),
            "takeover" | "user_takeover" => (
                WorkerDecision::Takeover {
                    message: call
                        .args
                        .first()
                        .map(|a| a.as_text())
                        .unwrap_or_else(|| "user intervention requested".to_string()),
                },
                false,
            ),
            "wait" => {
                let seconds = call.args.first().and_then(PseudoArg::as_f64).unwrap_or(1.0);
                (
                    WorkerDecision::Act {
                        action: Action::Wait { seconds },
                        description: format!("wait {seconds}s"),
                    },
                    false,
                )
            }
            "click" => {
                let element = call.args.first().map(|a| a.as_text()).unwrap_or_default();
                let count = call.args.get(1).and_then(PseudoArg::as_i64).unwrap_or(1) as u8;
                let button = call
                    .args
                    .get(2)
                    .and_then(|a| MouseButton::from_str(&a.as_text()))
                    .unwrap_or_default();
                let hold_keys = call.args.get(3).map(PseudoArg::as_list).unwrap_or_default();
                match self.ground(ctx, &element, screenshot, cancel).await {
                    Some(xy) => (
                        WorkerDecision::Act {
                            action: Action::Click {
                                xy,
                                button,
                                count: count.clamp(1, 3),
                                hold_keys,
                            },
                            description: format!("click {element}"),
                        },
                        false,
                    ),
                    None => (degraded(format!("grounding failed for {element}")), true),
                }
            }
            "type" | "type_text" => {
                let text = call.args.first().map(|a| a.as_text()).unwrap_or_default();
                let press_enter = call.flag("enter") || call.flag("press_enter");
                let overwrite = call.flag("overwrite");
                let element = call.kwarg("element").map(|a| a.as_text());
                let xy = match element {
                    Some(ref element) if !element.is_empty() => {
                        match self.ground(ctx, element, screenshot, cancel).await {
                            Some(xy) => Some(xy),
                            None => {
                                return (degraded(format!("grounding failed for {element}")), true)
                            }
                        }
                    }
                    _ => None,
                };
                (
                    WorkerDecision::Act {
                        action: Action::Type {
                            text: text.clone(),
                            xy,
                            overwrite,
                            press_enter,
                        },
                        description: format!("type {text:?}"),
                    },
                    false,
                )
            }
            "scroll" => {
                let element = call.args.first().map(|a| a.as_text()).unwrap_or_default();
                let clicks = call.args.get(1).and_then(PseudoArg::as_i64).unwrap_or(-3) as i32;
                let vertical = call
                    .args
                    .get(2)
                    .and_then(PseudoArg::as_bool)
                    .unwrap_or(true);
                match self.ground(ctx, &element, screenshot, cancel).await {
                    Some(xy) => (
                        WorkerDecision::Act {
                            action: Action::Scroll {
                                xy,
                                clicks,
                                vertical,
                            },
                            description: format!("scroll {clicks} at {element}"),
                        },
                        false,
                    ),
                    None => (degraded(format!("grounding failed for {element}")), true),
                }
            }
            "drag" => {
                let from = call.args.first().map(|a| a.as_text()).unwrap_or_default();
                let to = call.args.get(1).map(|a| a.as_text()).unwrap_or_default();
                let hold_keys = call.args.get(2).map(PseudoArg::as_list).unwrap_or_default();
                let start = self.ground(ctx, &from, screenshot, cancel).await;
                let end = self.ground(ctx, &to, screenshot, cancel).await;
                match (start, end) {
                    (Some(start), Some(end)) => (
                        WorkerDecision::Act {
                            action: Action::Drag {
                                start,
                                end,
                                hold_keys,
                            },
                            description: format!("drag {from} to {to}"),
                        },
                        false,
                    ),
                    _ => (degraded(format!("grounding failed for drag {from} -> {to}")), true),
                }
            }
            "hotkey" => {
                let keys: Vec<String> = if call.args.len() == 1 {
                    let list = call.args[0].as_list();
                    if list.is_empty() {
                        vec![call.args[0].as_text()]
                    } else {
                        list
                    }
                } else {
                    call.args.iter().map(|a| a.as_text()).collect()
                };
                (
                    WorkerDecision::Act {
                        action: Action::Hotkey { keys: keys.clone() },
                        description: format!("hotkey {}", keys.join("+")),
                    },
                    false,
                )
            }
            "hold_and_press" => {
                let hold_keys = call.args.first().map(PseudoArg::as_list).unwrap_or_default();
                let press_keys = call.args.get(1).map(PseudoArg::as_list).unwrap_or_default();
                (
                    WorkerDecision::Act {
                        action: Action::HoldAndPress {
                            hold_keys,
                            press_keys,
                        },
                        description: "hold and press keys".to_string(),
                    },
                    false,
                )
            }
            "open" => {
                let target = call.args.first().map(|a| a.as_text()).unwrap_or_default();
                (
                    WorkerDecision::Act {
                        action: Action::Open {
                            app_or_filename: target.clone(),
                        },
                        description: format!("open {target}"),
                    },
                    false,
                )
            }
            "switch_app" | "switch_applications" => {
                let code = call.args.first().map(|a| a.as_text()).unwrap_or_default();
                (
                    WorkerDecision::Act {
                        action: Action::SwitchApp {
                            app_code: code.clone(),
                        },
                        description: format!("switch to {code}"),
                    },
                    false,
                )
            }
            other => {
                warn!(task_id = %ctx.task_id, call = other, "unknown pseudocode call, waiting one step");
                (degraded(format!("unknown call {other}")), true)
            }
        }
    }

    /// Resolve an element description to integer coordinates within the
    /// screenshot bounds. Out-of-bounds or unparseable output is a
    /// grounding failure.
    async fn ground(
        &self,
        ctx: &WorkerContext,
        element: &str,
        screenshot: &[u8],
        cancel: &CancellationToken,
    ) -> Option<[i32; 2]> {
        if element.trim().is_empty() {
            return None;
        }
        let call = ToolCall::new(
            ToolName::Grounding,
            ctx.task_id,
            format!("Locate this element and answer with (x, y) pixel coordinates: {element}"),
        )
        .with_image(screenshot.to_vec());

        let response = match invoke_with_retry(self.invoker.as_ref(), call, cancel).await {
            Ok(response) => response,
            Err(err) => {
                warn!(task_id = %ctx.task_id, error = %err, "grounding call failed");
                return None;
            }
        };

        let xy = parse_coordinates(&response.text)?;
        let (w, h) = ctx.screen;
        if xy[0] < 0 || xy[1] < 0 || xy[0] >= w as i32 || xy[1] >= h as i32 {
            warn!(task_id = %ctx.task_id, x = xy[0], y = xy[1], "grounded coordinates out of bounds");
            return None;
        }
        debug!(task_id = %ctx.task_id, x = xy[0], y = xy[1], element, "grounded element");
        Some(xy)
    }
}

/// Build the generator user message from the task context.
fn compose_generator_message(
    ctx: &WorkerContext,
    subtask: &Subtask,
    plan: &Plan,
    reflection: Option<&str>,
) -> String {
    let names = |subtasks: &[Subtask]| -> String {
        if subtasks.is_empty() {
            return "None".to_string();
        }
        subtasks
            .iter()
            .map(|s| format!("- {}: {}", s.name, s.info))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut message = format!(
        "SUBTASK_DESCRIPTION is name: {}, info: {}\n\nTASK_DESCRIPTION is {}\n\n\
         FUTURE_TASKS:\n{}\n\nDONE_TASKS:\n{}\n\n\
         Remember only complete the subtask: {}\n",
        subtask.name,
        subtask.info,
        ctx.instruction,
        names(&plan.remaining),
        names(&plan.completed),
        subtask.name,
    );
    if let Some(reflection) = reflection {
        message.push_str(&format!(
            "\nYou may use this reflection on the previous step: {reflection}\n"
        ));
    }
    message
}

/// A parsed pseudocode invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PseudoCall {
    pub name: String,
    pub args: Vec<PseudoArg>,
    pub kwargs: Vec<(String, PseudoArg)>,
}

impl PseudoCall {
    fn kwarg(&self, key: &str) -> Option<&PseudoArg> {
        self.kwargs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn flag(&self, key: &str) -> bool {
        self.kwarg(key)
            .and_then(PseudoArg::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PseudoArg {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<String>),
}

impl PseudoArg {
    fn as_text(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::List(items) => items.join(","),
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) => Some(*f as i64),
            Self::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Str(s) => match s.to_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_list(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.clone(),
            Self::Str(s) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Bool(b) => serde_json::Value::from(*b),
            Self::List(items) => serde_json::Value::from(items.clone()),
        }
    }
}

/// Find the first pseudocode call in generator output. The call may sit in
/// a code fence, after a "Grounded Action" header, or inline.
pub fn parse_pseudocode(text: &str) -> Option<PseudoCall> {
    // Prefer the section after the last "Grounded Action" header when present.
    let section = match text.rfind("Grounded Action") {
        Some(idx) => &text[idx..],
        None => text,
    };
    let call_re = Regex::new(
        r"(?m)\b(click|type_text|type|scroll|drag|hotkey|hold_and_press|open|switch_app|switch_applications|wait|done|fail|takeover|user_takeover)\s*\(",
    )
    .unwrap();

    let m = call_re.find(section)?;
    let name_end = section[m.start()..].find('(')? + m.start();
    let name = section[m.start()..name_end].trim().to_string();

    let args_text = balanced_args(&section[name_end..])?;
    let (args, kwargs) = parse_args(&args_text);
    Some(PseudoCall { name, args, kwargs })
}

/// Extract the argument text between the balanced outer parentheses,
/// honoring quotes.
fn balanced_args(text: &str) -> Option<String> {
    let mut depth = 0i32;
    let mut in_str: Option<char> = None;
    let mut start = None;
    for (i, c) in text.char_indices() {
        match in_str {
            Some(quote) => {
                if c == quote {
                    in_str = None;
                }
            }
            None => match c {
                '"' | '\'' => in_str = Some(c),
                '(' => {
                    if depth == 0 {
                        start = Some(i + 1);
                    }
                    depth += 1;
                }
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(text[start?..i].to_string());
                    }
                }
                _ => {}
            },
        }
    }
    None
}

/// Split the argument text on top-level commas and classify each value.
fn parse_args(text: &str) -> (Vec<PseudoArg>, Vec<(String, PseudoArg)>) {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_str: Option<char> = None;
    let mut current = String::new();
    for c in text.chars() {
        match in_str {
            Some(quote) => {
                current.push(c);
                if c == quote {
                    in_str = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    in_str = Some(c);
                    current.push(c);
                }
                '[' | '(' => {
                    depth += 1;
                    current.push(c);
                }
                ']' | ')' => {
                    depth -= 1;
                    current.push(c);
                }
                ',' if depth == 0 => {
                    parts.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }

    let mut args = Vec::new();
    let mut kwargs = Vec::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        // key=value, where the key is a bare identifier
        if let Some(eq) = part.find('=') {
            let key = part[..eq].trim();
            if !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                kwargs.push((key.to_string(), classify_value(part[eq + 1..].trim())));
                continue;
            }
        }
        args.push(classify_value(part));
    }
    (args, kwargs)
}

fn classify_value(value: &str) -> PseudoArg {
    let value = value.trim();
    if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
        || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
    {
        return PseudoArg::Str(value[1..value.len() - 1].to_string());
    }
    if value.starts_with('[') && value.ends_with(']') {
        let items = value[1..value.len() - 1]
            .split(',')
            .map(|s| s.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .filter(|s| !s.is_empty())
            .collect();
        return PseudoArg::List(items);
    }
    match value.to_lowercase().as_str() {
        "true" => return PseudoArg::Bool(true),
        "false" => return PseudoArg::Bool(false),
        _ => {}
    }
    if let Ok(i) = value.parse::<i64>() {
        return PseudoArg::Int(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return PseudoArg::Float(f);
    }
    PseudoArg::Str(value.to_string())
}

/// Parse "(x, y)" style coordinates from grounding output; the first two
/// integers found win.
pub fn parse_coordinates(text: &str) -> Option<[i32; 2]> {
    let re = Regex::new(r"(-?\d+)\s*[,;]\s*(?:y\s*=\s*)?(-?\d+)").unwrap();
    let caps = re.captures(text)?;
    let x = caps[1].parse::<i32>().ok()?;
    let y = caps[2].parse::<i32>().ok()?;
    Some([x, y])
}
