//! Reflector: evaluates execution quality and recommends course changes.
//!
//! A rule-based fast path runs before any model call: repeated actions,
//! oversized subtasks and a frozen screen are detectable for free. Only the
//! periodic check spends tokens, and a budget failure downgrades to
//! skipping the model rather than stopping the task.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::models::{
    ActionRecord, QualityReport, QualityStatus, Recommendation, Subtask,
};
use crate::domain::ports::{ToolCall, ToolErrorKind, ToolInvoker, ToolName};
use crate::services::tooling::invoke_with_retry;

/// Consecutive identical actions that trigger a concern.
const REPEATED_ACTION_THRESHOLD: usize = 3;
/// Steps on one subtask before recommending a replan.
const SUBTASK_STEP_THRESHOLD: u32 = 10;
/// Consecutive identical screenshots that signal a stalled UI.
const FROZEN_SCREEN_THRESHOLD: usize = 3;

/// Per-step inputs, assembled by the dispatcher.
pub struct ReflectionInput<'a> {
    pub subtask: &'a Subtask,
    /// Most recent actions, oldest first (the dispatcher passes up to 5)
    pub recent_actions: &'a [ActionRecord],
    /// Steps spent on the current subtask
    pub subtask_steps: u32,
    /// Digests of recent screenshots, oldest first
    pub screenshot_digests: &'a [u64],
    /// Steps since the last model-based check
    pub steps_since_check: u32,
    /// Grounding failed on the step being reflected on
    pub grounding_failed: bool,
}

pub struct Reflector {
    invoker: Arc<dyn ToolInvoker>,
    /// Model check cadence in steps
    interval: u32,
}

impl Reflector {
    pub fn new(invoker: Arc<dyn ToolInvoker>, interval: u32) -> Self {
        Self {
            invoker,
            interval: interval.max(1),
        }
    }

    /// Stable digest of screenshot bytes for stall detection.
    pub fn screenshot_digest(image: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        image.hash(&mut hasher);
        hasher.finish()
    }

    /// Assess the trajectory. Returns `None` when nothing triggered.
    pub async fn assess(
        &self,
        task_id: Uuid,
        input: &ReflectionInput<'_>,
        screenshot: &[u8],
        cancel: &CancellationToken,
    ) -> Option<QualityReport> {
        if let Some(report) = rule_based_report(input) {
            return Some(report);
        }

        if input.steps_since_check < self.interval {
            return None;
        }
        self.model_report(task_id, input, screenshot, cancel).await
    }

    /// Ask the trajectory reflector for a semantic judgment. Budget
    /// exhaustion is recorded as a quality issue rather than an error.
    async fn model_report(
        &self,
        task_id: Uuid,
        input: &ReflectionInput<'_>,
        screenshot: &[u8],
        cancel: &CancellationToken,
    ) -> Option<QualityReport> {
        let trail: String = input
            .recent_actions
            .iter()
            .map(|r| {
                format!(
                    "- step {} [{}] {} -> {}\n",
                    r.step,
                    r.action.kind(),
                    r.description,
                    if r.success { "ok" } else { "failed" }
                )
            })
            .collect();

        let prompt = format!(
            "Current subtask: {} ({})\nRecent actions:\n{}\n\
             Judge the trajectory. Answer as JSON: {{\"status\": good|concerning|critical, \
             \"recommendation\": continue|adjust|replan, \"confidence\": 0.0-1.0, \
             \"issues\": [], \"suggestions\": []}}",
            input.subtask.name, input.subtask.info, trail
        );

        let call = ToolCall::new(ToolName::TrajReflector, task_id, prompt)
            .with_image(screenshot.to_vec());

        match invoke_with_retry(self.invoker.as_ref(), call, cancel).await {
            Ok(response) => Some(
                parse_model_report(&response.text)
                    .unwrap_or_else(|| {
                        debug!(task_id = %task_id, "unparseable reflector output, assuming good");
                        QualityReport::new(QualityStatus::Good, Recommendation::Continue, 0.3)
                    })
                    .with_trigger("periodic"),
            ),
            Err(err) if err.kind == ToolErrorKind::BudgetExhausted => {
                warn!(task_id = %task_id, "reflector budget exhausted, skipping model check");
                Some(
                    QualityReport::new(QualityStatus::Good, Recommendation::Continue, 0.1)
                        .with_trigger("periodic")
                        .with_issue("reflector skipped: tool budget exhausted"),
                )
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "reflector call failed, continuing");
                None
            }
        }
    }
}

/// Free checks on the trajectory; the first hit wins.
fn rule_based_report(input: &ReflectionInput<'_>) -> Option<QualityReport> {
    // Identical actions repeated back to back.
    if input.recent_actions.len() >= REPEATED_ACTION_THRESHOLD {
        let tail = &input.recent_actions[input.recent_actions.len() - REPEATED_ACTION_THRESHOLD..];
        let first = &tail[0].action;
        if tail.iter().all(|r| &r.action == first) {
            return Some(
                QualityReport::new(QualityStatus::Concerning, Recommendation::Adjust, 0.9)
                    .with_trigger("repeated_action")
                    .with_issue(format!(
                        "the last {REPEATED_ACTION_THRESHOLD} actions were identical ({})",
                        first.kind()
                    ))
                    .with_suggestion("try a different approach to the current subtask"),
            );
        }
    }

    // One subtask eating the step budget.
    if input.subtask_steps > SUBTASK_STEP_THRESHOLD {
        return Some(
            QualityReport::new(QualityStatus::Concerning, Recommendation::Replan, 0.8)
                .with_trigger("excessive_steps")
                .with_issue(format!(
                    "{} steps spent on subtask {}",
                    input.subtask_steps, input.subtask.name
                ))
                .with_suggestion("break the subtask down"),
        );
    }

    // Screen frozen across consecutive steps.
    if input.screenshot_digests.len() >= FROZEN_SCREEN_THRESHOLD {
        let tail = &input.screenshot_digests[input.screenshot_digests.len() - FROZEN_SCREEN_THRESHOLD..];
        if tail.windows(2).all(|w| w[0] == w[1]) {
            return Some(
                QualityReport::new(QualityStatus::Concerning, Recommendation::Adjust, 0.7)
                    .with_trigger("frozen_screen")
                    .with_issue("the screen has not changed for several steps")
                    .with_suggestion("verify the actions are reaching the device"),
            );
        }
    }

    if input.grounding_failed {
        return Some(
            QualityReport::new(QualityStatus::Concerning, Recommendation::Adjust, 0.6)
                .with_trigger("grounding_failure")
                .with_issue("element grounding failed on the last step"),
        );
    }

    None
}

/// Parse the model's JSON report defensively.
fn parse_model_report(text: &str) -> Option<QualityReport> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    let value: serde_json::Value = serde_json::from_str(&text[start..=end]).ok()?;

    let status = value
        .get("status")
        .and_then(|v| v.as_str())
        .and_then(QualityStatus::from_str)?;
    let recommendation = value
        .get("recommendation")
        .and_then(|v| v.as_str())
        .and_then(Recommendation::from_str)
        .unwrap_or(Recommendation::Continue);
    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.5);

    let mut report = QualityReport::new(status, recommendation, confidence);
    if let Some(issues) = value.get("issues").and_then(|v| v.as_array()) {
        for issue in issues {
            if let Some(issue) = issue.as_str() {
                report.issues.push(issue.to_string());
            }
        }
    }
    if let Some(suggestions) = value.get("suggestions").and_then(|v| v.as_array()) {
        for suggestion in suggestions {
            if let Some(suggestion) = suggestion.as_str() {
                report.suggestions.push(suggestion.to_string());
            }
        }
    }
    Some(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Action;
    use chrono::Utc;

    fn record(step: u32, action: Action) -> ActionRecord {
        ActionRecord {
            step,
            timestamp: Utc::now(),
            subtask: "S".into(),
            description: "d".into(),
            action,
            success: true,
            error: None,
            screenshot: None,
        }
    }

    fn subtask() -> Subtask {
        Subtask::new("S", "do the thing")
    }

    #[test]
    fn test_repeated_actions_trigger_adjust() {
        let click = Action::Click {
            xy: [10, 10],
            button: Default::default(),
            count: 1,
            hold_keys: vec![],
        };
        let records = vec![
            record(1, click.clone()),
            record(2, click.clone()),
            record(3, click.clone()),
        ];
        let binding = subtask();
        let input = ReflectionInput {
            subtask: &binding,
            recent_actions: &records,
            subtask_steps: 3,
            screenshot_digests: &[1, 2, 3],
            steps_since_check: 0,
            grounding_failed: false,
        };
        let report = rule_based_report(&input).unwrap();
        assert_eq!(report.status, QualityStatus::Concerning);
        assert_eq!(report.recommendation, Recommendation::Adjust);
        assert_eq!(report.trigger.as_deref(), Some("repeated_action"));
    }

    #[test]
    fn test_excessive_subtask_steps_trigger_replan() {
        let records = vec![record(1, Action::Screenshot)];
        let binding = subtask();
        let input = ReflectionInput {
            subtask: &binding,
            recent_actions: &records,
            subtask_steps: 11,
            screenshot_digests: &[1, 2, 3],
            steps_since_check: 0,
            grounding_failed: false,
        };
        let report = rule_based_report(&input).unwrap();
        assert_eq!(report.recommendation, Recommendation::Replan);
    }

    #[test]
    fn test_frozen_screen_detected() {
        let records = vec![record(1, Action::Screenshot)];
        let binding = subtask();
        let input = ReflectionInput {
            subtask: &binding,
            recent_actions: &records,
            subtask_steps: 1,
            screenshot_digests: &[7, 7, 7],
            steps_since_check: 0,
            grounding_failed: false,
        };
        let report = rule_based_report(&input).unwrap();
        assert_eq!(report.trigger.as_deref(), Some("frozen_screen"));
    }

    #[test]
    fn test_healthy_trajectory_yields_nothing() {
        let records = vec![
            record(1, Action::Screenshot),
            record(
                2,
                Action::Type {
                    text: "hi".into(),
                    xy: None,
                    overwrite: false,
                    press_enter: false,
                },
            ),
        ];
        let binding = subtask();
        let input = ReflectionInput {
            subtask: &binding,
            recent_actions: &records,
            subtask_steps: 2,
            screenshot_digests: &[1, 2, 3],
            steps_since_check: 1,
            grounding_failed: false,
        };
        assert!(rule_based_report(&input).is_none());
    }

    #[test]
    fn test_digest_is_stable_and_sensitive() {
        let a = Reflector::screenshot_digest(b"frame one");
        let b = Reflector::screenshot_digest(b"frame one");
        let c = Reflector::screenshot_digest(b"frame two");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_parse_model_report() {
        let text = "Assessment follows. {\"status\": \"concerning\", \"recommendation\": \"replan\", \"confidence\": 0.8, \"issues\": [\"stuck\"], \"suggestions\": [\"replan\"]}";
        let report = parse_model_report(text).unwrap();
        assert_eq!(report.status, QualityStatus::Concerning);
        assert_eq!(report.recommendation, Recommendation::Replan);
        assert_eq!(report.issues, vec!["stuck"]);
        assert!(parse_model_report("garbage").is_none());
    }
}
