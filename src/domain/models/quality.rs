//! Quality reports emitted by the reflector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Good,
    Concerning,
    Critical,
}

impl QualityStatus {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "good" => Some(Self::Good),
            "concerning" => Some(Self::Concerning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Continue,
    Adjust,
    Replan,
}

impl Recommendation {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "continue" => Some(Self::Continue),
            "adjust" => Some(Self::Adjust),
            "replan" => Some(Self::Replan),
            _ => None,
        }
    }
}

/// Outcome of one reflection pass, rule-based or model-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub status: QualityStatus,
    pub recommendation: Recommendation,
    /// Confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// What caused this check to run (e.g. "repeated_action", "periodic")
    #[serde(default)]
    pub trigger: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl QualityReport {
    pub fn new(status: QualityStatus, recommendation: Recommendation, confidence: f64) -> Self {
        Self {
            status,
            recommendation,
            confidence: confidence.clamp(0.0, 1.0),
            issues: Vec::new(),
            suggestions: Vec::new(),
            trigger: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_is_clamped() {
        let report = QualityReport::new(QualityStatus::Good, Recommendation::Continue, 1.7);
        assert_eq!(report.confidence, 1.0);
        let report = QualityReport::new(QualityStatus::Good, Recommendation::Continue, -0.3);
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&Recommendation::Replan).unwrap(),
            "\"replan\""
        );
        assert_eq!(QualityStatus::from_str("CONCERNING"), Some(QualityStatus::Concerning));
    }
}
