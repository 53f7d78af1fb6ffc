//! Tool invoker port.
//!
//! The LLM tool layer (planner models, grounding model, search, ...) lives
//! outside the core. The core calls it through this single-operation
//! interface: a named tool, text input, optional image, text out plus token
//! accounting.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::models::ToolOverride;

/// Closed set of tool names the core may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    WebSearch,
    ContextFusion,
    SubtaskPlanner,
    TrajReflector,
    MemoryRetrieval,
    Grounding,
    Evaluator,
    ActionGenerator,
    ActionGeneratorWithTakeover,
    FastActionGenerator,
    FastActionGeneratorWithTakeover,
    DagTranslator,
    Embedding,
    QueryFormulator,
    NarrativeSummarization,
    TextSpan,
    EpisodeSummarization,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSearch => "web_search",
            Self::ContextFusion => "context_fusion",
            Self::SubtaskPlanner => "subtask_planner",
            Self::TrajReflector => "traj_reflector",
            Self::MemoryRetrieval => "memory_retrieval",
            Self::Grounding => "grounding",
            Self::Evaluator => "evaluator",
            Self::ActionGenerator => "action_generator",
            Self::ActionGeneratorWithTakeover => "action_generator_with_takeover",
            Self::FastActionGenerator => "fast_action_generator",
            Self::FastActionGeneratorWithTakeover => "fast_action_generator_with_takeover",
            Self::DagTranslator => "dag_translator",
            Self::Embedding => "embedding",
            Self::QueryFormulator => "query_formulator",
            Self::NarrativeSummarization => "narrative_summarization",
            Self::TextSpan => "text_span",
            Self::EpisodeSummarization => "episode_summarization",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "web_search" => Some(Self::WebSearch),
            "context_fusion" => Some(Self::ContextFusion),
            "subtask_planner" => Some(Self::SubtaskPlanner),
            "traj_reflector" => Some(Self::TrajReflector),
            "memory_retrieval" => Some(Self::MemoryRetrieval),
            "grounding" => Some(Self::Grounding),
            "evaluator" => Some(Self::Evaluator),
            "action_generator" => Some(Self::ActionGenerator),
            "action_generator_with_takeover" => Some(Self::ActionGeneratorWithTakeover),
            "fast_action_generator" => Some(Self::FastActionGenerator),
            "fast_action_generator_with_takeover" => Some(Self::FastActionGeneratorWithTakeover),
            "dag_translator" => Some(Self::DagTranslator),
            "embedding" => Some(Self::Embedding),
            "query_formulator" => Some(Self::QueryFormulator),
            "narrative_summarization" => Some(Self::NarrativeSummarization),
            "text_span" => Some(Self::TextSpan),
            "episode_summarization" => Some(Self::EpisodeSummarization),
            _ => None,
        }
    }

    pub const ALL: [ToolName; 17] = [
        Self::WebSearch,
        Self::ContextFusion,
        Self::SubtaskPlanner,
        Self::TrajReflector,
        Self::MemoryRetrieval,
        Self::Grounding,
        Self::Evaluator,
        Self::ActionGenerator,
        Self::ActionGeneratorWithTakeover,
        Self::FastActionGenerator,
        Self::FastActionGeneratorWithTakeover,
        Self::DagTranslator,
        Self::Embedding,
        Self::QueryFormulator,
        Self::NarrativeSummarization,
        Self::TextSpan,
        Self::EpisodeSummarization,
    ];
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: ToolName,
    /// Calling task, for accounting
    pub task_id: Uuid,
    pub text: String,
    /// Raw image bytes; encoding is the invoker's concern
    pub image: Option<Vec<u8>>,
    /// Per-run provider/model override, forwarded opaquely
    pub overrides: Option<ToolOverride>,
}

impl ToolCall {
    pub fn new(tool: ToolName, task_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            tool,
            task_id,
            text: text.into(),
            image: None,
            overrides: None,
        }
    }

    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_overrides(mut self, overrides: ToolOverride) -> Self {
        self.overrides = Some(overrides);
        self
    }
}

/// Tool output with token accounting.
#[derive(Debug, Clone, Default)]
pub struct ToolResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    Timeout,
    RateLimited,
    Provider,
    InvalidResponse,
    BudgetExhausted,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Provider => "provider",
            Self::InvalidResponse => "invalid_response",
            Self::BudgetExhausted => "budget_exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("tool error ({kind}): {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl ToolError {
    pub fn timeout(secs: u64) -> Self {
        Self {
            kind: ToolErrorKind::Timeout,
            retryable: true,
            message: format!("no response after {secs}s"),
        }
    }

    pub fn provider(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: ToolErrorKind::Provider,
            retryable,
            message: message.into(),
        }
    }

    pub fn budget(message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::BudgetExhausted,
            retryable: false,
            message: message.into(),
        }
    }
}

/// Executes named tools. Implementations own prompt templates, provider
/// routing and image encoding.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        call: ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResponse, ToolError>;
}
