//! Planner: turns an instruction plus observation into an ordered subtask
//! queue.
//!
//! Two tool calls per plan: the subtask planner produces an ordered textual
//! plan, the DAG translator turns it into a dependency graph. The graph is
//! topologically sorted (Kahn), ties broken by the order nodes appeared in
//! the textual plan, so identical inputs give identical queues. Malformed
//! or cyclic graphs degrade to the linear plan order; a parse failure never
//! aborts the task.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{Plan, PlanGraph, Subtask};
use crate::domain::ports::{ToolCall, ToolInvoker, ToolName};
use crate::services::tooling::invoke_with_retry;

/// Outcome of one planning pass.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub subtasks: Vec<Subtask>,
    /// True when the DAG was unusable and the linear order was kept
    pub degraded: bool,
    /// Knowledge text retrieved for the first plan, when search is enabled
    pub knowledge: Option<String>,
}

/// Context the dispatcher hands to each planning call. Components never
/// hold references to one another; this value is the only coupling.
#[derive(Debug, Clone)]
pub struct PlanningContext {
    pub task_id: Uuid,
    pub instruction: String,
    pub enable_search: bool,
}

pub struct Planner {
    invoker: Arc<dyn ToolInvoker>,
}

impl Planner {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }

    /// Produce the first plan for a task.
    pub async fn initial_plan(
        &self,
        ctx: &PlanningContext,
        observation: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> CoreResult<PlanOutcome> {
        let knowledge = if ctx.enable_search {
            self.retrieve_knowledge(ctx, cancel).await
        } else {
            None
        };

        let mut prompt = format!("TASK_DESCRIPTION is {}", ctx.instruction);
        if let Some(ref knowledge) = knowledge {
            prompt.push_str(&format!(
                "\nYou may refer to some retrieved knowledge if you think it is useful.\n{knowledge}"
            ));
        }
        prompt.push_str("\n\nProduce an ordered plan of subtasks, one per line, as `N. Name: description`.");

        let (subtasks, degraded) = self.plan_with_dag(ctx, prompt, observation, cancel).await?;
        Ok(PlanOutcome {
            subtasks,
            degraded,
            knowledge,
        })
    }

    /// Produce a fresh queue after a failure, framed with progress context.
    pub async fn replan(
        &self,
        ctx: &PlanningContext,
        plan: &Plan,
        reason: &str,
        observation: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> CoreResult<PlanOutcome> {
        let format_list = |subtasks: &[Subtask]| -> String {
            if subtasks.is_empty() {
                return "None".to_string();
            }
            subtasks
                .iter()
                .map(|s| format!("- {}: {}", s.name, s.info))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = format!(
            "TASK_DESCRIPTION is {}\n\nThe current plan ran into trouble ({reason}).\n\
             COMPLETED_SUBTASKS:\n{}\n\nFAILED_SUBTASKS:\n{}\n\nREMAINING_SUBTASKS:\n{}\n\n\
             Produce a revised ordered plan for the remaining work, one per line, as `N. Name: description`.",
            ctx.instruction,
            format_list(&plan.completed),
            format_list(&plan.failed),
            format_list(&plan.remaining),
        );

        let (subtasks, degraded) = self.plan_with_dag(ctx, prompt, observation, cancel).await?;
        Ok(PlanOutcome {
            subtasks,
            degraded,
            knowledge: None,
        })
    }

    async fn plan_with_dag(
        &self,
        ctx: &PlanningContext,
        prompt: String,
        observation: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> CoreResult<(Vec<Subtask>, bool)> {
        let mut call = ToolCall::new(ToolName::SubtaskPlanner, ctx.task_id, prompt);
        if let Some(observation) = observation {
            call = call.with_image(observation.to_vec());
        }
        let response = invoke_with_retry(self.invoker.as_ref(), call, cancel)
            .await
            .map_err(|e| CoreError::Transient(format!("subtask_planner: {e}")))?;

        let linear = parse_textual_plan(&response.text);
        if linear.is_empty() {
            return Err(CoreError::Fatal(
                "planner produced no parseable subtasks".to_string(),
            ));
        }

        let dag_call = ToolCall::new(
            ToolName::DagTranslator,
            ctx.task_id,
            format!(
                "Translate this plan into a JSON dependency graph \
                 {{\"nodes\": [{{\"name\", \"info\"}}], \"edges\": [[\"from\", \"to\"]]}}:\n{}",
                response.text
            ),
        );

        match invoke_with_retry(self.invoker.as_ref(), dag_call, cancel).await {
            Ok(dag_response) => match parse_graph(&dag_response.text) {
                Some(graph) => match topological_order(&graph, &linear) {
                    Some(ordered) => {
                        info!(task_id = %ctx.task_id, subtasks = ordered.len(), "plan ordered from dependency graph");
                        Ok((ordered, false))
                    }
                    None => {
                        warn!(task_id = %ctx.task_id, "dependency graph is cyclic, keeping linear plan order");
                        Ok((linear, true))
                    }
                },
                None => {
                    warn!(task_id = %ctx.task_id, "dag translator output unparseable, keeping linear plan order");
                    Ok((linear, true))
                }
            },
            Err(err) => {
                warn!(task_id = %ctx.task_id, error = %err, "dag translator failed, keeping linear plan order");
                Ok((linear, true))
            }
        }
    }

    /// First-plan knowledge retrieval: formulate a query, search the web,
    /// fuse the results. Any failure just means planning without knowledge.
    async fn retrieve_knowledge(
        &self,
        ctx: &PlanningContext,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let query_call = ToolCall::new(
            ToolName::QueryFormulator,
            ctx.task_id,
            format!("Formulate a web search query for: {}", ctx.instruction),
        );
        let query = match invoke_with_retry(self.invoker.as_ref(), query_call, cancel).await {
            Ok(response) => response.text,
            Err(err) => {
                warn!(task_id = %ctx.task_id, error = %err, "query formulation failed, planning without search");
                return None;
            }
        };

        let search_call = ToolCall::new(ToolName::WebSearch, ctx.task_id, query.clone());
        let results = match invoke_with_retry(self.invoker.as_ref(), search_call, cancel).await {
            Ok(response) => response.text,
            Err(err) => {
                warn!(task_id = %ctx.task_id, error = %err, "web search failed, planning without search");
                return None;
            }
        };

        let fusion_call = ToolCall::new(
            ToolName::ContextFusion,
            ctx.task_id,
            format!(
                "Instruction: {}\nSearch query: {query}\nResults:\n{results}\n\
                 Fuse the useful knowledge into a short brief.",
                ctx.instruction
            ),
        );
        match invoke_with_retry(self.invoker.as_ref(), fusion_call, cancel).await {
            Ok(response) if !response.text.trim().is_empty() => Some(response.text),
            Ok(_) => None,
            Err(err) => {
                warn!(task_id = %ctx.task_id, error = %err, "context fusion failed, using raw search results");
                Some(results)
            }
        }
    }
}

/// Parse an ordered textual plan: numbered lines of `Name: description`.
/// Markdown bold around the name is tolerated.
pub fn parse_textual_plan(text: &str) -> Vec<Subtask> {
    let line_re = Regex::new(r"^\s*\d+[.)]\s*(.+)$").unwrap();
    let mut subtasks = Vec::new();
    for line in text.lines() {
        let Some(caps) = line_re.captures(line) else {
            continue;
        };
        let body = caps[1].trim().trim_matches('*');
        let (name, info) = match body.split_once(':') {
            Some((name, info)) => (name.trim().trim_matches('*'), info.trim()),
            None => (body, ""),
        };
        if name.is_empty() {
            continue;
        }
        subtasks.push(Subtask::new(name, info));
    }
    subtasks
}

/// Extract the graph JSON from tool output that may wrap it in prose or a
/// code fence.
pub fn parse_graph(text: &str) -> Option<PlanGraph> {
    let candidate = if let Some(start) = text.find('{') {
        let end = text.rfind('}')?;
        &text[start..=end]
    } else {
        return None;
    };
    let graph: PlanGraph = serde_json::from_str(candidate).ok()?;
    if graph.nodes.is_empty() {
        return None;
    }
    Some(graph)
}

/// Kahn's algorithm over the graph. Returns `None` for cyclic graphs.
/// Ready nodes are taken in the order they appear in `linear` (the textual
/// plan), making the result stable. Edges naming unknown nodes are ignored.
pub fn topological_order(graph: &PlanGraph, linear: &[Subtask]) -> Option<Vec<Subtask>> {
    let order_of = |name: &str| -> usize {
        linear
            .iter()
            .position(|s| s.name == name)
            .unwrap_or(usize::MAX)
    };

    let index: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; graph.nodes.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); graph.nodes.len()];
    for (from, to) in &graph.edges {
        let (Some(&f), Some(&t)) = (index.get(from.as_str()), index.get(to.as_str())) else {
            continue;
        };
        successors[f].push(t);
        in_degree[t] += 1;
    }

    let mut ready: Vec<usize> = (0..graph.nodes.len())
        .filter(|&i| in_degree[i] == 0)
        .collect();
    let mut ordered = Vec::with_capacity(graph.nodes.len());

    while !ready.is_empty() {
        // Stable tie-break: the ready node earliest in the textual plan.
        ready.sort_by_key(|&i| order_of(&graph.nodes[i].name));
        let next = ready.remove(0);
        ordered.push(graph.nodes[next].clone());
        for &succ in &successors[next] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.push(succ);
            }
        }
    }

    if ordered.len() == graph.nodes.len() {
        Some(ordered)
    } else {
        None
    }
}
