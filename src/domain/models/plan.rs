//! Plan and subtask models.
//!
//! The planner produces an ordered queue of subtasks out of a dependency
//! graph; the dispatcher moves subtasks between the three disjoint lists.

use serde::{Deserialize, Serialize};

/// A single unit of plan work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    /// Short name, unique within one plan
    pub name: String,
    /// One-line description of what to do
    pub info: String,
}

impl Subtask {
    pub fn new(name: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            info: info.into(),
        }
    }
}

/// The per-task subtask queue. A subtask belongs to exactly one of the
/// three lists at any time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Plan {
    pub remaining: Vec<Subtask>,
    pub completed: Vec<Subtask>,
    pub failed: Vec<Subtask>,
}

impl Plan {
    /// Install a fresh queue. Completed and failed history is preserved;
    /// the old remaining subtasks are discarded (replan semantics).
    pub fn install(&mut self, remaining: Vec<Subtask>) {
        self.remaining = remaining;
    }

    /// Take the next subtask off the front of the queue.
    pub fn pop_front(&mut self) -> Option<Subtask> {
        if self.remaining.is_empty() {
            None
        } else {
            Some(self.remaining.remove(0))
        }
    }

    pub fn complete(&mut self, subtask: Subtask) {
        self.completed.push(subtask);
    }

    pub fn fail(&mut self, subtask: Subtask) {
        self.failed.push(subtask);
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_empty()
    }

    pub fn total(&self) -> usize {
        self.remaining.len() + self.completed.len() + self.failed.len()
    }
}

/// Dependency graph as produced by the DAG-translator tool.
///
/// Nodes are subtasks, edges are "must precede" pairs referencing node
/// names. Parsed defensively: unknown names in edges are ignored rather
/// than aborting the task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanGraph {
    #[serde(default)]
    pub nodes: Vec<Subtask>,
    #[serde(default)]
    pub edges: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_lists_stay_disjoint() {
        let mut plan = Plan::default();
        plan.install(vec![
            Subtask::new("A", "first"),
            Subtask::new("B", "second"),
            Subtask::new("C", "third"),
        ]);

        let a = plan.pop_front().unwrap();
        plan.complete(a);
        let b = plan.pop_front().unwrap();
        plan.fail(b);

        assert_eq!(plan.remaining.len(), 1);
        assert_eq!(plan.completed.len(), 1);
        assert_eq!(plan.failed.len(), 1);
        assert_eq!(plan.total(), 3);
    }

    #[test]
    fn test_install_preserves_history() {
        let mut plan = Plan::default();
        plan.complete(Subtask::new("done", ""));
        plan.fail(Subtask::new("broken", ""));
        plan.install(vec![Subtask::new("retry", "")]);

        assert_eq!(plan.completed.len(), 1);
        assert_eq!(plan.failed.len(), 1);
        assert_eq!(plan.remaining.len(), 1);
    }

    #[test]
    fn test_plan_graph_deserializes_with_missing_fields() {
        let graph: PlanGraph = serde_json::from_str("{}").unwrap();
        assert!(graph.nodes.is_empty());
        assert!(graph.edges.is_empty());
    }
}
