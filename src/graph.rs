//! Execution Graph - the DAG a frozen plan becomes.
//!
//! Nodes are stored in an arena keyed by `node-N` ids and reference each
//! other through `depends_on` lists only; there are no back-pointers.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::command::Intent;
use crate::error::{AgentError, Result};
use crate::planner::PlanStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

/// How a node behaves in ordering rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Mutates the world now: create, write, delete, move, ...
    Imperative,
    /// Stands by for future events: watch, on_change, monitor.
    Reactive,
    /// Flow control: if, loop, wait.
    Control,
    /// Pure output: notify, log, alert.
    Terminal,
}

pub fn node_kind(intent: Intent) -> NodeKind {
    match intent {
        Intent::Watch => NodeKind::Reactive,
        _ => NodeKind::Imperative,
    }
}

/// Same classification for free-form intent names (on_change payloads and
/// control/terminal pseudo-intents that never come from the wire enum).
pub fn node_kind_for_name(name: &str) -> NodeKind {
    match name {
        "watch" | "monitor" | "on_change" => NodeKind::Reactive,
        "if" | "loop" | "wait" => NodeKind::Control,
        "notify" | "log" | "alert" => NodeKind::Terminal,
        _ => NodeKind::Imperative,
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionNode {
    pub id: String,
    pub intent: Intent,
    pub target: String,
    pub location: String,
    pub params: HashMap<String, String>,
    pub depends_on: Vec<String>,
    pub status: NodeStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

impl ExecutionNode {
    pub fn kind(&self) -> NodeKind {
        node_kind(self.intent)
    }

    pub fn is_terminal_status(&self) -> bool {
        matches!(
            self.status,
            NodeStatus::Done | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
    nodes: HashMap<String, ExecutionNode>,
    insertion_order: Vec<String>,
    next_index: usize,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; returns its `node-N` id.
    pub fn add_node(
        &mut self,
        intent: Intent,
        target: &str,
        location: &str,
        params: HashMap<String, String>,
        depends_on: Vec<String>,
    ) -> String {
        let id = format!("node-{}", self.next_index);
        self.next_index += 1;

        self.nodes.insert(
            id.clone(),
            ExecutionNode {
                id: id.clone(),
                intent,
                target: target.to_string(),
                location: location.to_string(),
                params,
                depends_on,
                status: NodeStatus::Pending,
                result: None,
                error: None,
                duration_ms: None,
            },
        );
        self.insertion_order.push(id.clone());
        id
    }

    pub fn get(&self, id: &str) -> Option<&ExecutionNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ExecutionNode> {
        self.nodes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.insertion_order
            .iter()
            .filter_map(move |id| self.nodes.get(id))
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.insertion_order.clone()
    }

    /// Kahn's algorithm over the dependency edges; insertion order breaks
    /// ties so runs are deterministic. Errors on cycles.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for id in &self.insertion_order {
            let node = &self.nodes[id];
            indegree.entry(id.as_str()).or_insert(0);
            for dep in &node.depends_on {
                if !self.nodes.contains_key(dep) {
                    return Err(AgentError::RuleViolation(format!(
                        "{} depends on missing node {}",
                        id, dep
                    )));
                }
                *indegree.entry(id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut ready: VecDeque<&str> = self
            .insertion_order
            .iter()
            .map(String::as_str)
            .filter(|id| indegree[id] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            if let Some(children) = dependents.get(id) {
                for child in children {
                    let count = indegree.get_mut(child).expect("indegree entry exists");
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(AgentError::RuleViolation(
                "dependency cycle in execution graph".to_string(),
            ));
        }

        Ok(order)
    }

    /// All ids reachable by following `depends_on` edges from `id`.
    pub fn transitive_dependencies(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = self
            .nodes
            .get(id)
            .map(|n| n.depends_on.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(dep) = queue.pop_front() {
            if !seen.insert(dep.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&dep) {
                queue.extend(node.depends_on.iter().cloned());
            }
        }
        seen
    }
}

/// Builds a graph from frozen plan steps: one node per step, dependencies
/// a straight chain unless steps carry `parallel_group` metadata, in which
/// case members of one group share the same upstream dependency.
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn build(steps: &[PlanStep]) -> ExecutionGraph {
        let mut graph = ExecutionGraph::new();
        let mut previous: Option<String> = None;
        let mut group_anchor: Option<(String, Option<String>)> = None;

        for step in steps {
            let group = step.params.get("parallel_group").cloned();

            let depends_on = match (&group, &group_anchor) {
                (Some(g), Some((anchor_group, anchor_dep))) if g == anchor_group => {
                    anchor_dep.clone().into_iter().collect()
                }
                _ => previous.clone().into_iter().collect(),
            };

            let id = graph.add_node(
                step.intent,
                &step.target,
                &step.location,
                step.params.clone(),
                depends_on,
            );

            if let Some(g) = group {
                if group_anchor
                    .as_ref()
                    .map(|(anchor, _)| anchor != &g)
                    .unwrap_or(true)
                {
                    group_anchor = Some((g, previous.clone()));
                }
            } else {
                group_anchor = None;
            }
            previous = Some(id);
        }

        graph
    }
}
