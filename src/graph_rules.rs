//! Graph Rule Engine & Auto-Repair.
//!
//! Rules (violations block execution):
//! 1. Reactive actions (watch) must come last - no imperative node may
//!    run after, or depend on, a reactive one.
//! 2. Write requires create - a writer needs a create_file for the same
//!    target somewhere in its transitive dependencies, or the file must
//!    already exist.
//! 3. File requires folder - a create_file whose parent folder does not
//!    exist needs a preceding create_folder for that parent.
//!
//! Auto-repair runs before final validation and patches what it can;
//! every applied fix is recorded as a graph-fix pattern in the learning
//! store so recurring malformations are recognised.

use std::collections::HashMap;
use std::sync::Arc;

use crate::command::Intent;
use crate::error::{AgentError, Result};
use crate::graph::{ExecutionGraph, NodeKind};
use crate::learning::LearningStore;
use crate::paths::SystemPaths;
use crate::structured_log::{log_event, LogLevel};

pub struct GraphRuleEngine {
    paths: Arc<SystemPaths>,
}

impl GraphRuleEngine {
    pub fn new(paths: Arc<SystemPaths>) -> Self {
        Self { paths }
    }

    /// Check every rule; the first violation aborts with RuleViolation.
    pub fn validate(&self, graph: &ExecutionGraph) -> Result<()> {
        if graph.is_empty() {
            return Ok(());
        }
        self.rule_reactive_must_be_last(graph)?;
        self.rule_write_requires_create(graph)?;
        self.rule_file_requires_folder(graph)?;
        Ok(())
    }

    fn rule_reactive_must_be_last(&self, graph: &ExecutionGraph) -> Result<()> {
        let order = graph.execution_order()?;

        let first_reactive = order
            .iter()
            .position(|id| graph.get(id).map(|n| n.kind()) == Some(NodeKind::Reactive));

        if let Some(reactive_index) = first_reactive {
            for id in &order[reactive_index + 1..] {
                let node = graph.get(id).expect("ordered id exists");
                if node.kind() == NodeKind::Imperative {
                    return Err(AgentError::RuleViolation(format!(
                        "reactive '{}' is scheduled before imperative '{}'; watch actions must be the last step",
                        graph.get(&order[reactive_index]).expect("ordered id exists").intent.as_str(),
                        node.intent.as_str()
                    )));
                }
            }
        }

        // Dependency direction: an imperative may never wait on a reactive.
        for node in graph.nodes() {
            if node.kind() != NodeKind::Imperative {
                continue;
            }
            for dep in &node.depends_on {
                if graph.get(dep).map(|n| n.kind()) == Some(NodeKind::Reactive) {
                    return Err(AgentError::RuleViolation(format!(
                        "imperative '{}' depends on reactive node {}",
                        node.intent.as_str(),
                        dep
                    )));
                }
            }
        }

        Ok(())
    }

    fn rule_write_requires_create(&self, graph: &ExecutionGraph) -> Result<()> {
        for node in graph.nodes() {
            if node.intent != Intent::WriteFile {
                continue;
            }
            if node.target.is_empty() {
                continue;
            }

            let deps = graph.transitive_dependencies(&node.id);
            let has_create = deps.iter().any(|dep_id| {
                graph
                    .get(dep_id)
                    .map(|dep| dep.intent == Intent::CreateFile && dep.target == node.target)
                    .unwrap_or(false)
            });

            if has_create {
                continue;
            }

            // Pre-existing files are fair game for writers.
            let resolved = self.paths.resolve_target(&node.target, &node.location);
            if resolved.exists() {
                continue;
            }

            return Err(AgentError::RuleViolation(format!(
                "write to '{}' has no create_file in its dependencies",
                node.target
            )));
        }
        Ok(())
    }

    fn rule_file_requires_folder(&self, graph: &ExecutionGraph) -> Result<()> {
        for node in graph.nodes() {
            if node.intent != Intent::CreateFile || node.location.is_empty() {
                continue;
            }

            if self.folder_satisfied(graph, &node.location) {
                continue;
            }

            return Err(AgentError::RuleViolation(format!(
                "create_file '{}' targets folder '{}' which does not exist and is not created first",
                node.target, node.location
            )));
        }
        Ok(())
    }

    fn folder_satisfied(&self, graph: &ExecutionGraph, location: &str) -> bool {
        let created_in_graph = graph.nodes().any(|n| {
            n.intent == Intent::CreateFolder
                && (n.target == location
                    || self.paths.resolve_target(&n.target, &n.location)
                        == self.paths.resolve(location))
        });
        if created_in_graph {
            return true;
        }
        self.paths.resolve(location).exists()
    }
}

/// Repairs the graph in place; returns the names of the fixes applied.
pub struct AutoRepairPlanner {
    rules: GraphRuleEngine,
    paths: Arc<SystemPaths>,
    learning: Arc<LearningStore>,
}

impl AutoRepairPlanner {
    pub fn new(paths: Arc<SystemPaths>, learning: Arc<LearningStore>) -> Self {
        Self {
            rules: GraphRuleEngine::new(paths.clone()),
            paths,
            learning,
        }
    }

    pub fn repair(&self, graph: &mut ExecutionGraph) -> Vec<String> {
        let mut fixes = Vec::new();

        if self.rules.rule_reactive_must_be_last(graph).is_err() {
            self.reorder_reactive(graph);
            self.record_fix(
                "reactive_must_be_last",
                "watch",
                "reorder_reactive_to_end",
                &mut fixes,
            );
        }

        let injected_files = self.inject_missing_creates(graph);
        if injected_files > 0 {
            self.record_fix(
                "write_requires_create",
                "write_file",
                "inject_create_file",
                &mut fixes,
            );
        }

        let injected_folders = self.inject_missing_folders(graph);
        if injected_folders > 0 {
            self.record_fix(
                "file_requires_folder",
                "create_file",
                "inject_create_folder",
                &mut fixes,
            );
        }

        if !fixes.is_empty() {
            log_event(
                LogLevel::Info,
                "GRAPH",
                "auto_repair",
                serde_json::json!({"fixes": fixes}),
            );
        }

        fixes
    }

    fn record_fix(&self, rule: &str, trigger: &str, fix: &str, fixes: &mut Vec<String>) {
        let _ = self.learning.learn_graph_fix(rule, trigger, fix);
        fixes.push(fix.to_string());
    }

    /// Every reactive node is rewired to depend on every imperative node,
    /// guaranteeing it runs last regardless of how the plan ordered it.
    fn reorder_reactive(&self, graph: &mut ExecutionGraph) {
        let imperative_ids: Vec<String> = graph
            .nodes()
            .filter(|n| n.kind() == NodeKind::Imperative)
            .map(|n| n.id.clone())
            .collect();
        let reactive_ids: Vec<String> = graph
            .nodes()
            .filter(|n| n.kind() == NodeKind::Reactive)
            .map(|n| n.id.clone())
            .collect();

        if imperative_ids.is_empty() || reactive_ids.is_empty() {
            return;
        }

        // Imperatives that waited on a reactive get those edges dropped,
        // otherwise the rewiring below would close a cycle.
        for id in graph.node_ids() {
            let is_imperative = imperative_ids.contains(&id);
            if let Some(node) = graph.get_mut(&id) {
                if is_imperative {
                    node.depends_on.retain(|dep| !reactive_ids.contains(dep));
                }
            }
        }

        for reactive_id in &reactive_ids {
            if let Some(node) = graph.get_mut(reactive_id) {
                node.depends_on = imperative_ids.clone();
            }
        }
    }

    /// A writer with no matching create upstream gets one injected and is
    /// rewired to depend on it.
    fn inject_missing_creates(&self, graph: &mut ExecutionGraph) -> usize {
        let writers: Vec<String> = graph
            .nodes()
            .filter(|n| n.intent == Intent::WriteFile && !n.target.is_empty())
            .map(|n| n.id.clone())
            .collect();

        let mut injected = 0;
        for writer_id in writers {
            let (target, location, inherited_deps) = {
                let writer = graph.get(&writer_id).expect("writer exists");
                (
                    writer.target.clone(),
                    writer.location.clone(),
                    writer.depends_on.clone(),
                )
            };

            let has_create = graph
                .nodes()
                .any(|n| n.intent == Intent::CreateFile && n.target == target);
            if has_create {
                continue;
            }
            if self.paths.resolve_target(&target, &location).exists() {
                continue;
            }

            let create_id = graph.add_node(
                Intent::CreateFile,
                &target,
                &location,
                HashMap::new(),
                inherited_deps,
            );
            if let Some(writer) = graph.get_mut(&writer_id) {
                writer.depends_on = vec![create_id];
            }
            injected += 1;
        }
        injected
    }

    /// create_file into a folder nobody creates and that does not exist
    /// gets a create_folder injected upstream.
    fn inject_missing_folders(&self, graph: &mut ExecutionGraph) -> usize {
        let files: Vec<String> = graph
            .nodes()
            .filter(|n| n.intent == Intent::CreateFile && !n.location.is_empty())
            .map(|n| n.id.clone())
            .collect();

        let mut injected = 0;
        for file_id in files {
            let (location, inherited_deps) = {
                let node = graph.get(&file_id).expect("file node exists");
                (node.location.clone(), node.depends_on.clone())
            };

            if self.rules.folder_satisfied(graph, &location) {
                continue;
            }

            let folder_id = graph.add_node(
                Intent::CreateFolder,
                &location,
                "",
                HashMap::new(),
                inherited_deps,
            );
            if let Some(node) = graph.get_mut(&file_id) {
                node.depends_on = vec![folder_id];
            }
            injected += 1;
        }
        injected
    }
}
