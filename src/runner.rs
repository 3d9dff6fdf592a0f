//! Graph Runner - topologically ordered execution with stop-on-failure.
//!
//! Ready nodes (all dependencies DONE) run as a wave; siblings in one
//! wave execute on their own threads. Each node action is raced against
//! its intent's deadline. On the first failure every node not yet started
//! is SKIPPED and the run reports the failed node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::actions::{ActionContext, ActionRegistry};
use crate::error::{AgentError, Result};
use crate::graph::{ExecutionGraph, ExecutionNode, NodeStatus};
use crate::paths::SystemPaths;
use crate::rollback::RollbackEngine;
use crate::security::intent_timeout_secs;
use crate::structured_log::{log_event, LogLevel};

#[derive(Debug, Clone)]
pub struct RunnerEvent {
    pub command_id: String,
    pub node_id: String,
    pub status: NodeStatus,
    pub completed: usize,
    pub total: usize,
    pub message: String,
}

pub type ProgressFn = dyn Fn(RunnerEvent) + Send + Sync;

#[derive(Debug, Clone)]
pub struct GraphResult {
    pub success: bool,
    pub failed_node: Option<String>,
    pub error: Option<String>,
    pub completed: usize,
    pub total: usize,
    /// Output of every DONE node, keyed by node id.
    pub context: HashMap<String, String>,
}

pub struct GraphRunner {
    paths: Arc<SystemPaths>,
    rollback: Arc<RollbackEngine>,
    actions: Arc<ActionRegistry>,
}

impl GraphRunner {
    pub fn new(
        paths: Arc<SystemPaths>,
        rollback: Arc<RollbackEngine>,
        actions: Arc<ActionRegistry>,
    ) -> Self {
        Self {
            paths,
            rollback,
            actions,
        }
    }

    pub fn run(
        &self,
        command_id: &str,
        graph: &mut ExecutionGraph,
        dry_run: bool,
        cancel: &AtomicBool,
        progress: Option<&ProgressFn>,
    ) -> GraphResult {
        let total = graph.len();
        let order = match graph.execution_order() {
            Ok(order) => order,
            Err(e) => {
                return GraphResult {
                    success: false,
                    failed_node: None,
                    error: Some(e.to_string()),
                    completed: 0,
                    total,
                    context: HashMap::new(),
                }
            }
        };

        let mut completed: Vec<String> = Vec::new();
        let mut context: HashMap<String, String> = HashMap::new();
        let mut pending: Vec<String> = order;
        let mut failure: Option<(String, String)> = None;

        while !pending.is_empty() && failure.is_none() {
            if cancel.load(Ordering::SeqCst) {
                failure = Some((String::new(), "cancelled".to_string()));
                break;
            }

            // Everything whose dependencies are all DONE runs this wave.
            let wave: Vec<String> = pending
                .iter()
                .filter(|id| {
                    graph
                        .get(id)
                        .map(|n| n.depends_on.iter().all(|d| completed.contains(d)))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();

            if wave.is_empty() {
                failure = Some((
                    String::new(),
                    "no runnable nodes left; graph is stuck".to_string(),
                ));
                break;
            }

            for id in &wave {
                if let Some(node) = graph.get_mut(id) {
                    node.status = NodeStatus::Running;
                }
                self.emit(
                    progress,
                    command_id,
                    id,
                    NodeStatus::Running,
                    completed.len(),
                    total,
                    "",
                );
            }

            let wave_results = self.run_wave(command_id, graph, &wave, dry_run, &context);

            for (id, outcome) in wave_results {
                match outcome {
                    Ok((result, elapsed_ms)) => {
                        if let Some(node) = graph.get_mut(&id) {
                            node.status = NodeStatus::Done;
                            node.result = Some(result.clone());
                            node.duration_ms = Some(elapsed_ms);
                        }
                        context.insert(id.clone(), result.clone());
                        completed.push(id.clone());
                        pending.retain(|p| p != &id);
                        self.emit(
                            progress,
                            command_id,
                            &id,
                            NodeStatus::Done,
                            completed.len(),
                            total,
                            &result,
                        );
                    }
                    Err(e) => {
                        let message = e.to_string();
                        if let Some(node) = graph.get_mut(&id) {
                            node.status = NodeStatus::Failed;
                            node.error = Some(message.clone());
                        }
                        pending.retain(|p| p != &id);
                        self.emit(
                            progress,
                            command_id,
                            &id,
                            NodeStatus::Failed,
                            completed.len(),
                            total,
                            &message,
                        );
                        if failure.is_none() {
                            failure = Some((id.clone(), message));
                        }
                    }
                }
            }
        }

        // stop_on_failure: whatever never started is skipped
        for id in pending {
            if let Some(node) = graph.get_mut(&id) {
                if node.status == NodeStatus::Pending {
                    node.status = NodeStatus::Skipped;
                    self.emit(
                        progress,
                        command_id,
                        &id,
                        NodeStatus::Skipped,
                        completed.len(),
                        total,
                        "",
                    );
                }
            }
        }

        let result = GraphResult {
            success: failure.is_none(),
            failed_node: failure
                .as_ref()
                .map(|(id, _)| id.clone())
                .filter(|id| !id.is_empty()),
            error: failure.map(|(_, e)| e),
            completed: completed.len(),
            total,
            context,
        };

        log_event(
            LogLevel::Info,
            "RUNNER",
            "graph_done",
            serde_json::json!({
                "command_id": command_id,
                "success": result.success,
                "completed": result.completed,
                "total": result.total,
                "failed_node": result.failed_node,
            }),
        );

        result
    }

    /// Run one wave of sibling nodes, each on its own thread, each raced
    /// against its intent deadline. A timed-out action keeps running on
    /// its thread; only its result is abandoned.
    fn run_wave(
        &self,
        command_id: &str,
        graph: &ExecutionGraph,
        wave: &[String],
        dry_run: bool,
        context: &HashMap<String, String>,
    ) -> Vec<(String, Result<(String, u64)>)> {
        let mut receivers = Vec::with_capacity(wave.len());

        for id in wave {
            let node = match graph.get(id) {
                Some(n) => n.clone(),
                None => continue,
            };

            let (tx, rx) = mpsc::channel();
            let timeout = Duration::from_secs(intent_timeout_secs(node.intent));
            let paths = self.paths.clone();
            let rollback = self.rollback.clone();
            let actions = self.actions.clone();
            let shared = context.clone();
            let command_id = command_id.to_string();

            std::thread::spawn(move || {
                let started = Instant::now();
                let outcome = Self::execute_node(
                    &node, &command_id, dry_run, &paths, &rollback, &actions, &shared,
                );
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let _ = tx.send(outcome.map(|result| (result, elapsed_ms)));
            });

            receivers.push((id.clone(), rx, timeout));
        }

        receivers
            .into_iter()
            .map(|(id, rx, timeout)| {
                let outcome = match rx.recv_timeout(timeout) {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::Timeout(format!(
                        "node {} exceeded its {}s deadline",
                        id,
                        timeout.as_secs()
                    ))),
                };
                (id, outcome)
            })
            .collect()
    }

    fn execute_node(
        node: &ExecutionNode,
        command_id: &str,
        dry_run: bool,
        paths: &SystemPaths,
        rollback: &RollbackEngine,
        actions: &ActionRegistry,
        shared: &HashMap<String, String>,
    ) -> Result<String> {
        let action = actions.get(node.intent).ok_or_else(|| {
            AgentError::NodeExecution(format!(
                "no action registered for intent '{}'",
                node.intent.as_str()
            ))
        })?;

        let ctx = ActionContext {
            command_id,
            dry_run,
            paths,
            rollback,
            shared,
        };

        action.execute(node, &ctx)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        progress: Option<&ProgressFn>,
        command_id: &str,
        node_id: &str,
        status: NodeStatus,
        completed: usize,
        total: usize,
        message: &str,
    ) {
        if let Some(callback) = progress {
            callback(RunnerEvent {
                command_id: command_id.to_string(),
                node_id: node_id.to_string(),
                status,
                completed,
                total,
                message: message.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Intent;
    use crate::graph::GraphBuilder;
    use crate::planner::PlanStep;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        _data: TempDir,
        work: TempDir,
        runner: GraphRunner,
        rollback: Arc<RollbackEngine>,
    }

    impl Fixture {
        fn new() -> Self {
            let data = TempDir::new().unwrap();
            let rollback = Arc::new(RollbackEngine::new(data.path()).unwrap());
            let runner = GraphRunner::new(
                Arc::new(SystemPaths::new()),
                rollback.clone(),
                Arc::new(ActionRegistry::with_defaults()),
            );
            Self {
                _data: data,
                work: TempDir::new().unwrap(),
                runner,
                rollback,
            }
        }

        fn loc(&self) -> String {
            self.work.path().display().to_string()
        }

        fn step(&self, index: usize, intent: Intent, target: &str) -> PlanStep {
            PlanStep {
                index,
                intent,
                target: target.to_string(),
                location: self.loc(),
                params: HashMap::new(),
            }
        }
    }

    #[test]
    fn test_chain_executes_in_order() {
        let fx = Fixture::new();
        let steps = vec![
            fx.step(0, Intent::CreateFolder, "parent"),
            PlanStep {
                index: 1,
                intent: Intent::CreateFile,
                target: "child.txt".to_string(),
                location: fx.work.path().join("parent").display().to_string(),
                params: HashMap::new(),
            },
        ];
        let mut graph = GraphBuilder::build(&steps);

        let result = fx.runner.run(
            "CMD-RUN",
            &mut graph,
            false,
            &AtomicBool::new(false),
            None,
        );

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.completed, 2);
        assert!(fx.work.path().join("parent/child.txt").exists());

        // Two rollback records, one per effectful node
        assert_eq!(fx.rollback.records_for("CMD-RUN").len(), 2);
    }

    #[test]
    fn test_failure_skips_the_rest() {
        let fx = Fixture::new();
        // Deleting something that does not exist fails the first node
        let steps = vec![
            fx.step(0, Intent::Delete, "ghost.txt"),
            fx.step(1, Intent::CreateFolder, "never_made"),
        ];
        let mut graph = GraphBuilder::build(&steps);

        let result = fx.runner.run(
            "CMD-FAIL",
            &mut graph,
            false,
            &AtomicBool::new(false),
            None,
        );

        assert!(!result.success);
        assert_eq!(result.failed_node.as_deref(), Some("node-0"));
        assert_eq!(graph.get("node-1").unwrap().status, NodeStatus::Skipped);
        assert!(!fx.work.path().join("never_made").exists());
    }

    #[test]
    fn test_nodes_are_timed() {
        let fx = Fixture::new();
        let steps = vec![fx.step(0, Intent::CreateFolder, "timed")];
        let mut graph = GraphBuilder::build(&steps);

        fx.runner.run(
            "CMD-TIME",
            &mut graph,
            false,
            &AtomicBool::new(false),
            None,
        );

        assert!(graph.get("node-0").unwrap().duration_ms.is_some());
    }

    #[test]
    fn test_progress_events_emitted() {
        let fx = Fixture::new();
        let steps = vec![fx.step(0, Intent::CreateFolder, "watched")];
        let mut graph = GraphBuilder::build(&steps);

        let events: Arc<Mutex<Vec<RunnerEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: Box<ProgressFn> = Box::new(move |event| {
            sink.lock().unwrap().push(event);
        });

        fx.runner.run(
            "CMD-PROG",
            &mut graph,
            false,
            &AtomicBool::new(false),
            Some(callback.as_ref()),
        );

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| e.status == NodeStatus::Running));
        assert!(events.iter().any(|e| e.status == NodeStatus::Done));
    }

    #[test]
    fn test_cancel_prevents_new_starts() {
        let fx = Fixture::new();
        let steps = vec![fx.step(0, Intent::CreateFolder, "cancelled_out")];
        let mut graph = GraphBuilder::build(&steps);

        let cancel = AtomicBool::new(true);
        let result = fx.runner.run("CMD-CXL", &mut graph, false, &cancel, None);

        assert!(!result.success);
        assert_eq!(result.completed, 0);
        assert!(!fx.work.path().join("cancelled_out").exists());
    }

    #[test]
    fn test_dry_run_produces_no_side_effects() {
        let fx = Fixture::new();
        let steps = vec![fx.step(0, Intent::CreateFolder, "simulated")];
        let mut graph = GraphBuilder::build(&steps);

        let result = fx.runner.run(
            "CMD-DRY",
            &mut graph,
            true,
            &AtomicBool::new(false),
            None,
        );

        assert!(result.success);
        assert!(!fx.work.path().join("simulated").exists());
        assert!(fx.rollback.records_for("CMD-DRY").is_empty());
    }

    #[test]
    fn test_context_carries_node_outputs() {
        let fx = Fixture::new();
        let steps = vec![
            fx.step(0, Intent::CreateFolder, "ctx_a"),
            fx.step(1, Intent::CreateFolder, "ctx_b"),
        ];
        let mut graph = GraphBuilder::build(&steps);

        let result = fx.runner.run(
            "CMD-CTX",
            &mut graph,
            false,
            &AtomicBool::new(false),
            None,
        );

        assert!(result.context["node-0"].contains("ctx_a"));
        assert!(result.context["node-1"].contains("ctx_b"));
    }
}
