//! Execution State Machine - observable per-command lifecycle.
//!
//! INIT → PARSING → POLICY_CHECK → GRAPH_BUILT → NODE_RUNNING ⇄ NODE_DONE
//! → COMPLETED, with side arrows for PAUSED, CANCELLED, POLICY_BLOCKED,
//! FAILED and the ROLLING_BACK/ROLLED_BACK tail. Illegal transitions are
//! refused, so every recorded timeline is a monotone path in this DAG.
//!
//! Subscribers receive status snapshots over channels; node code never
//! calls listeners directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Init,
    Parsing,
    PolicyCheck,
    PolicyBlocked,
    GraphBuilt,
    NodeRunning,
    NodeDone,
    Paused,
    Completed,
    Failed,
    Cancelled,
    RollingBack,
    RolledBack,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::PolicyBlocked
                | ExecutionState::Cancelled
                | ExecutionState::RolledBack
        )
    }

    fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match self {
            Init => matches!(next, Parsing | PolicyCheck | Cancelled | Failed),
            Parsing => matches!(next, PolicyCheck | Failed | Cancelled),
            PolicyCheck => matches!(next, PolicyBlocked | GraphBuilt | Failed | Cancelled),
            GraphBuilt => matches!(next, NodeRunning | Failed | Cancelled),
            NodeRunning => matches!(next, NodeDone | Paused | Failed | Cancelled),
            NodeDone => matches!(next, NodeRunning | Completed | Failed | Cancelled),
            Paused => matches!(next, NodeRunning | Cancelled),
            Completed => matches!(next, RollingBack),
            Failed => matches!(next, RollingBack),
            RollingBack => matches!(next, RolledBack | Failed),
            PolicyBlocked | Cancelled | RolledBack => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub state: ExecutionState,
    pub message: String,
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub command_id: String,
    pub state: ExecutionState,
    pub current_node: Option<String>,
    pub nodes_total: usize,
    pub nodes_completed: usize,
    pub progress_percent: u8,
    pub last_action: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub can_pause: bool,
    pub can_cancel: bool,
    pub can_rollback: bool,
    pub timeline: Vec<TimelineEvent>,
}

struct Subscribers {
    per_command: HashMap<String, Vec<Sender<ExecutionStatus>>>,
    global: Vec<Sender<ExecutionStatus>>,
}

pub struct ExecutionStateMachine {
    states: Mutex<HashMap<String, ExecutionStatus>>,
    subscribers: Mutex<Subscribers>,
}

impl ExecutionStateMachine {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Subscribers {
                per_command: HashMap::new(),
                global: Vec::new(),
            }),
        }
    }

    pub fn init(&self, command_id: &str) -> ExecutionStatus {
        let status = ExecutionStatus {
            command_id: command_id.to_string(),
            state: ExecutionState::Init,
            current_node: None,
            nodes_total: 0,
            nodes_completed: 0,
            progress_percent: 0,
            last_action: "registered".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            can_pause: false,
            can_cancel: true,
            can_rollback: false,
            timeline: vec![TimelineEvent {
                timestamp: Utc::now(),
                state: ExecutionState::Init,
                message: "registered".to_string(),
                node_id: None,
                details: serde_json::Value::Null,
            }],
        };

        self.states
            .lock()
            .unwrap()
            .insert(command_id.to_string(), status.clone());
        self.notify(&status);
        status
    }

    /// Move to a new state. Returns false (and records nothing) when the
    /// transition is not legal from the current state.
    pub fn transition(
        &self,
        command_id: &str,
        new_state: ExecutionState,
        message: &str,
        node_id: Option<&str>,
    ) -> bool {
        let snapshot = {
            let mut states = self.states.lock().unwrap();
            let status = match states.get_mut(command_id) {
                Some(s) => s,
                None => return false,
            };

            if !status.state.can_transition_to(new_state) {
                return false;
            }

            status.state = new_state;
            status.last_action = if message.is_empty() {
                format!("{:?}", new_state)
            } else {
                message.to_string()
            };
            if let Some(node) = node_id {
                status.current_node = Some(node.to_string());
            }

            match new_state {
                ExecutionState::NodeRunning => {
                    status.can_pause = true;
                }
                ExecutionState::Completed => {
                    status.can_pause = false;
                    status.can_cancel = false;
                    status.can_rollback = true;
                    status.completed_at = Some(Utc::now());
                    status.progress_percent = 100;
                }
                ExecutionState::Failed
                | ExecutionState::Cancelled
                | ExecutionState::PolicyBlocked
                | ExecutionState::RolledBack => {
                    status.can_pause = false;
                    status.can_cancel = false;
                    status.completed_at = Some(Utc::now());
                    if new_state == ExecutionState::RolledBack {
                        status.can_rollback = false;
                    }
                }
                ExecutionState::RollingBack => {
                    status.can_rollback = false;
                }
                _ => {}
            }

            status.timeline.push(TimelineEvent {
                timestamp: Utc::now(),
                state: new_state,
                message: message.to_string(),
                node_id: node_id.map(|n| n.to_string()),
                details: serde_json::Value::Null,
            });

            status.clone()
        };

        self.notify(&snapshot);
        true
    }

    pub fn update_progress(
        &self,
        command_id: &str,
        completed: usize,
        total: usize,
        current_node: Option<&str>,
    ) {
        let snapshot = {
            let mut states = self.states.lock().unwrap();
            let status = match states.get_mut(command_id) {
                Some(s) => s,
                None => return,
            };
            status.nodes_completed = completed;
            status.nodes_total = total;
            status.progress_percent = if total > 0 {
                ((completed * 100) / total) as u8
            } else {
                0
            };
            if let Some(node) = current_node {
                status.current_node = Some(node.to_string());
            }
            status.clone()
        };
        self.notify(&snapshot);
    }

    pub fn set_error(&self, command_id: &str, error: &str) {
        {
            let mut states = self.states.lock().unwrap();
            if let Some(status) = states.get_mut(command_id) {
                status.error = Some(error.to_string());
            }
        }
        self.transition(command_id, ExecutionState::Failed, error, None);
    }

    pub fn get(&self, command_id: &str) -> Option<ExecutionStatus> {
        self.states.lock().unwrap().get(command_id).cloned()
    }

    pub fn timeline(&self, command_id: &str) -> Vec<TimelineEvent> {
        self.states
            .lock()
            .unwrap()
            .get(command_id)
            .map(|s| s.timeline.clone())
            .unwrap_or_default()
    }

    pub fn active(&self) -> Vec<ExecutionStatus> {
        self.states
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                matches!(
                    s.state,
                    ExecutionState::Init
                        | ExecutionState::Parsing
                        | ExecutionState::PolicyCheck
                        | ExecutionState::GraphBuilt
                        | ExecutionState::NodeRunning
                        | ExecutionState::NodeDone
                        | ExecutionState::Paused
                )
            })
            .cloned()
            .collect()
    }

    // ── control ──────────────────────────────────────────────────────

    pub fn pause(&self, command_id: &str) -> bool {
        match self.get(command_id) {
            Some(status) if status.can_pause && status.state == ExecutionState::NodeRunning => {
                self.transition(command_id, ExecutionState::Paused, "paused", None)
            }
            _ => false,
        }
    }

    pub fn resume(&self, command_id: &str) -> bool {
        match self.get(command_id) {
            Some(status) if status.state == ExecutionState::Paused => {
                self.transition(command_id, ExecutionState::NodeRunning, "resumed", None)
            }
            _ => false,
        }
    }

    pub fn cancel(&self, command_id: &str) -> bool {
        match self.get(command_id) {
            Some(status) if status.can_cancel => {
                self.transition(command_id, ExecutionState::Cancelled, "cancelled", None)
            }
            _ => false,
        }
    }

    pub fn request_rollback(&self, command_id: &str) -> bool {
        match self.get(command_id) {
            Some(status) if status.can_rollback => self.transition(
                command_id,
                ExecutionState::RollingBack,
                "rolling back",
                None,
            ),
            _ => false,
        }
    }

    // ── subscriptions ────────────────────────────────────────────────

    pub fn subscribe(&self, command_id: &str) -> Receiver<ExecutionStatus> {
        let (tx, rx) = channel();
        self.subscribers
            .lock()
            .unwrap()
            .per_command
            .entry(command_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn subscribe_all(&self) -> Receiver<ExecutionStatus> {
        let (tx, rx) = channel();
        self.subscribers.lock().unwrap().global.push(tx);
        rx
    }

    fn notify(&self, status: &ExecutionStatus) {
        let mut subscribers = self.subscribers.lock().unwrap();

        if let Some(list) = subscribers.per_command.get_mut(&status.command_id) {
            list.retain(|tx| tx.send(status.clone()).is_ok());
        }
        subscribers
            .global
            .retain(|tx| tx.send(status.clone()).is_ok());
    }

    /// One-line human summary used in final confirmations.
    pub fn format_status(&self, command_id: &str) -> String {
        match self.get(command_id) {
            Some(status) => {
                let progress = if status.nodes_total > 0 {
                    format!(" [{}/{}]", status.nodes_completed, status.nodes_total)
                } else {
                    String::new()
                };
                format!(
                    "[{}] {:?}{} - {}",
                    status.command_id, status.state, progress, status.last_action
                )
            }
            None => format!("unknown command: {}", command_id),
        }
    }
}

impl Default for ExecutionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_with(command_id: &str) -> ExecutionStateMachine {
        let machine = ExecutionStateMachine::new();
        machine.init(command_id);
        machine
    }

    fn drive_to_completed(machine: &ExecutionStateMachine, id: &str) {
        machine.transition(id, ExecutionState::Parsing, "", None);
        machine.transition(id, ExecutionState::PolicyCheck, "", None);
        machine.transition(id, ExecutionState::GraphBuilt, "", None);
        machine.transition(id, ExecutionState::NodeRunning, "", Some("node-0"));
        machine.transition(id, ExecutionState::NodeDone, "", Some("node-0"));
        machine.transition(id, ExecutionState::Completed, "", None);
    }

    #[test]
    fn test_happy_path_timeline() {
        let machine = machine_with("CMD-1");
        drive_to_completed(&machine, "CMD-1");

        let timeline = machine.timeline("CMD-1");
        let states: Vec<ExecutionState> = timeline.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                ExecutionState::Init,
                ExecutionState::Parsing,
                ExecutionState::PolicyCheck,
                ExecutionState::GraphBuilt,
                ExecutionState::NodeRunning,
                ExecutionState::NodeDone,
                ExecutionState::Completed,
            ]
        );

        let status = machine.get("CMD-1").unwrap();
        assert!(status.can_rollback);
        assert!(!status.can_cancel);
        assert_eq!(status.progress_percent, 100);
    }

    #[test]
    fn test_illegal_transition_refused() {
        let machine = machine_with("CMD-2");
        assert!(!machine.transition("CMD-2", ExecutionState::Completed, "", None));
        assert!(!machine.transition("CMD-2", ExecutionState::RolledBack, "", None));

        // Timeline untouched by refused transitions
        assert_eq!(machine.timeline("CMD-2").len(), 1);
    }

    #[test]
    fn test_policy_blocked_is_terminal() {
        let machine = machine_with("CMD-3");
        machine.transition("CMD-3", ExecutionState::Parsing, "", None);
        machine.transition("CMD-3", ExecutionState::PolicyCheck, "", None);
        machine.transition("CMD-3", ExecutionState::PolicyBlocked, "protected path", None);

        assert!(!machine.transition("CMD-3", ExecutionState::GraphBuilt, "", None));
        let status = machine.get("CMD-3").unwrap();
        assert!(status.state.is_terminal());
        assert!(status.completed_at.is_some());
    }

    #[test]
    fn test_pause_only_while_node_running() {
        let machine = machine_with("CMD-4");
        assert!(!machine.pause("CMD-4"));

        machine.transition("CMD-4", ExecutionState::Parsing, "", None);
        machine.transition("CMD-4", ExecutionState::PolicyCheck, "", None);
        machine.transition("CMD-4", ExecutionState::GraphBuilt, "", None);
        machine.transition("CMD-4", ExecutionState::NodeRunning, "", None);

        assert!(machine.pause("CMD-4"));
        assert!(machine.resume("CMD-4"));
    }

    #[test]
    fn test_rollback_only_after_completed() {
        let machine = machine_with("CMD-5");
        assert!(!machine.request_rollback("CMD-5"));

        drive_to_completed(&machine, "CMD-5");
        assert!(machine.request_rollback("CMD-5"));
        assert!(machine.transition("CMD-5", ExecutionState::RolledBack, "", None));

        // Only once
        assert!(!machine.request_rollback("CMD-5"));
    }

    #[test]
    fn test_subscription_receives_updates() {
        let machine = ExecutionStateMachine::new();
        machine.init("CMD-6");
        let rx = machine.subscribe("CMD-6");

        machine.transition("CMD-6", ExecutionState::Parsing, "thinking", None);

        let update = rx.try_recv().unwrap();
        assert_eq!(update.state, ExecutionState::Parsing);
    }

    #[test]
    fn test_global_subscription() {
        let machine = ExecutionStateMachine::new();
        let rx = machine.subscribe_all();

        machine.init("CMD-7");
        machine.transition("CMD-7", ExecutionState::Parsing, "", None);

        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_cancel_gate() {
        let machine = machine_with("CMD-8");
        assert!(machine.cancel("CMD-8"));
        assert!(!machine.cancel("CMD-8"));
    }
}
