//! Agent - the composition root.
//!
//! Wires every service at start-up and owns the pipeline that turns a
//! proposed intent into committed side effects:
//!
//!   request → worker (intent JSON) → learning/world-model/confidence →
//!   decision → plan (validate, freeze) → policy gate → graph (repair,
//!   rules) → runner (+ rollback registration) → state machine → registry
//!
//! Watcher events and due scheduler rows re-enter the same pipeline at
//! the decision engine, so reactive and deferred commands are gated
//! exactly like typed ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clarification::{Clarification, UserReply};
use crate::command::{Command, Intent};
use crate::config::ConfigManager;
use crate::db::Database;
use crate::decision::{DecisionAction, DecisionEngine};
use crate::error::{AgentError, Result};
use crate::graph::GraphBuilder;
use crate::graph_rules::{AutoRepairPlanner, GraphRuleEngine};
use crate::ipc::{WorkerClient, DEFAULT_AUTH_KEY};
use crate::learning::LearningStore;
use crate::notifications::Notifier;
use crate::actions::ActionRegistry;
use crate::planner::Planner;
use crate::policy::{PolicyEngine, Profile};
use crate::registry::{CommandRegistry, CommandStatus};
use crate::rollback::{RollbackEngine, RollbackResult};
use crate::runner::{GraphRunner, RunnerEvent};
use crate::scheduler::{parse_delay, DueTask, Repeat, Scheduler};
use crate::security::{AuditLogger, InputSanitizer, RateLimiter};
use crate::state_machine::{ExecutionState, ExecutionStateMachine, ExecutionStatus};
use crate::structured_log::{log_event, LogLevel};
use crate::supervisor::{SupervisorConfig, WorkerSupervisor};
use crate::paths::SystemPaths;
use crate::graph::NodeStatus;
use crate::watcher::{StopWatchAction, WatchAction, WatchFired, WatchTask, WatcherService};
use crate::world_model::WorldModel;

/// What a submitted request came to.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Completed {
        command_id: String,
        message: String,
    },
    CompletedWithNotice {
        command_id: String,
        message: String,
        notice: String,
    },
    NeedsClarification {
        command_id: String,
        clarification: Clarification,
    },
    NeedsConfirmation {
        command_id: String,
        question: String,
    },
    Blocked {
        command_id: String,
        reason: String,
    },
    Failed {
        command_id: String,
        error: String,
        rolled_back: usize,
    },
    Cancelled {
        command_id: String,
    },
    Scheduled {
        command_id: String,
        task_id: i64,
    },
    Unknown {
        command_id: String,
    },
}

struct PendingConfirmation {
    raw_input: String,
    commands: Vec<Command>,
    dry_run: bool,
    notice: Option<String>,
}

struct PendingClarification {
    raw_input: String,
    command: Command,
    clarification: Clarification,
}

pub struct Agent {
    data_dir: PathBuf,
    config: Mutex<ConfigManager>,
    registry: Arc<CommandRegistry>,
    decision: DecisionEngine,
    policy: Arc<PolicyEngine>,
    planner: Planner,
    rules: GraphRuleEngine,
    repair: AutoRepairPlanner,
    rollback: Arc<RollbackEngine>,
    runner: GraphRunner,
    state: Arc<ExecutionStateMachine>,
    watcher: Arc<WatcherService>,
    scheduler: Arc<Scheduler>,
    db: Arc<Database>,
    notifier: Arc<Notifier>,
    audit: Arc<AuditLogger>,
    sanitizer: InputSanitizer,
    rate_limiter: RateLimiter,
    client: WorkerClient,
    supervisor: WorkerSupervisor,

    watch_events: Mutex<Option<Receiver<WatchFired>>>,
    pending_confirmations: Mutex<HashMap<String, PendingConfirmation>>,
    pending_clarifications: Mutex<HashMap<String, PendingClarification>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Agent {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Agent> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let config = ConfigManager::load(&data_dir)?;
        let cfg = config.config().clone();

        crate::structured_log::init_logger(crate::structured_log::LogConfig {
            file_path: Some(data_dir.join("agent.log")),
            ..Default::default()
        });

        let paths = Arc::new(SystemPaths::new());
        let audit = Arc::new(AuditLogger::new(&data_dir));
        let registry = Arc::new(CommandRegistry::new());
        let learning = Arc::new(LearningStore::open(data_dir.join("learning.db"))?);
        let world_model = Arc::new(WorldModel::new());
        let decision = DecisionEngine::new(world_model.clone(), learning.clone());

        let profile = Profile::parse(&cfg.default_profile).unwrap_or(Profile::Safe);
        let policy = Arc::new(PolicyEngine::new(paths.clone(), audit.clone(), profile));

        let rollback = Arc::new(RollbackEngine::new(&data_dir)?);
        let state = Arc::new(ExecutionStateMachine::new());
        let db = Arc::new(Database::open(data_dir.join("agent.db"))?);
        let scheduler = Arc::new(Scheduler::open(data_dir.join("agent.db"))?);
        let notifier = Arc::new(Notifier::new(
            cfg.notifications_enabled,
            cfg.notifications_enabled && cfg.sound_enabled,
        ));

        let (watch_tx, watch_rx) = channel();
        let watcher = Arc::new(WatcherService::new(
            paths.clone(),
            watch_tx,
            cfg.max_watches,
        ));

        let mut actions = ActionRegistry::with_defaults();
        actions.insert(Intent::Watch, Box::new(WatchAction::new(watcher.clone())));
        actions.insert(
            Intent::StopWatch,
            Box::new(StopWatchAction::new(watcher.clone())),
        );

        let runner = GraphRunner::new(paths.clone(), rollback.clone(), Arc::new(actions));

        let client = WorkerClient::new(
            &cfg.worker_host,
            cfg.worker_port,
            DEFAULT_AUTH_KEY,
            Duration::from_secs(cfg.worker_timeout_secs),
        );

        let worker_cmd = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("deskpilot-worker")))
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "deskpilot-worker".to_string());
        let supervisor = WorkerSupervisor::new(SupervisorConfig::new(
            &cfg.worker_host,
            cfg.worker_port,
            &worker_cmd,
            vec!["--port".to_string(), cfg.worker_port.to_string()],
        ));

        Ok(Agent {
            rules: GraphRuleEngine::new(paths.clone()),
            repair: AutoRepairPlanner::new(paths.clone(), learning.clone()),
            rate_limiter: RateLimiter::new(
                cfg.rate_limit_max_requests,
                cfg.rate_limit_window_secs,
            ),
            sanitizer: InputSanitizer::new(),
            planner: Planner::new(),
            data_dir,
            config: Mutex::new(config),
            registry,
            decision,
            policy,
            rollback,
            runner,
            state,
            watcher,
            scheduler,
            db,
            notifier,
            audit,
            client,
            supervisor,
            watch_events: Mutex::new(Some(watch_rx)),
            pending_confirmations: Mutex::new(HashMap::new()),
            pending_clarifications: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the background loops: watcher event drain and the
    /// scheduler. Call once after construction.
    pub fn start_background(self: &Arc<Self>) {
        if let Some(watch_rx) = self.watch_events.lock().unwrap().take() {
            let agent = self.clone();
            std::thread::spawn(move || {
                for fired in watch_rx {
                    agent.on_watch_fired(fired);
                }
            });
        }

        let (due_tx, due_rx) = channel();
        self.scheduler.start(due_tx);
        {
            let agent = self.clone();
            std::thread::spawn(move || {
                for due in due_rx {
                    agent.on_task_due(due);
                }
            });
        }
    }

    /// Keep the worker process alive with health probes and bounded
    /// restarts. Separate from `start_background` so embedders that
    /// manage the worker themselves can skip it.
    pub fn start_worker_supervision(&self) {
        self.supervisor.start_monitor();
    }

    // ── public operations ────────────────────────────────────────────

    /// Full path: natural language in, outcome out. Blocks for the model
    /// call; run it on a worker thread when driving a UI.
    pub fn submit_request(&self, text: &str) -> Result<RequestOutcome> {
        if !self.rate_limiter.check() {
            return Err(AgentError::Policy("rate limit exceeded, slow down".to_string()));
        }

        for warning in self.sanitizer.warnings(text) {
            log_event(
                LogLevel::Warn,
                "PIPELINE",
                "suspicious_input",
                serde_json::json!({"warning": warning}),
            );
        }

        let command_id = self.registry.register(text, None);
        self.state.init(&command_id);
        self.state
            .transition(&command_id, ExecutionState::Parsing, "analyzing", None);

        if let Err(e) = self.supervisor.ensure_running() {
            return Ok(self.fail_command(&command_id, &e));
        }

        let app_context = self
            .db
            .most_used_apps(100)
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.app_name)
            .collect::<Vec<_>>()
            .join(", ");

        let response = match self.client.think(text, &app_context) {
            Ok(response) => response,
            Err(e) => return Ok(self.fail_command(&command_id, &e)),
        };

        if !response.success {
            let error = AgentError::Parse(
                response
                    .error
                    .unwrap_or_else(|| "model produced no usable intent".to_string()),
            );
            let _ = self.db.save_conversation(text, &serde_json::Value::Null, None, false);
            return Ok(self.fail_command(&command_id, &error));
        }

        let payload = response.response.unwrap_or(serde_json::Value::Null);
        let commands = Command::from_model_response(&payload);
        let first_intent = commands.first().map(|c| c.intent.as_str());
        let _ = self
            .db
            .save_conversation(text, &payload, first_intent, true);

        self.process_commands(&command_id, text, commands)
    }

    /// Pipeline entry for already-parsed commands (watcher and scheduler
    /// re-entry, clarification replays, tests). Not rate limited.
    pub fn submit_commands(&self, raw_input: &str, commands: Vec<Command>) -> Result<RequestOutcome> {
        let command_id = self.registry.register(raw_input, commands.first());
        self.state.init(&command_id);
        self.state
            .transition(&command_id, ExecutionState::Parsing, "received", None);
        self.process_commands(&command_id, raw_input, commands)
    }

    pub fn get_status(&self, command_id: &str) -> Option<ExecutionStatus> {
        self.state.get(command_id)
    }

    pub fn recent_commands(&self, count: usize) -> Vec<crate::registry::CommandRecord> {
        self.registry.get_recent(count)
    }

    pub fn list_watches(&self) -> Vec<WatchTask> {
        self.watcher.list()
    }

    pub fn stop_watch(&self, watch_id: &str) -> bool {
        self.watcher.stop_watch(watch_id)
    }

    pub fn stop_all_watches(&self) -> usize {
        self.watcher.stop_all()
    }

    pub fn list_scheduled(&self) -> Result<Vec<crate::scheduler::ScheduledTask>> {
        self.scheduler.pending_tasks()
    }

    pub fn cancel_scheduled(&self, task_id: i64) -> Result<bool> {
        self.scheduler.cancel_task(task_id)
    }

    pub fn set_profile(&self, profile: Profile) -> Result<()> {
        self.policy.set_profile(profile);
        self.config.lock().unwrap().set_profile(profile.as_str())
    }

    pub fn current_profile(&self) -> Profile {
        self.policy.current_profile()
    }

    /// Live status updates for every command (UI feed).
    pub fn subscribe_updates(&self) -> Receiver<ExecutionStatus> {
        self.state.subscribe_all()
    }

    pub fn subscribe_notifications(&self) -> Receiver<crate::notifications::Notification> {
        self.notifier.subscribe()
    }

    /// Cancel a running command: no new nodes start; in-flight actions
    /// finish on their own.
    pub fn cancel_command(&self, command_id: &str) -> bool {
        if let Some(flag) = self.cancel_flags.lock().unwrap().get(command_id) {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        let cancelled = self.state.cancel(command_id);
        if cancelled {
            self.registry
                .update_status(command_id, CommandStatus::Cancelled, None, None);
        }
        cancelled
    }

    /// Undo a completed command, newest record first.
    pub fn rollback_command(&self, command_id: &str) -> Result<RollbackResult> {
        let record = self
            .registry
            .get(command_id)
            .ok_or_else(|| AgentError::Rollback(format!("unknown command {}", command_id)))?;
        if !record.rollback_available {
            return Err(AgentError::Rollback(format!(
                "{} has nothing to roll back",
                command_id
            )));
        }

        self.state.request_rollback(command_id);
        let result = self.rollback.rollback(command_id);

        if result.success {
            self.state
                .transition(command_id, ExecutionState::RolledBack, "rolled back", None);
            self.registry
                .update_status(command_id, CommandStatus::RolledBack, None, None);
            self.registry.set_rollback_available(command_id, false);
            self.notifier.success(
                "rollback",
                &format!("{}: reversed {} records", command_id, result.rolled_back),
            );
        } else {
            self.state.transition(
                command_id,
                ExecutionState::Failed,
                &result.errors.join("; "),
                None,
            );
            self.notifier.error(
                "rollback",
                &format!(
                    "{}: reversed {} records, {} failed",
                    command_id, result.rolled_back, result.failed
                ),
            );
        }

        Ok(result)
    }

    /// Evict aged trash folders per the configured retention window.
    pub fn clear_trash(&self) -> Result<usize> {
        let days = self.config.lock().unwrap().config().trash_retention_days;
        self.rollback.clear_trash(days)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ── clarification & confirmation replies ─────────────────────────

    pub fn answer_clarification(&self, command_id: &str, reply: &str) -> Result<RequestOutcome> {
        let pending = self
            .pending_clarifications
            .lock()
            .unwrap()
            .remove(command_id)
            .ok_or_else(|| {
                AgentError::Validation(format!("no open question for {}", command_id))
            })?;

        let generator = crate::clarification::ClarificationGenerator::new();
        match generator.parse_response(reply, &pending.clarification) {
            UserReply::Confirm(resolution) => {
                self.decision
                    .learn_resolution(&pending.command, &resolution)?;
                let merged = merge_resolution(&pending.command, &resolution);
                self.process_commands(command_id, &pending.raw_input, vec![merged])
            }
            UserReply::Update(update) => {
                let merged = merge_resolution(&pending.command, &update);
                self.decision.learn_resolution(&pending.command, &update)?;
                self.process_commands(command_id, &pending.raw_input, vec![merged])
            }
            UserReply::Cancel => {
                self.registry
                    .update_status(command_id, CommandStatus::Cancelled, None, None);
                self.state.cancel(command_id);
                Ok(RequestOutcome::Cancelled {
                    command_id: command_id.to_string(),
                })
            }
            UserReply::Unknown => {
                let clarification = pending.clarification.clone();
                self.pending_clarifications
                    .lock()
                    .unwrap()
                    .insert(command_id.to_string(), pending);
                Ok(RequestOutcome::NeedsClarification {
                    command_id: command_id.to_string(),
                    clarification,
                })
            }
        }
    }

    pub fn confirm_execution(&self, command_id: &str) -> Result<RequestOutcome> {
        let pending = self
            .pending_confirmations
            .lock()
            .unwrap()
            .remove(command_id)
            .ok_or_else(|| {
                AgentError::Validation(format!("nothing awaiting confirmation for {}", command_id))
            })?;

        self.execute_pipeline(
            command_id,
            &pending.raw_input,
            pending.commands,
            pending.dry_run,
            pending.notice,
        )
    }

    pub fn reject_execution(&self, command_id: &str) -> Result<RequestOutcome> {
        self.pending_confirmations
            .lock()
            .unwrap()
            .remove(command_id)
            .ok_or_else(|| {
                AgentError::Validation(format!("nothing awaiting confirmation for {}", command_id))
            })?;

        self.registry
            .update_status(command_id, CommandStatus::Cancelled, None, None);
        self.state.cancel(command_id);
        Ok(RequestOutcome::Cancelled {
            command_id: command_id.to_string(),
        })
    }

    // ── pipeline internals ───────────────────────────────────────────

    fn process_commands(
        &self,
        command_id: &str,
        raw_input: &str,
        commands: Vec<Command>,
    ) -> Result<RequestOutcome> {
        let commands: Vec<Command> = commands
            .into_iter()
            .filter(|c| c.intent != Intent::Unknown)
            .collect();

        if commands.is_empty() {
            self.registry.update_status(
                command_id,
                CommandStatus::Failed,
                None,
                Some("could not understand the request".to_string()),
            );
            self.state
                .set_error(command_id, "could not understand the request");
            return Ok(RequestOutcome::Unknown {
                command_id: command_id.to_string(),
            });
        }

        self.registry
            .set_intent(command_id, commands[0].intent.as_str());

        // Deferred intents go straight to the scheduler; they re-enter
        // the pipeline when they fire.
        if commands.len() == 1
            && matches!(commands[0].intent, Intent::Schedule | Intent::Reminder)
        {
            return self.handle_schedule(command_id, raw_input, &commands[0]);
        }

        // Completion and the execute/notify/ask decision
        let chain = self.decision.resolve_chain(&commands)?;

        if !chain.execute {
            let first_low = chain
                .decisions
                .iter()
                .find(|d| matches!(d.action, DecisionAction::Ask(_)));
            if let (Some(decision), Some(clarification)) = (first_low, chain.ask.clone()) {
                self.pending_clarifications.lock().unwrap().insert(
                    command_id.to_string(),
                    PendingClarification {
                        raw_input: raw_input.to_string(),
                        command: decision.command.clone(),
                        clarification: clarification.clone(),
                    },
                );
                return Ok(RequestOutcome::NeedsClarification {
                    command_id: command_id.to_string(),
                    clarification,
                });
            }

            self.registry.update_status(
                command_id,
                CommandStatus::Failed,
                None,
                Some("confidence too low to act".to_string()),
            );
            self.state.set_error(command_id, "confidence too low to act");
            return Ok(RequestOutcome::Unknown {
                command_id: command_id.to_string(),
            });
        }

        let notice = chain.decisions.iter().find_map(|d| match &d.action {
            DecisionAction::ExecuteWithNotice(notice) => Some(notice.clone()),
            _ => None,
        });

        let mut completed: Vec<Command> = chain.decisions.into_iter().map(|d| d.command).collect();
        for command in &mut completed {
            // A watch is aimed at its folder; carry it in target too so
            // plan validation has something to hold on to.
            if command.intent == Intent::Watch
                && command.target.as_deref().map_or(true, str::is_empty)
            {
                command.target = command.loc.clone();
            }
        }

        // Policy gate: first failure blocks the whole chain
        self.state.transition(
            command_id,
            ExecutionState::PolicyCheck,
            "checking policies",
            None,
        );

        let mut require_confirm = false;
        let mut force_dry_run = false;
        for command in &completed {
            let verdict = self.policy.evaluate(command);
            self.audit.log_policy_decision(
                command_id,
                command.intent.as_str(),
                verdict.allowed,
                &verdict.reason,
            );

            if !verdict.allowed {
                self.registry.update_status(
                    command_id,
                    CommandStatus::Failed,
                    None,
                    Some(verdict.reason.clone()),
                );
                self.state.transition(
                    command_id,
                    ExecutionState::PolicyBlocked,
                    &verdict.reason,
                    None,
                );
                self.notifier.warning("blocked", &verdict.reason);
                return Ok(RequestOutcome::Blocked {
                    command_id: command_id.to_string(),
                    reason: verdict.reason,
                });
            }

            require_confirm |= verdict.require_confirm;
            force_dry_run |= verdict.force_dry_run;
        }

        if require_confirm {
            let question = format!(
                "تنفيذ {} ({} خطوة)؟",
                completed[0].intent.as_str(),
                completed.len()
            );
            self.pending_confirmations.lock().unwrap().insert(
                command_id.to_string(),
                PendingConfirmation {
                    raw_input: raw_input.to_string(),
                    commands: completed,
                    dry_run: force_dry_run,
                    notice,
                },
            );
            return Ok(RequestOutcome::NeedsConfirmation {
                command_id: command_id.to_string(),
                question,
            });
        }

        self.execute_pipeline(command_id, raw_input, completed, force_dry_run, notice)
    }

    fn execute_pipeline(
        &self,
        command_id: &str,
        raw_input: &str,
        commands: Vec<Command>,
        dry_run: bool,
        notice: Option<String>,
    ) -> Result<RequestOutcome> {
        // Plan: build, validate, seal
        let mut plan = self.planner.create_plan(command_id, raw_input, &commands);
        if let Err(e) = self.planner.validate(&mut plan) {
            return Ok(self.fail_command(command_id, &e));
        }
        for warning in &plan.warnings {
            self.notifier.warning("plan", warning);
        }
        if let Err(e) = self.planner.freeze(&mut plan) {
            return Ok(self.fail_command(command_id, &e));
        }

        // Seal verification gates execution; a mismatch means no effect
        let steps = match self.planner.prepare_for_execution(&mut plan) {
            Ok(steps) => steps,
            Err(e) => return Ok(self.fail_command(command_id, &e)),
        };

        // Graph: build, repair what is repairable, then enforce rules
        let mut graph = GraphBuilder::build(&steps);
        self.repair.repair(&mut graph);
        if let Err(e) = self.rules.validate(&graph) {
            self.planner.mark_completed(&mut plan, false);
            return Ok(self.fail_command(command_id, &e));
        }

        self.registry.set_nodes_count(command_id, graph.len());
        self.state.transition(
            command_id,
            ExecutionState::GraphBuilt,
            &format!("{} nodes", graph.len()),
            None,
        );

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .unwrap()
            .insert(command_id.to_string(), cancel.clone());

        // The runner feeds the state machine through this hop; node code
        // itself never touches subscribers.
        let state = self.state.clone();
        let progress = move |event: RunnerEvent| match event.status {
            NodeStatus::Running => {
                state.transition(
                    &event.command_id,
                    ExecutionState::NodeRunning,
                    &format!("running {}", event.node_id),
                    Some(&event.node_id),
                );
                state.update_progress(
                    &event.command_id,
                    event.completed,
                    event.total,
                    Some(&event.node_id),
                );
            }
            NodeStatus::Done => {
                state.transition(
                    &event.command_id,
                    ExecutionState::NodeDone,
                    &event.message,
                    Some(&event.node_id),
                );
                state.update_progress(
                    &event.command_id,
                    event.completed,
                    event.total,
                    Some(&event.node_id),
                );
            }
            _ => {}
        };

        self.registry
            .update_status(command_id, CommandStatus::Processing, None, None);

        let progress: &crate::runner::ProgressFn = &progress;
        let result = self
            .runner
            .run(command_id, &mut graph, dry_run, &cancel, Some(progress));

        self.cancel_flags.lock().unwrap().remove(command_id);
        self.planner.mark_completed(&mut plan, result.success);

        if result.success {
            for command in &commands {
                if command.intent == Intent::Open {
                    let _ = self.db.track_app_usage(command.target_str());
                }
            }

            let message = format!("{}/{} nodes committed", result.completed, result.total);
            self.registry.update_status(
                command_id,
                CommandStatus::Completed,
                Some(message.clone()),
                None,
            );
            self.registry
                .set_rollback_available(command_id, self.rollback.has_rollback(command_id));
            self.state
                .transition(command_id, ExecutionState::Completed, &message, None);
            self.notifier.success("deskpilot", &message);
            let _ = self
                .db
                .save_event("command_completed", &message, Some(command_id));

            return Ok(match notice {
                Some(notice) => {
                    self.notifier.info("deskpilot", &notice);
                    RequestOutcome::CompletedWithNotice {
                        command_id: command_id.to_string(),
                        message,
                        notice,
                    }
                }
                None => RequestOutcome::Completed {
                    command_id: command_id.to_string(),
                    message,
                },
            });
        }

        let error = result
            .error
            .unwrap_or_else(|| "execution failed".to_string());

        if error == "cancelled" {
            self.registry
                .update_status(command_id, CommandStatus::Cancelled, None, None);
            self.state.cancel(command_id);
            return Ok(RequestOutcome::Cancelled {
                command_id: command_id.to_string(),
            });
        }

        // Node failure: record it, then reverse whatever already ran
        self.state.set_error(command_id, &error);
        let rollback_result = if self.rollback.has_rollback(command_id) {
            self.state.transition(
                command_id,
                ExecutionState::RollingBack,
                "undoing partial work",
                None,
            );
            let rollback_result = self.rollback.rollback(command_id);
            if rollback_result.success {
                self.state.transition(
                    command_id,
                    ExecutionState::RolledBack,
                    "partial work undone",
                    None,
                );
                self.registry.update_status(
                    command_id,
                    CommandStatus::RolledBack,
                    None,
                    Some(error.clone()),
                );
            } else {
                self.registry.update_status(
                    command_id,
                    CommandStatus::Failed,
                    None,
                    Some(error.clone()),
                );
            }
            Some(rollback_result)
        } else {
            self.registry
                .update_status(command_id, CommandStatus::Failed, None, Some(error.clone()));
            None
        };

        let rolled_back = rollback_result.as_ref().map(|r| r.rolled_back).unwrap_or(0);
        let failed_node = result.failed_node.unwrap_or_default();
        self.notifier.error(
            "deskpilot",
            &format!(
                "{} at {} - rolled back {} records",
                error, failed_node, rolled_back
            ),
        );

        Ok(RequestOutcome::Failed {
            command_id: command_id.to_string(),
            error,
            rolled_back,
        })
    }

    fn handle_schedule(
        &self,
        command_id: &str,
        raw_input: &str,
        command: &Command,
    ) -> Result<RequestOutcome> {
        let verdict = self.policy.evaluate(command);
        if !verdict.allowed {
            self.registry.update_status(
                command_id,
                CommandStatus::Failed,
                None,
                Some(verdict.reason.clone()),
            );
            self.state
                .transition(command_id, ExecutionState::PolicyCheck, "", None);
            self.state.transition(
                command_id,
                ExecutionState::PolicyBlocked,
                &verdict.reason,
                None,
            );
            return Ok(RequestOutcome::Blocked {
                command_id: command_id.to_string(),
                reason: verdict.reason,
            });
        }

        let delay = command
            .delay
            .as_deref()
            .and_then(parse_delay)
            .or_else(|| parse_delay(raw_input));
        let time_str = command
            .time
            .clone()
            .or_else(|| crate::scheduler::parse_time(raw_input));
        let repeat = command
            .repeat
            .as_deref()
            .map(Repeat::parse)
            .unwrap_or(Repeat::Once);

        let task_id = if command.intent == Intent::Reminder {
            let message = command
                .param
                .clone()
                .or_else(|| command.target.clone())
                .unwrap_or_else(|| raw_input.to_string());
            self.scheduler.add_task(
                "reminder",
                None,
                delay.or(Some(60)),
                time_str.as_deref(),
                repeat,
                Some(serde_json::json!({"message": message})),
            )?
        } else {
            let data = serde_json::json!({
                "intent": "open",
                "target": command.target.clone().unwrap_or_default(),
            });
            self.scheduler.add_task(
                "open",
                None,
                delay,
                time_str.as_deref(),
                repeat,
                Some(data),
            )?
        };

        let message = format!("task #{} scheduled", task_id);
        self.registry.update_status(
            command_id,
            CommandStatus::Completed,
            Some(message.clone()),
            None,
        );
        self.notifier.info("scheduler", &message);

        Ok(RequestOutcome::Scheduled {
            command_id: command_id.to_string(),
            task_id,
        })
    }

    fn fail_command(&self, command_id: &str, error: &AgentError) -> RequestOutcome {
        let message = format!("{} ({})", error, error.kind());
        self.registry.update_status(
            command_id,
            CommandStatus::Failed,
            None,
            Some(message.clone()),
        );
        self.state.set_error(command_id, &message);
        self.notifier.error("deskpilot", &message);
        RequestOutcome::Failed {
            command_id: command_id.to_string(),
            error: message,
            rolled_back: 0,
        }
    }

    // ── re-entry points ──────────────────────────────────────────────

    fn on_watch_fired(&self, fired: WatchFired) {
        self.notifier.warning("watcher", &fired.message);
        let _ = self
            .db
            .save_event("watch_fired", &fired.message, Some(&fired.file_path));

        if let Some(command) = fired.command {
            // Reactive commands face the same gates as typed ones
            let raw = format!("[watch {}] {}", fired.watch_id, fired.file_name);
            if let Err(e) = self.submit_commands(&raw, vec![command]) {
                log_event(
                    LogLevel::Error,
                    "WATCHER",
                    "reentry_failed",
                    serde_json::json!({"watch_id": fired.watch_id, "error": e.to_string()}),
                );
            }
        }
    }

    fn on_task_due(&self, due: DueTask) {
        if due.command == "reminder" {
            let message = due.data["message"].as_str().unwrap_or("reminder").to_string();
            self.notifier.warning("تذكير", &message);
            let _ = self.db.save_event("reminder_fired", &message, None);
            return;
        }

        let mut payload = due.data.clone();
        if payload.get("intent").is_none() {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert(
                    "intent".to_string(),
                    serde_json::Value::String(due.command.clone()),
                );
            }
        }

        let command = Command::from_wire(&payload);
        let raw = format!("[scheduled #{}] {}", due.id, due.command);
        if let Err(e) = self.submit_commands(&raw, vec![command]) {
            log_event(
                LogLevel::Error,
                "SCHEDULER",
                "reentry_failed",
                serde_json::json!({"task_id": due.id, "error": e.to_string()}),
            );
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.supervisor.stop();
        self.watcher.stop_all();
    }
}

fn merge_resolution(command: &Command, resolution: &HashMap<String, String>) -> Command {
    let mut merged = command.clone();
    for (field, value) in resolution {
        match field.as_str() {
            "target" => merged.target = Some(value.clone()),
            "loc" => merged.loc = Some(value.clone()),
            "destination" => merged.destination = Some(value.clone()),
            _ => {}
        }
    }
    merged
}
