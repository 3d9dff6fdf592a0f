//! Planner - builds, validates, hash-freezes and verifies execution plans.
//!
//! A frozen plan is sealed: `frozen_hash` is the SHA-256 of the canonical
//! JSON over (plan_id, command_id, ordered steps), truncated to 16 hex
//! chars. Any later mutation of a step is caught before execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::command::{Command, Intent};
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Validated,
    Frozen,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub index: usize,
    pub intent: Intent,
    pub target: String,
    pub location: String,
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub command_id: String,
    pub raw_input: String,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub frozen_at: Option<DateTime<Utc>>,
    pub frozen_hash: Option<String>,
    pub warnings: Vec<String>,
}

/// Accumulates steps from a command sequence.
pub struct PlanBuilder {
    steps: Vec<PlanStep>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn add_command(&mut self, command: &Command) -> &mut Self {
        let mut params = HashMap::new();
        if let Some(param) = &command.param {
            params.insert("param".to_string(), param.clone());
        }
        if let Some(dest) = &command.destination {
            params.insert("destination".to_string(), dest.clone());
        }
        if let Some(filter) = &command.filter_key {
            params.insert("filter_key".to_string(), filter.clone());
        }
        if let Some(action_type) = &command.action_type {
            params.insert("action_type".to_string(), action_type.clone());
        }
        if let Some(cmd) = &command.cmd {
            params.insert("cmd".to_string(), cmd.clone());
        }
        if let Some(watch_id) = &command.watch_id {
            params.insert("watch_id".to_string(), watch_id.clone());
        }
        if let Some(on_change) = &command.on_change {
            if let Ok(encoded) = serde_json::to_string(on_change) {
                params.insert("on_change".to_string(), encoded);
            }
        }

        self.steps.push(PlanStep {
            index: self.steps.len(),
            intent: command.intent,
            target: command.target_str().to_string(),
            location: command.loc_str().to_string(),
            params,
        });
        self
    }

    pub fn build(self, command_id: &str, raw_input: &str) -> ExecutionPlan {
        ExecutionPlan {
            plan_id: plan_id_for(command_id),
            command_id: command_id.to_string(),
            raw_input: raw_input.to_string(),
            steps: self.steps,
            status: PlanStatus::Draft,
            created_at: Utc::now(),
            frozen_at: None,
            frozen_hash: None,
            warnings: Vec::new(),
        }
    }
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// PLAN-<date>-<hex>, derived from the owning command id.
fn plan_id_for(command_id: &str) -> String {
    match command_id.strip_prefix("CMD-") {
        Some(suffix) => format!("PLAN-{}", suffix),
        None => format!("PLAN-{}", command_id),
    }
}

const MAX_STEPS_BEFORE_WARNING: usize = 10;

const PERMITTED_INTENTS: &[Intent] = &[
    Intent::Open,
    Intent::OpenFile,
    Intent::Clean,
    Intent::Watch,
    Intent::StopWatch,
    Intent::Macro,
    Intent::Schedule,
    Intent::Reminder,
    Intent::CreateFolder,
    Intent::CreateFile,
    Intent::WriteFile,
    Intent::Delete,
    Intent::Rename,
    Intent::Copy,
    Intent::Move,
];

const TARGET_REQUIRED: &[Intent] = &[
    Intent::Open,
    Intent::CreateFolder,
    Intent::CreateFile,
    Intent::WriteFile,
    Intent::Delete,
    Intent::Rename,
    Intent::Copy,
    Intent::Move,
    Intent::Watch,
];

pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Self
    }

    pub fn create_plan(
        &self,
        command_id: &str,
        raw_input: &str,
        commands: &[Command],
    ) -> ExecutionPlan {
        let mut builder = PlanBuilder::new();
        for command in commands {
            builder.add_command(command);
        }
        builder.build(command_id, raw_input)
    }

    /// Schema and safety rules. A valid plan transitions DRAFT → VALIDATED.
    pub fn validate(&self, plan: &mut ExecutionPlan) -> Result<()> {
        if plan.status != PlanStatus::Draft {
            return Err(AgentError::Validation(format!(
                "plan {} is not a draft",
                plan.plan_id
            )));
        }
        if plan.steps.is_empty() {
            return Err(AgentError::Validation("plan has no steps".to_string()));
        }

        for step in &plan.steps {
            if !PERMITTED_INTENTS.contains(&step.intent) {
                return Err(AgentError::Validation(format!(
                    "step {}: intent '{}' is not permitted in plans",
                    step.index,
                    step.intent.as_str()
                )));
            }

            if TARGET_REQUIRED.contains(&step.intent) && step.target.is_empty() {
                return Err(AgentError::Validation(format!(
                    "step {}: '{}' requires a target",
                    step.index,
                    step.intent.as_str()
                )));
            }

            if step.intent == Intent::Delete {
                let haystack = format!("{}/{}", step.location, step.target).to_lowercase();
                for protected in ["system32", "windows", "program files"] {
                    if haystack.contains(protected) {
                        return Err(AgentError::Validation(format!(
                            "step {}: delete targets protected area '{}'",
                            step.index, protected
                        )));
                    }
                }
            }
        }

        if plan.steps.len() > MAX_STEPS_BEFORE_WARNING {
            plan.warnings.push(format!(
                "large plan: {} steps, consider splitting",
                plan.steps.len()
            ));
        }

        plan.status = PlanStatus::Validated;
        Ok(())
    }

    /// Seal a validated plan. After this any step mutation is detectable.
    pub fn freeze(&self, plan: &mut ExecutionPlan) -> Result<()> {
        if plan.status != PlanStatus::Validated {
            return Err(AgentError::Validation(format!(
                "only validated plans can freeze, {} is {:?}",
                plan.plan_id, plan.status
            )));
        }

        plan.frozen_at = Some(Utc::now());
        plan.frozen_hash = Some(compute_hash(plan)?);
        plan.status = PlanStatus::Frozen;
        Ok(())
    }

    /// Verify the seal, then transition FROZEN → EXECUTING and hand back
    /// the steps. A hash mismatch leaves the plan FROZEN and untouched.
    pub fn prepare_for_execution(&self, plan: &mut ExecutionPlan) -> Result<Vec<PlanStep>> {
        if plan.status != PlanStatus::Frozen {
            return Err(AgentError::Validation(format!(
                "plan {} is not frozen",
                plan.plan_id
            )));
        }

        let expected = plan
            .frozen_hash
            .clone()
            .ok_or_else(|| AgentError::Integrity("frozen plan has no hash".to_string()))?;
        let actual = compute_hash(plan)?;

        if actual != expected {
            return Err(AgentError::Integrity(format!(
                "plan {} was modified after freezing (expected {}, got {})",
                plan.plan_id, expected, actual
            )));
        }

        plan.status = PlanStatus::Executing;
        Ok(plan.steps.clone())
    }

    pub fn mark_completed(&self, plan: &mut ExecutionPlan, success: bool) {
        plan.status = if success {
            PlanStatus::Completed
        } else {
            PlanStatus::Failed
        };
    }

    pub fn mark_cancelled(&self, plan: &mut ExecutionPlan) {
        plan.status = PlanStatus::Cancelled;
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical serialization: plan id, command id and the ordered steps
/// with params flattened to sorted key=value pairs.
fn compute_hash(plan: &ExecutionPlan) -> Result<String> {
    #[derive(Serialize)]
    struct CanonicalStep<'a> {
        index: usize,
        intent: &'a str,
        target: &'a str,
        location: &'a str,
        params: Vec<(String, String)>,
    }

    #[derive(Serialize)]
    struct CanonicalPlan<'a> {
        plan_id: &'a str,
        command_id: &'a str,
        steps: Vec<CanonicalStep<'a>>,
    }

    let canonical = CanonicalPlan {
        plan_id: &plan.plan_id,
        command_id: &plan.command_id,
        steps: plan
            .steps
            .iter()
            .map(|s| {
                let mut params: Vec<(String, String)> = s
                    .params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                params.sort();
                CanonicalStep {
                    index: s.index,
                    intent: s.intent.as_str(),
                    target: &s.target,
                    location: &s.location,
                    params,
                }
            })
            .collect(),
    };

    let encoded = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&encoded);
    Ok(hex::encode(digest)[..16].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder_then_file() -> Vec<Command> {
        vec![
            Command::new(Intent::CreateFolder)
                .with_target("مشروع")
                .with_loc("desktop"),
            Command::new(Intent::CreateFile)
                .with_target("notes.txt")
                .with_loc("مشروع"),
        ]
    }

    #[test]
    fn test_plan_id_derived_from_command_id() {
        let planner = Planner::new();
        let plan = planner.create_plan("CMD-20260801-8F3A", "test", &folder_then_file());
        assert_eq!(plan.plan_id, "PLAN-20260801-8F3A");
        assert_eq!(plan.status, PlanStatus::Draft);
    }

    #[test]
    fn test_validate_requires_target() {
        let planner = Planner::new();
        let mut plan = planner.create_plan(
            "CMD-20260801-0001",
            "",
            &[Command::new(Intent::Delete)],
        );
        assert!(planner.validate(&mut plan).is_err());
    }

    #[test]
    fn test_validate_rejects_protected_delete() {
        let planner = Planner::new();
        let mut plan = planner.create_plan(
            "CMD-20260801-0001",
            "",
            &[Command::new(Intent::Delete)
                .with_target("file.txt")
                .with_loc("C:\\Windows\\System32")],
        );
        assert!(planner.validate(&mut plan).is_err());
    }

    #[test]
    fn test_step_count_warning_boundary() {
        let planner = Planner::new();

        let ten: Vec<Command> = (0..10)
            .map(|i| {
                Command::new(Intent::CreateFile)
                    .with_target(&format!("f{}.txt", i))
                    .with_loc("desktop")
            })
            .collect();
        let mut plan = planner.create_plan("CMD-20260801-0001", "", &ten);
        planner.validate(&mut plan).unwrap();
        assert!(plan.warnings.is_empty());

        let eleven: Vec<Command> = (0..11)
            .map(|i| {
                Command::new(Intent::CreateFile)
                    .with_target(&format!("f{}.txt", i))
                    .with_loc("desktop")
            })
            .collect();
        let mut plan = planner.create_plan("CMD-20260801-0002", "", &eleven);
        planner.validate(&mut plan).unwrap();
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn test_freeze_and_verify() {
        let planner = Planner::new();
        let mut plan = planner.create_plan("CMD-20260801-0001", "", &folder_then_file());
        planner.validate(&mut plan).unwrap();
        planner.freeze(&mut plan).unwrap();

        let hash = plan.frozen_hash.clone().unwrap();
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));

        let steps = planner.prepare_for_execution(&mut plan).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(plan.status, PlanStatus::Executing);
    }

    #[test]
    fn test_tampered_plan_rejected() {
        let planner = Planner::new();
        let mut plan = planner.create_plan("CMD-20260801-0001", "", &folder_then_file());
        planner.validate(&mut plan).unwrap();
        planner.freeze(&mut plan).unwrap();

        plan.steps[0].target = "evil".to_string();

        let err = planner.prepare_for_execution(&mut plan).unwrap_err();
        assert_eq!(err.kind(), "IntegrityError");
        assert_eq!(plan.status, PlanStatus::Frozen);
    }

    #[test]
    fn test_freeze_requires_validation() {
        let planner = Planner::new();
        let mut plan = planner.create_plan("CMD-20260801-0001", "", &folder_then_file());
        assert!(planner.freeze(&mut plan).is_err());
    }
}
