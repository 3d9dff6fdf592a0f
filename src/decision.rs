//! Decision Engine - completes an intent and picks execute / notify / ask.
//!
//! Pipeline per command: learning store fills known blanks, the world
//! model fills the rest from defaults and context, the confidence
//! calculator scores the result, and the level decides what happens.

use std::collections::HashMap;
use std::sync::Arc;

use crate::clarification::{Clarification, ClarificationGenerator};
use crate::command::Command;
use crate::confidence::{ConfidenceCalculator, ConfidenceLevel, ConfidenceScore};
use crate::error::Result;
use crate::learning::LearningStore;
use crate::structured_log::{log_event, LogLevel};
use crate::world_model::WorldModel;

#[derive(Debug, Clone)]
pub enum DecisionAction {
    /// High confidence: run it.
    Execute,
    /// Medium confidence: run it, but tell the user what was inferred.
    ExecuteWithNotice(String),
    /// Low confidence: ask one question before touching anything.
    Ask(Clarification),
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub command: Command,
    pub score: ConfidenceScore,
    pub action: DecisionAction,
}

impl Decision {
    pub fn will_execute(&self) -> bool {
        !matches!(self.action, DecisionAction::Ask(_))
    }
}

pub struct DecisionEngine {
    world_model: Arc<WorldModel>,
    learning: Arc<LearningStore>,
    calculator: ConfidenceCalculator,
    clarifier: ClarificationGenerator,
}

impl DecisionEngine {
    pub fn new(world_model: Arc<WorldModel>, learning: Arc<LearningStore>) -> Self {
        Self {
            world_model,
            learning,
            calculator: ConfidenceCalculator::new(),
            clarifier: ClarificationGenerator::new(),
        }
    }

    /// Complete one command and decide.
    pub fn resolve(&self, command: &Command) -> Result<Decision> {
        let learned = self.learning.apply_to_command(command)?;
        let completed = self.world_model.complete_command(&learned);
        let context = self.world_model.context();
        let score = self.calculator.calculate(&completed, &context);

        // A learned pattern that filled the blanks has proven itself again.
        if let Some(pattern_id) = &completed.learning_pattern {
            self.learning.confirm_usage(pattern_id)?;
        }

        let action = match score.level {
            ConfidenceLevel::High => DecisionAction::Execute,
            ConfidenceLevel::Medium => {
                let inference = self.world_model.format_inference(&completed);
                if inference.is_empty() {
                    // Mid-band score but nothing was guessed: no notice owed
                    DecisionAction::Execute
                } else {
                    DecisionAction::ExecuteWithNotice(format!(
                        "{} | rollback is available if this was not what you meant",
                        inference
                    ))
                }
            }
            ConfidenceLevel::Low => {
                let mut suggestions = HashMap::new();
                if let Some(target) = &completed.target {
                    suggestions.insert("target".to_string(), target.clone());
                }
                if let Some(loc) = &completed.loc {
                    suggestions.insert("loc".to_string(), loc.clone());
                }
                let clarification =
                    self.clarifier
                        .generate(completed.intent, &score.missing, &suggestions);
                DecisionAction::Ask(clarification)
            }
        };

        log_event(
            LogLevel::Info,
            "DECISION",
            "resolved",
            serde_json::json!({
                "intent": completed.intent.as_str(),
                "confidence": score.score,
                "level": format!("{:?}", score.level),
                "asked": !matches!(action, DecisionAction::Execute | DecisionAction::ExecuteWithNotice(_)),
            }),
        );

        Ok(Decision {
            command: completed,
            score,
            action,
        })
    }

    /// Resolve a whole chain: confidence is averaged across the sequence,
    /// and the chain executes only if the average clears the bar.
    pub fn resolve_chain(&self, commands: &[Command]) -> Result<ChainDecision> {
        let mut decisions = Vec::with_capacity(commands.len());
        for command in commands {
            decisions.push(self.resolve(command)?);
        }

        let average = if decisions.is_empty() {
            0.0
        } else {
            decisions.iter().map(|d| d.score.score).sum::<f64>() / decisions.len() as f64
        };

        let execute = average >= 0.5;
        let ask = decisions
            .iter()
            .find_map(|d| match &d.action {
                DecisionAction::Ask(c) => Some(c.clone()),
                _ => None,
            })
            .filter(|_| !execute);

        Ok(ChainDecision {
            decisions,
            average_confidence: (average * 100.0).round() / 100.0,
            execute,
            ask,
        })
    }

    /// Record a user's answer to a clarification so the next identical
    /// gap fills itself.
    pub fn learn_resolution(
        &self,
        command: &Command,
        resolution: &HashMap<String, String>,
    ) -> Result<()> {
        let missing = command.missing_fields();
        if missing.is_empty() {
            return Ok(());
        }
        self.learning
            .learn(command.intent.as_str(), &missing, resolution)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ChainDecision {
    pub decisions: Vec<Decision>,
    pub average_confidence: f64,
    pub execute: bool,
    pub ask: Option<Clarification>,
}
