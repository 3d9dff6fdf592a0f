//! Confidence Calculator - scores a completed command on a fixed rubric.
//!
//! ≥ 0.75 execute, 0.5–0.75 execute with a notice, < 0.5 ask.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::command::{Command, Intent};
use crate::world_model::ContextMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone)]
pub struct ConfidenceScore {
    pub score: f64,
    pub level: ConfidenceLevel,
    pub factors: HashMap<&'static str, f64>,
    pub missing: Vec<String>,
    pub inferred: Vec<(String, String)>,
}

impl ConfidenceScore {
    pub fn should_execute(&self) -> bool {
        self.score >= 0.5
    }

    pub fn should_notify(&self) -> bool {
        self.score >= 0.5 && self.score < 0.75
    }

    pub fn should_ask(&self) -> bool {
        self.score < 0.5
    }
}

// Weights sum to 1.0. Inferred fields count at half weight.
const W_INTENT_EXPLICIT: f64 = 0.20;
const W_TARGET_EXPLICIT: f64 = 0.20;
const W_LOCATION_EXPLICIT: f64 = 0.15;
const W_HAS_DEFAULT: f64 = 0.15;
const W_CONTEXT_AVAILABLE: f64 = 0.10;
const W_PATTERN_MATCH: f64 = 0.10;
const W_ROLLBACK_AVAILABLE: f64 = 0.10;

/// Bump applied when a learned pattern filled the blanks.
const LEARNED_PATTERN_BOOST: f64 = 0.15;

// Intent pairs that commonly follow each other.
const KNOWN_SEQUENCES: &[(Intent, Intent)] = &[
    (Intent::Watch, Intent::CreateFolder),
    (Intent::Watch, Intent::CreateFile),
    (Intent::Open, Intent::WriteFile),
    (Intent::CreateFolder, Intent::CreateFile),
];

pub struct ConfidenceCalculator;

impl ConfidenceCalculator {
    pub fn new() -> Self {
        Self
    }

    pub fn calculate(&self, command: &Command, context: &ContextMemory) -> ConfidenceScore {
        let mut factors = HashMap::new();
        let mut missing = Vec::new();
        let mut inferred = Vec::new();

        if command.intent != Intent::Unknown {
            factors.insert("intent_explicit", W_INTENT_EXPLICIT);
        } else {
            missing.push("intent".to_string());
        }

        match command.target.as_deref().filter(|t| !t.is_empty() && *t != "?") {
            Some(target) if command.inferred_target => {
                factors.insert("target_explicit", W_TARGET_EXPLICIT * 0.5);
                inferred.push(("target".to_string(), target.to_string()));
            }
            Some(_) => {
                factors.insert("target_explicit", W_TARGET_EXPLICIT);
            }
            None => missing.push("target".to_string()),
        }

        match command.loc.as_deref().filter(|l| !l.is_empty() && *l != "?") {
            Some(loc) if command.inferred_loc => {
                factors.insert("location_explicit", W_LOCATION_EXPLICIT * 0.5);
                inferred.push(("loc".to_string(), loc.to_string()));
            }
            Some(_) => {
                factors.insert("location_explicit", W_LOCATION_EXPLICIT);
            }
            None => missing.push("location".to_string()),
        }

        if command.inferred_loc || command.inferred_target {
            factors.insert("has_default", W_HAS_DEFAULT);
        }

        if context.last_intent.is_some() || context.last_location.is_some() {
            factors.insert("context_available", W_CONTEXT_AVAILABLE);
        }

        if let Some(last) = context.last_intent {
            if KNOWN_SEQUENCES.contains(&(last, command.intent)) {
                factors.insert("pattern_match", W_PATTERN_MATCH);
            }
        }

        if command.intent.rollback_safe() {
            factors.insert("rollback_available", W_ROLLBACK_AVAILABLE);
        }

        let mut score: f64 = factors.values().sum();

        if command.learning_pattern.is_some() {
            score += LEARNED_PATTERN_BOOST;
        }

        let score = (score.clamp(0.0, 1.0) * 100.0).round() / 100.0;

        ConfidenceScore {
            score,
            level: Self::level_for(score),
            factors,
            missing,
            inferred,
        }
    }

    fn level_for(score: f64) -> ConfidenceLevel {
        if score >= 0.75 {
            ConfidenceLevel::High
        } else if score >= 0.5 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

impl Default for ConfidenceCalculator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explicit_create() -> Command {
        Command::new(Intent::CreateFolder)
            .with_target("مشروعي")
            .with_loc("desktop")
    }

    #[test]
    fn test_fully_explicit_scores_all_base_factors() {
        let calc = ConfidenceCalculator::new();
        let score = calc.calculate(&explicit_create(), &ContextMemory::default());

        // intent 0.20 + target 0.20 + loc 0.15 + rollback 0.10 = 0.65
        assert!((score.score - 0.65).abs() < 1e-9);
        assert!(score.should_execute());
    }

    #[test]
    fn test_explicit_with_context_is_high() {
        let calc = ConfidenceCalculator::new();
        let ctx = ContextMemory {
            last_intent: Some(Intent::CreateFolder),
            last_location: Some("desktop".to_string()),
            watch_target: None,
        };

        let cmd = Command::new(Intent::CreateFile)
            .with_target("notes.txt")
            .with_loc("desktop");
        let score = calc.calculate(&cmd, &ctx);

        // 0.20 + 0.20 + 0.15 + 0.10 context + 0.10 sequence + 0.10 rollback
        assert_eq!(score.level, ConfidenceLevel::High);
    }

    #[test]
    fn test_inferred_fields_count_half() {
        let calc = ConfidenceCalculator::new();
        let mut cmd = explicit_create();
        cmd.inferred_target = true;
        cmd.inferred_loc = true;

        let explicit_score = calc.calculate(&explicit_create(), &ContextMemory::default());
        let inferred_score = calc.calculate(&cmd, &ContextMemory::default());

        // half target + half loc but has_default kicks in
        assert!(inferred_score.score < explicit_score.score + W_HAS_DEFAULT);
        assert_eq!(inferred_score.inferred.len(), 2);
    }

    #[test]
    fn test_empty_command_is_low() {
        let calc = ConfidenceCalculator::new();
        let score = calc.calculate(&Command::new(Intent::Unknown), &ContextMemory::default());

        assert_eq!(score.level, ConfidenceLevel::Low);
        assert!(score.should_ask());
        assert!(score.missing.contains(&"intent".to_string()));
    }

    #[test]
    fn test_learned_pattern_bumps_score() {
        let calc = ConfidenceCalculator::new();
        let mut cmd = explicit_create();
        let base = calc.calculate(&cmd, &ContextMemory::default()).score;

        cmd.learning_pattern = Some("abcd1234".to_string());
        let bumped = calc.calculate(&cmd, &ContextMemory::default()).score;

        assert!((bumped - base - LEARNED_PATTERN_BOOST).abs() < 1e-9);
    }

    #[test]
    fn test_score_clamped_to_one() {
        let calc = ConfidenceCalculator::new();
        let ctx = ContextMemory {
            last_intent: Some(Intent::CreateFolder),
            last_location: Some("desktop".to_string()),
            watch_target: None,
        };
        let mut cmd = Command::new(Intent::CreateFile)
            .with_target("notes.txt")
            .with_loc("desktop");
        cmd.learning_pattern = Some("abcd1234".to_string());

        let score = calc.calculate(&cmd, &ctx);
        assert!(score.score <= 1.0);
    }
}
