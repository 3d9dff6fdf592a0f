//! Policy Engine - central authorisation for every intent.
//!
//! Flow: Command → path safety → always-blocked paths → policy blocked
//! paths → profile membership → confirmation / dry-run flags.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::command::{Command, Intent};
use crate::paths::SystemPaths;
use crate::security::{AuditLogger, PathSecurityChecker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Safe,
    Power,
    Silent,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Safe => "safe",
            Profile::Power => "power",
            Profile::Silent => "silent",
        }
    }

    pub fn parse(s: &str) -> Option<Profile> {
        match s {
            "safe" => Some(Profile::Safe),
            "power" => Some(Profile::Power),
            "silent" => Some(Profile::Silent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub intent: Intent,
    pub risk: RiskLevel,
    pub requires_confirmation: bool,
    pub allowed_profiles: Vec<Profile>,
    pub blocked_paths: Vec<String>,
    pub max_items: Option<usize>,
}

impl Policy {
    fn new(intent: Intent, risk: RiskLevel) -> Self {
        Self {
            intent,
            risk,
            requires_confirmation: false,
            allowed_profiles: vec![Profile::Safe, Profile::Power, Profile::Silent],
            blocked_paths: Vec::new(),
            max_items: None,
        }
    }

    fn confirm(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    fn profiles(mut self, profiles: &[Profile]) -> Self {
        self.allowed_profiles = profiles.to_vec();
        self
    }
}

/// The verdict for one command.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub require_confirm: bool,
    pub force_dry_run: bool,
    pub risk: RiskLevel,
    pub warnings: Vec<String>,
}

impl PolicyDecision {
    fn blocked(reason: String, risk: RiskLevel) -> Self {
        Self {
            allowed: false,
            reason,
            require_confirm: false,
            force_dry_run: false,
            risk,
            warnings: Vec::new(),
        }
    }
}

pub struct PolicyEngine {
    policies: Mutex<HashMap<Intent, Policy>>,
    profile: Mutex<Profile>,
    checker: PathSecurityChecker,
    paths: Arc<SystemPaths>,
    audit: Arc<AuditLogger>,
}

impl PolicyEngine {
    pub fn new(paths: Arc<SystemPaths>, audit: Arc<AuditLogger>, profile: Profile) -> Self {
        let engine = Self {
            policies: Mutex::new(HashMap::new()),
            profile: Mutex::new(profile),
            checker: PathSecurityChecker::new(),
            paths,
            audit,
        };
        engine.load_default_policies();
        engine
    }

    fn load_default_policies(&self) {
        let defaults = [
            Policy::new(Intent::Open, RiskLevel::Low),
            Policy::new(Intent::OpenFile, RiskLevel::Low),
            Policy::new(Intent::CreateFolder, RiskLevel::Low),
            Policy::new(Intent::CreateFile, RiskLevel::Low),
            Policy::new(Intent::WriteFile, RiskLevel::Medium),
            Policy::new(Intent::Delete, RiskLevel::High)
                .confirm()
                .profiles(&[Profile::Power, Profile::Silent]),
            Policy::new(Intent::Rename, RiskLevel::Medium),
            Policy::new(Intent::Move, RiskLevel::Medium),
            Policy::new(Intent::Copy, RiskLevel::Low),
            Policy::new(Intent::Macro, RiskLevel::Low),
            Policy::new(Intent::Watch, RiskLevel::Low),
            Policy::new(Intent::StopWatch, RiskLevel::Low),
            Policy::new(Intent::Schedule, RiskLevel::Medium),
            Policy::new(Intent::Reminder, RiskLevel::Low),
            {
                let mut p = Policy::new(Intent::Clean, RiskLevel::Medium);
                p.max_items = Some(500);
                p
            },
        ];

        let mut policies = self.policies.lock().unwrap();
        for policy in defaults {
            policies.insert(policy.intent, policy);
        }
    }

    pub fn current_profile(&self) -> Profile {
        *self.profile.lock().unwrap()
    }

    pub fn set_profile(&self, profile: Profile) {
        let mut current = self.profile.lock().unwrap();
        if *current != profile {
            self.audit
                .log_profile_change(current.as_str(), profile.as_str());
            *current = profile;
        }
    }

    pub fn add_policy(&self, policy: Policy) {
        self.policies.lock().unwrap().insert(policy.intent, policy);
    }

    pub fn get_policy(&self, intent: Intent) -> Option<Policy> {
        self.policies.lock().unwrap().get(&intent).cloned()
    }

    /// Evaluate one command against the active profile. First failing
    /// check wins; a blocked decision means no side effect may happen.
    pub fn evaluate(&self, command: &Command) -> PolicyDecision {
        let profile = self.current_profile();
        let policy = match self.get_policy(command.intent) {
            Some(p) => p,
            None => {
                return PolicyDecision {
                    allowed: true,
                    reason: "intent not in policy table, proceeding with caution".to_string(),
                    require_confirm: false,
                    force_dry_run: false,
                    risk: RiskLevel::Medium,
                    warnings: vec!["no policy registered for intent".to_string()],
                }
            }
        };

        // 1+2. Raw-input and resolved-path safety (traversal, system
        // paths, wildcards). The raw target is checked before resolution
        // so encoded traversal never survives normalisation.
        let raw_target = command.target_str();
        let resolved = self.resolve_full_path(command);

        for candidate in [raw_target.to_string(), resolved.clone()] {
            let result = self.checker.check_path(&candidate);
            if !result.safe {
                self.audit.log_threat(
                    result.threat_type.unwrap_or("UNKNOWN"),
                    &candidate,
                    true,
                );
                return PolicyDecision::blocked(result.message, RiskLevel::Critical);
            }
        }

        // 3. Policy-specific blocked paths
        for blocked in &policy.blocked_paths {
            if let Ok(pattern) = Regex::new(blocked) {
                if pattern.is_match(&resolved) {
                    return PolicyDecision::blocked(
                        format!("path blocked by policy: {}", blocked),
                        RiskLevel::High,
                    );
                }
            }
        }

        // 4. Profile membership
        if !policy.allowed_profiles.contains(&profile) {
            return PolicyDecision::blocked(
                format!("{} is not allowed in {} mode", command.intent.as_str(), profile.as_str()),
                policy.risk,
            );
        }

        let mut require_confirm = policy.requires_confirmation;
        let mut force_dry_run = false;
        let mut warnings = Vec::new();

        match profile {
            Profile::Safe => {
                require_confirm = true;
                if policy.risk >= RiskLevel::Medium {
                    force_dry_run = true;
                }
            }
            Profile::Power => {}
            Profile::Silent => {
                require_confirm = false;
            }
        }

        if policy.risk >= RiskLevel::High {
            warnings.push(format!("high-risk operation: {}", command.intent.as_str()));
        }

        PolicyDecision {
            allowed: true,
            reason: "allowed".to_string(),
            require_confirm,
            force_dry_run,
            risk: policy.risk,
            warnings,
        }
    }

    fn resolve_full_path(&self, command: &Command) -> String {
        let target = command.target_str();
        if target.is_empty() {
            return String::new();
        }
        if Path::new(target).is_absolute() {
            return target.to_string();
        }
        self.paths
            .resolve_target(target, command.loc_str())
            .display()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(profile: Profile) -> (PolicyEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditLogger::new(dir.path()));
        let engine = PolicyEngine::new(Arc::new(SystemPaths::new()), audit, profile);
        (engine, dir)
    }

    #[test]
    fn test_open_allowed_without_confirm() {
        let (engine, _dir) = engine(Profile::Power);
        let cmd = Command::new(Intent::Open).with_target("chrome");
        let decision = engine.evaluate(&cmd);

        assert!(decision.allowed);
        assert!(!decision.require_confirm);
    }

    #[test]
    fn test_delete_requires_confirm_in_power() {
        let (engine, _dir) = engine(Profile::Power);
        let cmd = Command::new(Intent::Delete)
            .with_target("old.txt")
            .with_loc("desktop");
        let decision = engine.evaluate(&cmd);

        assert!(decision.allowed);
        assert!(decision.require_confirm);
    }

    #[test]
    fn test_delete_blocked_in_safe_profile() {
        let (engine, _dir) = engine(Profile::Safe);
        let cmd = Command::new(Intent::Delete)
            .with_target("old.txt")
            .with_loc("desktop");
        let decision = engine.evaluate(&cmd);

        assert!(!decision.allowed);
    }

    #[test]
    fn test_system32_blocked_and_audited() {
        let (engine, dir) = engine(Profile::Power);
        let cmd = Command::new(Intent::Delete)
            .with_target("C:\\Windows\\System32\\file.txt");
        let decision = engine.evaluate(&cmd);

        assert!(!decision.allowed);
        assert_eq!(decision.risk, RiskLevel::Critical);

        let audit = std::fs::read_to_string(dir.path().join("security_audit.log")).unwrap();
        assert!(audit.contains("THREAT_DETECTED"));
    }

    #[test]
    fn test_traversal_blocked() {
        let (engine, _dir) = engine(Profile::Power);
        let cmd = Command::new(Intent::CreateFile)
            .with_target("../../../etc/passwd")
            .with_loc("desktop");
        let decision = engine.evaluate(&cmd);

        assert!(!decision.allowed);
    }

    #[test]
    fn test_safe_profile_forces_confirm_and_dry_run() {
        let (engine, _dir) = engine(Profile::Safe);
        let cmd = Command::new(Intent::WriteFile)
            .with_target("notes.txt")
            .with_loc("desktop");
        let decision = engine.evaluate(&cmd);

        assert!(decision.allowed);
        assert!(decision.require_confirm);
        assert!(decision.force_dry_run);
    }

    #[test]
    fn test_silent_profile_clears_confirm() {
        let (engine, _dir) = engine(Profile::Silent);
        let cmd = Command::new(Intent::Delete)
            .with_target("old.txt")
            .with_loc("desktop");
        let decision = engine.evaluate(&cmd);

        assert!(decision.allowed);
        assert!(!decision.require_confirm);
    }

    #[test]
    fn test_profile_switch_is_audited() {
        let (engine, dir) = engine(Profile::Safe);
        engine.set_profile(Profile::Power);

        let audit = std::fs::read_to_string(dir.path().join("security_audit.log")).unwrap();
        assert!(audit.contains("PROFILE_CHANGE"));
        assert_eq!(engine.current_profile(), Profile::Power);
    }
}
