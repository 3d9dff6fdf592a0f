//! World Model - per-intent defaults and context inheritance.
//!
//! Fills the blanks the model left open: where ("desktop" unless the
//! previous step says otherwise) and what to call it (timestamped default
//! names), tagging every inferred field so the confidence calculator can
//! discount it.

use chrono::Local;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::command::{Command, Intent};

#[derive(Debug, Clone, Default)]
pub struct IntentDefaults {
    pub location: &'static str,
    pub name: &'static str,
    pub extension: &'static str,
}

/// Context carried between commands: last intent, last location and the
/// folder a `watch` was pointed at.
#[derive(Debug, Clone, Default)]
pub struct ContextMemory {
    pub last_intent: Option<Intent>,
    pub last_location: Option<String>,
    pub watch_target: Option<String>,
}

pub struct WorldModel {
    defaults: HashMap<Intent, IntentDefaults>,
    context: Mutex<ContextMemory>,
}

impl WorldModel {
    pub fn new() -> Self {
        let mut defaults = HashMap::new();

        defaults.insert(
            Intent::CreateFile,
            IntentDefaults {
                location: "desktop",
                name: "ملف_جديد",
                extension: ".txt",
            },
        );
        defaults.insert(
            Intent::CreateFolder,
            IntentDefaults {
                location: "desktop",
                name: "مجلد_جديد",
                extension: "",
            },
        );
        defaults.insert(
            Intent::Watch,
            IntentDefaults {
                location: "downloads",
                name: "",
                extension: "",
            },
        );
        defaults.insert(
            Intent::Clean,
            IntentDefaults {
                location: "downloads",
                name: "",
                extension: "",
            },
        );
        defaults.insert(
            Intent::Open,
            IntentDefaults {
                location: "",
                name: "chrome",
                extension: "",
            },
        );

        Self {
            defaults,
            context: Mutex::new(ContextMemory::default()),
        }
    }

    pub fn get_default(&self, intent: Intent) -> IntentDefaults {
        self.defaults.get(&intent).cloned().unwrap_or_default()
    }

    pub fn context(&self) -> ContextMemory {
        self.context.lock().unwrap().clone()
    }

    /// Record the last executed action for inheritance by later commands.
    pub fn set_last_action(&self, intent: Intent, location: Option<&str>) {
        let mut ctx = self.context.lock().unwrap();
        ctx.last_intent = Some(intent);
        if let Some(loc) = location {
            ctx.last_location = Some(loc.to_string());
            if intent == Intent::Watch {
                ctx.watch_target = Some(loc.to_string());
            }
        }
    }

    /// Resolution order: explicit, inherited from the previous step,
    /// last location used (for create-class intents), per-intent default.
    pub fn infer_location(&self, intent: Intent, explicit: Option<&str>) -> Option<String> {
        if let Some(loc) = explicit.filter(|l| !l.is_empty() && *l != "?") {
            return Some(loc.to_string());
        }

        let ctx = self.context.lock().unwrap();

        // watch downloads → the next create lands inside downloads
        if ctx.last_intent == Some(Intent::Watch)
            && matches!(intent, Intent::CreateFolder | Intent::CreateFile)
        {
            if let Some(watched) = &ctx.watch_target {
                return Some(watched.clone());
            }
        }

        if matches!(intent, Intent::CreateFolder | Intent::CreateFile) {
            if let Some(last) = &ctx.last_location {
                return Some(last.clone());
            }
        }

        let default = self.get_default(intent);
        (!default.location.is_empty()).then(|| default.location.to_string())
    }

    /// Default name with an HHMM stamp for uniqueness.
    pub fn infer_name(&self, intent: Intent, explicit: Option<&str>) -> Option<String> {
        if let Some(name) = explicit.filter(|n| !n.is_empty() && *n != "?") {
            return Some(name.to_string());
        }

        let default = self.get_default(intent);
        if default.name.is_empty() {
            return None;
        }

        let stamp = Local::now().format("%H%M");
        Some(format!("{}_{}{}", default.name, stamp, default.extension))
    }

    /// Copy of the command with target/loc filled when missing, each
    /// inferred field flagged. Updates the context for the next command.
    pub fn complete_command(&self, command: &Command) -> Command {
        let mut completed = command.clone();

        if completed.loc.as_deref().map_or(true, |l| l.is_empty() || l == "?") {
            if let Some(loc) = self.infer_location(command.intent, None) {
                completed.loc = Some(loc);
                completed.inferred_loc = true;
            }
        }

        if completed.target.as_deref().map_or(true, |t| t.is_empty() || t == "?") {
            if let Some(name) = self.infer_name(command.intent, None) {
                completed.target = Some(name);
                completed.inferred_target = true;
            }
        }

        self.set_last_action(command.intent, completed.loc.as_deref());

        completed
    }

    /// Human-readable summary of what was inferred, for notify decisions.
    pub fn format_inference(&self, command: &Command) -> String {
        let mut parts = Vec::new();
        if command.inferred_loc {
            parts.push(format!("loc: {} (default)", command.loc_str()));
        }
        if command.inferred_target {
            parts.push(format!("name: {} (default)", command.target_str()));
        }
        parts.join(" | ")
    }
}

impl Default for WorldModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let model = WorldModel::new();
        let cmd = Command::new(Intent::CreateFile);

        let completed = model.complete_command(&cmd);
        assert_eq!(completed.loc.as_deref(), Some("desktop"));
        assert!(completed.inferred_loc);
        assert!(completed.inferred_target);
        let target = completed.target.unwrap();
        assert!(target.ends_with(".txt"), "got {}", target);
    }

    #[test]
    fn test_explicit_fields_kept() {
        let model = WorldModel::new();
        let cmd = Command::new(Intent::CreateFolder)
            .with_target("مشروعي")
            .with_loc("desktop");

        let completed = model.complete_command(&cmd);
        assert_eq!(completed.target.as_deref(), Some("مشروعي"));
        assert!(!completed.inferred_target);
        assert!(!completed.inferred_loc);
    }

    #[test]
    fn test_watch_inheritance() {
        let model = WorldModel::new();
        model.set_last_action(Intent::Watch, Some("downloads"));

        let loc = model.infer_location(Intent::CreateFolder, None);
        assert_eq!(loc.as_deref(), Some("downloads"));
    }

    #[test]
    fn test_last_location_reused_for_create_class() {
        let model = WorldModel::new();
        model.set_last_action(Intent::CreateFolder, Some("documents"));

        let loc = model.infer_location(Intent::CreateFile, None);
        assert_eq!(loc.as_deref(), Some("documents"));

        // Non-create intents fall back to their own default
        let loc = model.infer_location(Intent::Clean, None);
        assert_eq!(loc.as_deref(), Some("downloads"));
    }
}
