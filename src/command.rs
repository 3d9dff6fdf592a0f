//! Command model - the canonical intent carrier.
//!
//! At the IPC boundary the model's JSON is parsed permissively
//! (`from_wire`) and projected into the strict `Command` shape; unknown
//! intents and unknown fields are coerced to `Intent::Unknown` instead of
//! leaking a permissive shape into the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Open,
    OpenFile,
    Clean,
    Watch,
    StopWatch,
    Macro,
    Schedule,
    Reminder,
    CreateFolder,
    CreateFile,
    WriteFile,
    Delete,
    Rename,
    Copy,
    Move,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Open => "open",
            Intent::OpenFile => "open_file",
            Intent::Clean => "clean",
            Intent::Watch => "watch",
            Intent::StopWatch => "stop_watch",
            Intent::Macro => "macro",
            Intent::Schedule => "schedule",
            Intent::Reminder => "reminder",
            Intent::CreateFolder => "create_folder",
            Intent::CreateFile => "create_file",
            Intent::WriteFile => "write_file",
            Intent::Delete => "delete",
            Intent::Rename => "rename",
            Intent::Copy => "copy",
            Intent::Move => "move",
            Intent::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Intent {
        match s {
            "open" => Intent::Open,
            "open_file" => Intent::OpenFile,
            "clean" => Intent::Clean,
            "watch" => Intent::Watch,
            "stop_watch" => Intent::StopWatch,
            "macro" => Intent::Macro,
            "schedule" => Intent::Schedule,
            "reminder" => Intent::Reminder,
            "create_folder" => Intent::CreateFolder,
            "create_file" => Intent::CreateFile,
            "write_file" => Intent::WriteFile,
            "delete" => Intent::Delete,
            "rename" => Intent::Rename,
            "copy" => Intent::Copy,
            "move" => Intent::Move,
            _ => Intent::Unknown,
        }
    }

    /// Intents whose side effects can be reversed by the rollback engine.
    pub fn rollback_safe(&self) -> bool {
        matches!(
            self,
            Intent::CreateFolder
                | Intent::CreateFile
                | Intent::WriteFile
                | Intent::Copy
                | Intent::Move
                | Intent::Rename
        )
    }
}

/// The canonical intent value. Wire aliases (`filter`, `dest`, `act`) are
/// accepted on input; internally only the long names exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub intent: Intent,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<String>,

    #[serde(default, alias = "filter", skip_serializing_if = "Option::is_none")]
    pub filter_key: Option<String>,

    #[serde(default, alias = "dest", skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    #[serde(default, alias = "act", skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<String>,

    /// Sub-command re-entered through the pipeline when a watcher fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_change: Option<Box<Command>>,

    // Completion metadata, attached by the world model / learning store /
    // watcher. Never supplied on the wire.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inferred_target: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inferred_loc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_folder: Option<String>,
}

impl Default for Intent {
    fn default() -> Self {
        Intent::Unknown
    }
}

const WIRE_KEYS: &[&str] = &[
    "intent",
    "target",
    "loc",
    "filter",
    "filter_key",
    "dest",
    "destination",
    "act",
    "action_type",
    "cmd",
    "param",
    "watch_id",
    "time",
    "delay",
    "repeat",
    "on_change",
];

impl Command {
    pub fn new(intent: Intent) -> Self {
        Command {
            intent,
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn with_loc(mut self, loc: &str) -> Self {
        self.loc = Some(loc.to_string());
        self
    }

    /// Project a wire object into a Command. Unknown `intent` values and
    /// unknown top-level fields coerce the whole command to `unknown`.
    pub fn from_wire(value: &Value) -> Command {
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => return Command::new(Intent::Unknown),
        };

        if obj.keys().any(|k| !WIRE_KEYS.contains(&k.as_str())) {
            return Command::new(Intent::Unknown);
        }

        let intent = obj
            .get("intent")
            .and_then(Value::as_str)
            .map(Intent::parse)
            .unwrap_or(Intent::Unknown);

        if intent == Intent::Unknown {
            return Command::new(Intent::Unknown);
        }

        let text = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| obj.get(*k))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty())
        };

        let on_change = obj.get("on_change").and_then(Self::parse_on_change);

        Command {
            intent,
            target: text(&["target"]),
            loc: text(&["loc"]),
            filter_key: text(&["filter_key", "filter"]),
            destination: text(&["destination", "dest"]),
            action_type: text(&["action_type", "act"]),
            cmd: text(&["cmd"]),
            param: text(&["param"]),
            watch_id: text(&["watch_id"]),
            time: text(&["time"]),
            delay: text(&["delay"]),
            repeat: text(&["repeat"]),
            on_change: on_change.map(Box::new),
            ..Default::default()
        }
    }

    /// `on_change` arrives canonically as an object; the legacy
    /// `"intent:target"` string form is still projected into a Command.
    fn parse_on_change(value: &Value) -> Option<Command> {
        match value {
            Value::Object(_) => {
                let cmd = Command::from_wire(value);
                (cmd.intent != Intent::Unknown).then_some(cmd)
            }
            Value::String(s) => {
                let (intent_str, target) = s.split_once(':')?;
                let intent = Intent::parse(intent_str.trim());
                if intent == Intent::Unknown {
                    return None;
                }
                Some(Command::new(intent).with_target(target.trim()))
            }
            _ => None,
        }
    }

    /// A model response is either one intent object or an array of them.
    pub fn from_model_response(value: &Value) -> Vec<Command> {
        match value {
            Value::Array(items) => items.iter().map(Command::from_wire).collect(),
            _ => vec![Command::from_wire(value)],
        }
    }

    pub fn target_str(&self) -> &str {
        self.target.as_deref().unwrap_or("")
    }

    pub fn loc_str(&self) -> &str {
        self.loc.as_deref().unwrap_or("")
    }

    /// Fields the decision engine considers completable.
    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.target.as_deref().map_or(true, |t| t.is_empty() || t == "?") {
            missing.push("target".to_string());
        }
        if self.loc.as_deref().map_or(true, |l| l.is_empty() || l == "?") {
            missing.push("loc".to_string());
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_aliases() {
        let cmd = Command::from_wire(&json!({
            "intent": "watch",
            "loc": "downloads",
            "filter": "pdf",
            "act": "alert",
            "dest": "documents"
        }));

        assert_eq!(cmd.intent, Intent::Watch);
        assert_eq!(cmd.filter_key.as_deref(), Some("pdf"));
        assert_eq!(cmd.action_type.as_deref(), Some("alert"));
        assert_eq!(cmd.destination.as_deref(), Some("documents"));
    }

    #[test]
    fn test_unknown_intent_coerced() {
        let cmd = Command::from_wire(&json!({"intent": "format_disk", "target": "C:"}));
        assert_eq!(cmd.intent, Intent::Unknown);
        assert!(cmd.target.is_none());
    }

    #[test]
    fn test_unknown_field_coerces_to_unknown() {
        let cmd = Command::from_wire(&json!({"intent": "open", "target": "chrome", "sudo": true}));
        assert_eq!(cmd.intent, Intent::Unknown);
    }

    #[test]
    fn test_on_change_dict_form() {
        let cmd = Command::from_wire(&json!({
            "intent": "watch",
            "loc": "downloads",
            "on_change": {"intent": "create_folder", "target": "incoming"}
        }));

        let nested = cmd.on_change.unwrap();
        assert_eq!(nested.intent, Intent::CreateFolder);
        assert_eq!(nested.target.as_deref(), Some("incoming"));
    }

    #[test]
    fn test_on_change_legacy_string_form() {
        let cmd = Command::from_wire(&json!({
            "intent": "watch",
            "loc": "downloads",
            "on_change": "create_folder:incoming"
        }));

        let nested = cmd.on_change.unwrap();
        assert_eq!(nested.intent, Intent::CreateFolder);
        assert_eq!(nested.target.as_deref(), Some("incoming"));
    }

    #[test]
    fn test_model_response_list() {
        let cmds = Command::from_model_response(&json!([
            {"intent": "create_folder", "target": "a", "loc": "desktop"},
            {"intent": "create_file", "target": "b.txt", "loc": "a"}
        ]));
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[1].intent, Intent::CreateFile);
    }

    #[test]
    fn test_missing_fields() {
        let cmd = Command::new(Intent::CreateFile);
        assert_eq!(cmd.missing_fields(), vec!["target", "loc"]);

        let cmd = Command::new(Intent::CreateFile).with_target("a.txt");
        assert_eq!(cmd.missing_fields(), vec!["loc"]);
    }
}
