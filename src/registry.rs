//! Command Registry - assigns each user request a unique id and tracks
//! its terminal status.
//!
//! Format: CMD-YYYYMMDD-XXXX (date + 4 upper hex).

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::command::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Cancelled
                | CommandStatus::RolledBack
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: String,
    pub raw_input: String,
    pub intent: String,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub nodes_count: usize,
    pub rollback_available: bool,
}

struct RegistryInner {
    records: HashMap<String, CommandRecord>,
    order: Vec<String>,
}

/// Central registry of all commands in this process run. All mutations
/// are serialised behind one lock.
pub struct CommandRegistry {
    inner: Mutex<RegistryInner>,
    max_history: usize,
}

const EVICTION_BATCH: usize = 100;

impl CommandRegistry {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(max_history: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                records: HashMap::new(),
                order: Vec::new(),
            }),
            max_history,
        }
    }

    /// Fresh CMD-YYYYMMDD-XXXX id, unique within this process run.
    pub fn generate_id(&self) -> String {
        let inner = self.inner.lock().unwrap();
        loop {
            let date_part = Local::now().format("%Y%m%d");
            let unique_part = uuid::Uuid::new_v4().simple().to_string()[..4].to_uppercase();
            let id = format!("CMD-{}-{}", date_part, unique_part);
            if !inner.records.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn register(&self, raw_input: &str, command: Option<&Command>) -> String {
        let command_id = self.generate_id();

        let record = CommandRecord {
            command_id: command_id.clone(),
            raw_input: raw_input.to_string(),
            intent: command.map(|c| c.intent.as_str().to_string()).unwrap_or_default(),
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            nodes_count: 0,
            rollback_available: false,
        };

        let mut inner = self.inner.lock().unwrap();
        inner.order.push(command_id.clone());
        inner.records.insert(command_id.clone(), record);
        if inner.records.len() > self.max_history {
            Self::evict_oldest(&mut inner);
        }

        command_id
    }

    fn evict_oldest(inner: &mut RegistryInner) {
        let mut ids: Vec<String> = inner.records.keys().cloned().collect();
        ids.sort_by_key(|id| inner.records[id].created_at);
        for old_id in ids.into_iter().take(EVICTION_BATCH) {
            inner.records.remove(&old_id);
            inner.order.retain(|id| id != &old_id);
        }
    }

    pub fn update_status(
        &self,
        command_id: &str,
        status: CommandStatus,
        result: Option<String>,
        error: Option<String>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(command_id) {
            record.status = status;
            if status.is_terminal() {
                record.completed_at = Some(Utc::now());
            }
            if result.is_some() {
                record.result = result;
            }
            if error.is_some() {
                record.error = error;
            }
        }
    }

    pub fn set_intent(&self, command_id: &str, intent: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(command_id) {
            record.intent = intent.to_string();
        }
    }

    pub fn set_nodes_count(&self, command_id: &str, count: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(command_id) {
            record.nodes_count = count;
        }
    }

    pub fn set_rollback_available(&self, command_id: &str, available: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(command_id) {
            record.rollback_available = available;
        }
    }

    pub fn get(&self, command_id: &str) -> Option<CommandRecord> {
        self.inner.lock().unwrap().records.get(command_id).cloned()
    }

    pub fn get_recent(&self, count: usize) -> Vec<CommandRecord> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<CommandRecord> = inner.records.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(count);
        records
    }

    pub fn get_by_status(&self, status: CommandStatus) -> Vec<CommandRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    pub fn get_rollbackable(&self) -> Vec<CommandRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .values()
            .filter(|r| r.rollback_available && r.status == CommandStatus::Completed)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_id_format() {
        let registry = CommandRegistry::new();
        let id = registry.generate_id();
        let pattern = Regex::new(r"^CMD-[0-9]{8}-[0-9A-F]{4}$").unwrap();
        assert!(pattern.is_match(&id), "bad id: {}", id);
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = CommandRegistry::new();
        let id = registry.register("افتح كروم", None);

        let record = registry.get(&id).unwrap();
        assert_eq!(record.status, CommandStatus::Pending);
        assert_eq!(record.raw_input, "افتح كروم");
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn test_terminal_status_stamps_completed_at() {
        let registry = CommandRegistry::new();
        let id = registry.register("test", None);

        registry.update_status(&id, CommandStatus::Processing, None, None);
        assert!(registry.get(&id).unwrap().completed_at.is_none());

        registry.update_status(&id, CommandStatus::Completed, Some("done".into()), None);
        let record = registry.get(&id).unwrap();
        assert!(record.completed_at.is_some());
        assert_eq!(record.result.as_deref(), Some("done"));
    }

    #[test]
    fn test_eviction_drops_oldest_batch() {
        let registry = CommandRegistry::with_capacity(120);
        let mut ids = Vec::new();
        for i in 0..121 {
            ids.push(registry.register(&format!("cmd {}", i), None));
        }

        assert_eq!(registry.len(), 21);
        assert!(registry.get(&ids[0]).is_none());
        assert!(registry.get(&ids[120]).is_some());
    }

    #[test]
    fn test_rollbackable_query() {
        let registry = CommandRegistry::new();
        let id = registry.register("create something", None);
        registry.update_status(&id, CommandStatus::Completed, None, None);
        registry.set_rollback_available(&id, true);

        let rollbackable = registry.get_rollbackable();
        assert_eq!(rollbackable.len(), 1);
        assert_eq!(rollbackable[0].command_id, id);
    }
}
