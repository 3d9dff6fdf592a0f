//! Watcher Subsystem - debounced folder observers with reactive commands.
//!
//! Each watch schedules a non-recursive observer reporting file creations
//! whose names contain the filter (case-insensitive, empty = all). Events
//! within 2 s of the previous event on the same (watch, path) are
//! swallowed. Fired events are pushed onto a channel; the `on_change`
//! command is dispatched by whoever drains that channel, never inline on
//! the observer thread.

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::command::Command;
use crate::error::{AgentError, Result};
use crate::paths::SystemPaths;
use crate::structured_log::{log_event, LogLevel};

const DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchTask {
    pub watch_id: String,
    pub folder: String,
    pub path: String,
    pub filter_key: String,
    pub action_type: String,
    pub started_at: DateTime<Utc>,
    pub on_change: Option<Command>,
}

/// One observed file creation, ready for the pipeline thread.
#[derive(Debug, Clone)]
pub struct WatchFired {
    pub watch_id: String,
    pub folder: String,
    pub file_name: String,
    pub file_path: String,
    pub message: String,
    /// Pre-enriched reactive command, if the watch carries one.
    pub command: Option<Command>,
}

struct ActiveWatch {
    task: WatchTask,
    // Dropping the watcher unschedules the observer.
    _watcher: RecommendedWatcher,
}

pub struct WatcherService {
    paths: Arc<SystemPaths>,
    watches: Mutex<HashMap<String, ActiveWatch>>,
    event_tx: Mutex<Sender<WatchFired>>,
    table_subscribers: Mutex<Vec<Sender<Vec<WatchTask>>>>,
    max_watches: usize,
}

impl WatcherService {
    pub fn new(paths: Arc<SystemPaths>, event_tx: Sender<WatchFired>, max_watches: usize) -> Self {
        Self {
            paths,
            watches: Mutex::new(HashMap::new()),
            event_tx: Mutex::new(event_tx),
            table_subscribers: Mutex::new(Vec::new()),
            max_watches,
        }
    }

    pub fn start_watch(
        &self,
        folder: &str,
        filter_key: &str,
        action_type: &str,
        on_change: Option<Command>,
    ) -> Result<WatchTask> {
        {
            let watches = self.watches.lock().unwrap();
            if watches.len() >= self.max_watches {
                return Err(AgentError::Validation(format!(
                    "watch limit reached ({})",
                    self.max_watches
                )));
            }
        }

        let resolved = self.paths.resolve(folder);
        if !resolved.is_dir() {
            return Err(AgentError::Validation(format!(
                "cannot watch {}: not a folder",
                resolved.display()
            )));
        }

        let watch_id = format!("{:08x}", rand::thread_rng().gen::<u32>());
        let task = WatchTask {
            watch_id: watch_id.clone(),
            folder: folder.to_string(),
            path: resolved.display().to_string(),
            filter_key: filter_key.to_lowercase(),
            action_type: action_type.to_string(),
            started_at: Utc::now(),
            on_change,
        };

        let watcher = self.schedule_observer(&task, &resolved)?;

        self.watches.lock().unwrap().insert(
            watch_id.clone(),
            ActiveWatch {
                task: task.clone(),
                _watcher: watcher,
            },
        );

        log_event(
            LogLevel::Info,
            "WATCHER",
            "started",
            serde_json::json!({
                "watch_id": watch_id,
                "path": task.path,
                "filter": task.filter_key,
            }),
        );
        self.notify_table_change();

        Ok(task)
    }

    fn schedule_observer(&self, task: &WatchTask, path: &PathBuf) -> Result<RecommendedWatcher> {
        let event_tx = self.event_tx.lock().unwrap().clone();
        let watch_id = task.watch_id.clone();
        let folder = task.folder.clone();
        let filter = task.filter_key.clone();
        let on_change = task.on_change.clone();
        let watch_path = task.path.clone();
        let last_events: Mutex<HashMap<PathBuf, Instant>> = Mutex::new(HashMap::new());

        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| {
                let event = match result {
                    Ok(e) => e,
                    Err(_) => return,
                };
                if !matches!(event.kind, EventKind::Create(_)) {
                    return;
                }

                for created in event.paths {
                    if created.is_dir() {
                        continue;
                    }
                    let file_name = match created.file_name() {
                        Some(n) => n.to_string_lossy().to_string(),
                        None => continue,
                    };

                    // In-progress downloads and editor droppings are noise
                    let lower = file_name.to_lowercase();
                    if lower.ends_with(".tmp") || lower.ends_with(".crdownload") {
                        continue;
                    }

                    if !filter.is_empty() && !lower.contains(&filter) {
                        continue;
                    }

                    // Debounce per (watch, path)
                    {
                        let mut last = last_events.lock().unwrap();
                        let now = Instant::now();
                        if let Some(previous) = last.get(&created) {
                            if now.duration_since(*previous) < DEBOUNCE {
                                continue;
                            }
                        }
                        last.insert(created.clone(), now);
                    }

                    let command = on_change.clone().map(|mut cmd| {
                        cmd.trigger_file = Some(file_name.clone());
                        cmd.trigger_folder = Some(watch_path.clone());
                        cmd.watch_id = Some(watch_id.clone());
                        cmd
                    });

                    let _ = event_tx.send(WatchFired {
                        watch_id: watch_id.clone(),
                        folder: folder.clone(),
                        file_name: file_name.clone(),
                        file_path: created.display().to_string(),
                        message: format!("[{}] detected {}", watch_id, file_name),
                        command,
                    });
                }
            })
            .map_err(|e| AgentError::Internal(format!("observer setup failed: {}", e)))?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| AgentError::Internal(format!("cannot watch {}: {}", path.display(), e)))?;

        Ok(watcher)
    }

    pub fn stop_watch(&self, watch_id: &str) -> bool {
        let removed = self.watches.lock().unwrap().remove(watch_id).is_some();
        if removed {
            log_event(
                LogLevel::Info,
                "WATCHER",
                "stopped",
                serde_json::json!({"watch_id": watch_id}),
            );
            self.notify_table_change();
        }
        removed
    }

    pub fn stop_all(&self) -> usize {
        let mut watches = self.watches.lock().unwrap();
        let count = watches.len();
        watches.clear();
        drop(watches);
        if count > 0 {
            self.notify_table_change();
        }
        count
    }

    pub fn list(&self) -> Vec<WatchTask> {
        self.watches
            .lock()
            .unwrap()
            .values()
            .map(|w| w.task.clone())
            .collect()
    }

    pub fn get(&self, watch_id: &str) -> Option<WatchTask> {
        self.watches
            .lock()
            .unwrap()
            .get(watch_id)
            .map(|w| w.task.clone())
    }

    /// Receive the new watch table whenever it changes.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<Vec<WatchTask>> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.table_subscribers.lock().unwrap().push(tx);
        rx
    }

    fn notify_table_change(&self) {
        let table = self.list();
        self.table_subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(table.clone()).is_ok());
    }
}

/// Graph-node adapter: a `watch` node establishes a watch when it runs
/// (last, after every imperative sibling).
pub struct WatchAction {
    service: Arc<WatcherService>,
}

impl WatchAction {
    pub fn new(service: Arc<WatcherService>) -> Self {
        Self { service }
    }
}

impl crate::actions::NodeAction for WatchAction {
    fn name(&self) -> &'static str {
        "watch"
    }

    fn execute(
        &self,
        node: &crate::graph::ExecutionNode,
        ctx: &crate::actions::ActionContext<'_>,
    ) -> Result<String> {
        let folder = if node.target.is_empty() {
            &node.location
        } else {
            &node.target
        };
        let filter = node.params.get("filter_key").map(String::as_str).unwrap_or("");
        let action_type = node
            .params
            .get("action_type")
            .map(String::as_str)
            .unwrap_or("alert");
        let on_change = node
            .params
            .get("on_change")
            .and_then(|raw| serde_json::from_str::<Command>(raw).ok());

        if ctx.dry_run {
            return Ok(format!("[dry-run] would watch {}", folder));
        }

        let task = self.service.start_watch(folder, filter, action_type, on_change)?;
        Ok(format!("watching {} [{}]", task.path, task.watch_id))
    }
}

/// Graph-node adapter for `stop_watch`.
pub struct StopWatchAction {
    service: Arc<WatcherService>,
}

impl StopWatchAction {
    pub fn new(service: Arc<WatcherService>) -> Self {
        Self { service }
    }
}

impl crate::actions::NodeAction for StopWatchAction {
    fn name(&self) -> &'static str {
        "stop_watch"
    }

    fn execute(
        &self,
        node: &crate::graph::ExecutionNode,
        ctx: &crate::actions::ActionContext<'_>,
    ) -> Result<String> {
        if ctx.dry_run {
            return Ok("[dry-run] would stop watches".to_string());
        }

        match node.params.get("watch_id").or(Some(&node.target)).filter(|id| !id.is_empty()) {
            Some(watch_id) => {
                if self.service.stop_watch(watch_id) {
                    Ok(format!("stopped watch {}", watch_id))
                } else {
                    Err(AgentError::NodeExecution(format!(
                        "no watch with id {}",
                        watch_id
                    )))
                }
            }
            None => {
                let count = self.service.stop_all();
                Ok(format!("stopped {} watches", count))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Intent;
    use std::sync::mpsc::channel;
    use tempfile::TempDir;

    fn service() -> (WatcherService, std::sync::mpsc::Receiver<WatchFired>) {
        let (tx, rx) = channel();
        (WatcherService::new(Arc::new(SystemPaths::new()), tx, 10), rx)
    }

    #[test]
    fn test_watch_id_is_eight_hex() {
        let (service, _rx) = service();
        let dir = TempDir::new().unwrap();
        let task = service
            .start_watch(&dir.path().display().to_string(), "", "alert", None)
            .unwrap();

        assert_eq!(task.watch_id.len(), 8);
        assert!(task
            .watch_id
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn test_fires_on_matching_creation() {
        let (service, rx) = service();
        let dir = TempDir::new().unwrap();
        service
            .start_watch(&dir.path().display().to_string(), "pdf", "alert", None)
            .unwrap();

        std::fs::write(dir.path().join("report.pdf"), "x").unwrap();

        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fired.file_name, "report.pdf");
        assert!(fired.message.contains("detected report.pdf"));
    }

    #[test]
    fn test_filter_is_case_insensitive_substring() {
        let (service, rx) = service();
        let dir = TempDir::new().unwrap();
        service
            .start_watch(&dir.path().display().to_string(), "pdf", "alert", None)
            .unwrap();

        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::write(dir.path().join("REPORT.PDF"), "x").unwrap();

        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(fired.file_name, "REPORT.PDF");
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_on_change_command_is_enriched() {
        let (service, rx) = service();
        let dir = TempDir::new().unwrap();
        let reactive = Command::new(Intent::CreateFolder).with_target("incoming");

        service
            .start_watch(
                &dir.path().display().to_string(),
                "",
                "alert",
                Some(reactive),
            )
            .unwrap();

        std::fs::write(dir.path().join("new_file.bin"), "x").unwrap();

        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let command = fired.command.unwrap();
        assert_eq!(command.intent, Intent::CreateFolder);
        assert_eq!(command.trigger_file.as_deref(), Some("new_file.bin"));
        assert_eq!(command.watch_id.as_deref(), Some(fired.watch_id.as_str()));
    }

    #[test]
    fn test_same_path_debounced_within_two_seconds() {
        let (service, rx) = service();
        let dir = TempDir::new().unwrap();
        service
            .start_watch(&dir.path().display().to_string(), "", "alert", None)
            .unwrap();

        let path = dir.path().join("bounce.txt");
        std::fs::write(&path, "x").unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.file_name, "bounce.txt");

        // Recreate the same path immediately: the second create event
        // lands inside the debounce window and is swallowed
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, "y").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(800)).is_err());
    }

    #[test]
    fn test_stop_watch_removes_entry() {
        let (service, _rx) = service();
        let dir = TempDir::new().unwrap();
        let task = service
            .start_watch(&dir.path().display().to_string(), "", "alert", None)
            .unwrap();

        assert_eq!(service.list().len(), 1);
        assert!(service.stop_watch(&task.watch_id));
        assert!(service.list().is_empty());
        assert!(!service.stop_watch(&task.watch_id));
    }

    #[test]
    fn test_watch_limit() {
        let (tx, _rx) = channel();
        let service = WatcherService::new(Arc::new(SystemPaths::new()), tx, 1);
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();

        service
            .start_watch(&dir_a.path().display().to_string(), "", "alert", None)
            .unwrap();
        assert!(service
            .start_watch(&dir_b.path().display().to_string(), "", "alert", None)
            .is_err());
    }

    #[test]
    fn test_table_subscription() {
        let (service, _rx) = service();
        let updates = service.subscribe();
        let dir = TempDir::new().unwrap();

        service
            .start_watch(&dir.path().display().to_string(), "", "alert", None)
            .unwrap();

        let table = updates.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(table.len(), 1);
    }
}
