//! Rollback Engine - per-command trash, backups and reverse-order undo.
//!
//! Layout under the data directory:
//!   .trash/<cmd_id>/HHMMSS_<basename>   moved-away originals
//!   .backup/<cmd_id>/<basename>         deep copies taken before edits
//!   .rollback_registry.json             serialised records

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackType {
    /// Remove what the forward op created.
    Delete,
    /// Move the trashed original back.
    Restore,
    /// Move from recorded destination back to origin.
    MoveBack,
    /// Rename from new name back to the original.
    RenameBack,
    /// Replace current content with the backed-up copy.
    RestoreBackup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub command_id: String,
    pub node_id: String,
    pub intent: String,
    pub original_path: String,
    pub backup_path: Option<String>,
    pub rollback_type: RollbackType,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub executed: bool,
}

#[derive(Debug, Clone)]
pub struct RollbackResult {
    pub command_id: String,
    pub success: bool,
    pub rolled_back: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

pub struct RollbackEngine {
    trash_dir: PathBuf,
    backup_dir: PathBuf,
    registry_file: PathBuf,
    records: Mutex<HashMap<String, Vec<RollbackRecord>>>,
}

impl RollbackEngine {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let trash_dir = data_dir.join(".trash");
        let backup_dir = data_dir.join(".backup");
        let registry_file = data_dir.join(".rollback_registry.json");

        fs::create_dir_all(&trash_dir)?;
        fs::create_dir_all(&backup_dir)?;

        let records = if registry_file.exists() {
            fs::read_to_string(&registry_file)
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
                .unwrap_or_default()
        } else {
            HashMap::new()
        };

        Ok(Self {
            trash_dir,
            backup_dir,
            registry_file,
            records: Mutex::new(records),
        })
    }

    // Registry writes go through a temp file then rename, so a crash
    // mid-write never corrupts the only copy of the undo history.
    fn save_registry(&self, records: &HashMap<String, Vec<RollbackRecord>>) -> Result<()> {
        let tmp = self.registry_file.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(records)?)?;
        fs::rename(&tmp, &self.registry_file)?;
        Ok(())
    }

    /// Register a reversible effect. Called by actions before they return.
    pub fn register(
        &self,
        command_id: &str,
        node_id: &str,
        intent: &str,
        original_path: &Path,
        backup_path: Option<&Path>,
        rollback_type: RollbackType,
        metadata: HashMap<String, String>,
    ) -> Result<RollbackRecord> {
        let record = RollbackRecord {
            command_id: command_id.to_string(),
            node_id: node_id.to_string(),
            intent: intent.to_string(),
            original_path: original_path.display().to_string(),
            backup_path: backup_path.map(|p| p.display().to_string()),
            rollback_type,
            metadata,
            created_at: Utc::now(),
            executed: false,
        };

        let mut records = self.records.lock().unwrap();
        records
            .entry(command_id.to_string())
            .or_default()
            .push(record.clone());
        self.save_registry(&records)?;

        Ok(record)
    }

    /// Move a file or folder into this command's trash, prefixing the
    /// basename with an HHMMSS stamp.
    pub fn move_to_trash(&self, path: &Path, command_id: &str) -> Result<PathBuf> {
        if !path.exists() {
            return Err(AgentError::Rollback(format!(
                "nothing to trash at {}",
                path.display()
            )));
        }

        let cmd_trash = self.trash_dir.join(command_id);
        fs::create_dir_all(&cmd_trash)?;

        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        let stamp = Local::now().format("%H%M%S");
        let trash_path = cmd_trash.join(format!("{}_{}", stamp, basename));

        fs::rename(path, &trash_path)
            .or_else(|_| Self::copy_then_remove(path, &trash_path))?;
        Ok(trash_path)
    }

    /// Deep-copy a file or directory into this command's backup folder.
    pub fn create_backup(&self, path: &Path, command_id: &str) -> Result<PathBuf> {
        if !path.exists() {
            return Err(AgentError::Rollback(format!(
                "nothing to back up at {}",
                path.display()
            )));
        }

        let cmd_backup = self.backup_dir.join(command_id);
        fs::create_dir_all(&cmd_backup)?;

        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        let backup_path = cmd_backup.join(basename);

        copy_recursively(path, &backup_path)?;
        Ok(backup_path)
    }

    pub fn restore_backup(&self, backup_path: &Path, original_path: &Path) -> Result<()> {
        if !backup_path.exists() {
            return Err(AgentError::Rollback(format!(
                "backup missing: {}",
                backup_path.display()
            )));
        }

        if original_path.exists() {
            remove_path(original_path)?;
        }
        copy_recursively(backup_path, original_path)?;
        Ok(())
    }

    /// Undo every unexecuted record of a command, newest first.
    pub fn rollback(&self, command_id: &str) -> RollbackResult {
        let mut records = self.records.lock().unwrap();
        let command_records = match records.get_mut(command_id) {
            Some(r) if !r.is_empty() => r,
            _ => {
                return RollbackResult {
                    command_id: command_id.to_string(),
                    success: false,
                    rolled_back: 0,
                    failed: 0,
                    errors: vec!["no rollback records found".to_string()],
                }
            }
        };

        let mut rolled_back = 0;
        let mut failed = 0;
        let mut errors = Vec::new();

        for record in command_records.iter_mut().rev() {
            if record.executed {
                continue;
            }

            match Self::execute_rollback(record) {
                Ok(()) => {
                    record.executed = true;
                    rolled_back += 1;
                }
                Err(e) => {
                    failed += 1;
                    errors.push(format!("{} ({}): {}", record.node_id, record.intent, e));
                }
            }
        }

        let _ = self.save_registry(&records);

        RollbackResult {
            command_id: command_id.to_string(),
            success: failed == 0,
            rolled_back,
            failed,
            errors,
        }
    }

    fn execute_rollback(record: &RollbackRecord) -> Result<()> {
        let original = PathBuf::from(&record.original_path);

        match record.rollback_type {
            RollbackType::Delete => {
                if original.exists() {
                    remove_path(&original)?;
                }
                Ok(())
            }
            RollbackType::Restore => {
                let trash = record.backup_path.as_ref().ok_or_else(|| {
                    AgentError::Rollback("restore record has no trash path".to_string())
                })?;
                let trash = PathBuf::from(trash);
                if !trash.exists() {
                    return Err(AgentError::Rollback(format!(
                        "trashed copy missing: {}",
                        trash.display()
                    )));
                }
                fs::rename(&trash, &original)
                    .or_else(|_| Self::copy_then_remove(&trash, &original))?;
                Ok(())
            }
            RollbackType::MoveBack => {
                let dest = record.metadata.get("destination").ok_or_else(|| {
                    AgentError::Rollback("move record has no destination".to_string())
                })?;
                let dest = PathBuf::from(dest);
                if !dest.exists() {
                    return Err(AgentError::Rollback(format!(
                        "moved file missing: {}",
                        dest.display()
                    )));
                }
                fs::rename(&dest, &original)
                    .or_else(|_| Self::copy_then_remove(&dest, &original))?;
                Ok(())
            }
            RollbackType::RenameBack => {
                let new_name = record.metadata.get("new_name").ok_or_else(|| {
                    AgentError::Rollback("rename record has no new_name".to_string())
                })?;
                let new_path = original
                    .parent()
                    .map(|p| p.join(new_name))
                    .unwrap_or_else(|| PathBuf::from(new_name));
                if !new_path.exists() {
                    return Err(AgentError::Rollback(format!(
                        "renamed file missing: {}",
                        new_path.display()
                    )));
                }
                fs::rename(&new_path, &original)?;
                Ok(())
            }
            RollbackType::RestoreBackup => {
                let backup = record.backup_path.as_ref().ok_or_else(|| {
                    AgentError::Rollback("backup record has no backup path".to_string())
                })?;
                let backup = PathBuf::from(backup);
                if original.exists() {
                    remove_path(&original)?;
                }
                copy_recursively(&backup, &original)?;
                Ok(())
            }
        }
    }

    fn copy_then_remove(from: &Path, to: &Path) -> std::io::Result<()> {
        copy_recursively(from, to).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        })?;
        remove_path(from).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        })
    }

    pub fn records_for(&self, command_id: &str) -> Vec<RollbackRecord> {
        self.records
            .lock()
            .unwrap()
            .get(command_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_rollback(&self, command_id: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .get(command_id)
            .map(|records| records.iter().any(|r| !r.executed))
            .unwrap_or(false)
    }

    pub fn trash_size_bytes(&self) -> u64 {
        walkdir::WalkDir::new(&self.trash_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    /// Evict trash subdirectories older than the retention window.
    pub fn clear_trash(&self, older_than_days: u64) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(older_than_days * 86_400))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut deleted = 0;
        for entry in fs::read_dir(&self.trash_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let mtime = entry.metadata()?.modified()?;
            if mtime < cutoff {
                if fs::remove_dir_all(entry.path()).is_ok() {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

pub(crate) fn copy_recursively(from: &Path, to: &Path) -> Result<()> {
    if from.is_file() {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)?;
        return Ok(());
    }

    fs::create_dir_all(to)?;
    for entry in walkdir::WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|e| AgentError::Internal(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| AgentError::Internal(e.to_string()))?;
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

pub(crate) fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> (RollbackEngine, TempDir, TempDir) {
        let data = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        (RollbackEngine::new(data.path()).unwrap(), data, work)
    }

    #[test]
    fn test_create_then_rollback_deletes() {
        let (engine, _data, work) = engine();
        let created = work.path().join("new_folder");
        fs::create_dir(&created).unwrap();

        engine
            .register(
                "CMD-1",
                "node-0",
                "create_folder",
                &created,
                None,
                RollbackType::Delete,
                HashMap::new(),
            )
            .unwrap();

        let result = engine.rollback("CMD-1");
        assert!(result.success);
        assert_eq!(result.rolled_back, 1);
        assert!(!created.exists());
    }

    #[test]
    fn test_delete_then_rollback_restores() {
        let (engine, _data, work) = engine();
        let victim = work.path().join("victim.txt");
        fs::write(&victim, "important").unwrap();

        let trash_path = engine.move_to_trash(&victim, "CMD-2").unwrap();
        assert!(!victim.exists());
        assert!(trash_path.exists());

        engine
            .register(
                "CMD-2",
                "node-0",
                "delete",
                &victim,
                Some(&trash_path),
                RollbackType::Restore,
                HashMap::new(),
            )
            .unwrap();

        let result = engine.rollback("CMD-2");
        assert!(result.success);
        assert_eq!(fs::read_to_string(&victim).unwrap(), "important");
    }

    #[test]
    fn test_rename_rollback() {
        let (engine, _data, work) = engine();
        let original = work.path().join("old_name.txt");
        let renamed = work.path().join("new_name.txt");
        fs::write(&original, "x").unwrap();
        fs::rename(&original, &renamed).unwrap();

        let mut meta = HashMap::new();
        meta.insert("new_name".to_string(), "new_name.txt".to_string());
        engine
            .register(
                "CMD-3",
                "node-0",
                "rename",
                &original,
                None,
                RollbackType::RenameBack,
                meta,
            )
            .unwrap();

        let result = engine.rollback("CMD-3");
        assert!(result.success);
        assert!(original.exists());
        assert!(!renamed.exists());
    }

    #[test]
    fn test_restore_backup_replaces_current() {
        let (engine, _data, work) = engine();
        let file = work.path().join("doc.txt");
        fs::write(&file, "version 1").unwrap();

        let backup = engine.create_backup(&file, "CMD-4").unwrap();
        fs::write(&file, "version 2").unwrap();

        engine
            .register(
                "CMD-4",
                "node-0",
                "write_file",
                &file,
                Some(&backup),
                RollbackType::RestoreBackup,
                HashMap::new(),
            )
            .unwrap();

        let result = engine.rollback("CMD-4");
        assert!(result.success);
        assert_eq!(fs::read_to_string(&file).unwrap(), "version 1");
    }

    #[test]
    fn test_rollback_runs_in_reverse_order() {
        let (engine, _data, work) = engine();
        let folder = work.path().join("parent");
        let file = folder.join("child.txt");
        fs::create_dir(&folder).unwrap();
        fs::write(&file, "x").unwrap();

        engine
            .register(
                "CMD-5",
                "node-0",
                "create_folder",
                &folder,
                None,
                RollbackType::Delete,
                HashMap::new(),
            )
            .unwrap();
        engine
            .register(
                "CMD-5",
                "node-1",
                "create_file",
                &file,
                None,
                RollbackType::Delete,
                HashMap::new(),
            )
            .unwrap();

        // Reverse order: the file goes first, then its parent folder; both
        // succeed only because the child is gone before the folder removal.
        let result = engine.rollback("CMD-5");
        assert!(result.success);
        assert_eq!(result.rolled_back, 2);
        assert!(!folder.exists());
    }

    #[test]
    fn test_rollback_twice_is_noop() {
        let (engine, _data, work) = engine();
        let created = work.path().join("once");
        fs::create_dir(&created).unwrap();

        engine
            .register(
                "CMD-6",
                "node-0",
                "create_folder",
                &created,
                None,
                RollbackType::Delete,
                HashMap::new(),
            )
            .unwrap();

        assert_eq!(engine.rollback("CMD-6").rolled_back, 1);
        assert_eq!(engine.rollback("CMD-6").rolled_back, 0);
    }

    #[test]
    fn test_registry_survives_reload() {
        let data = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let created = work.path().join("persisted");
        fs::create_dir(&created).unwrap();

        {
            let engine = RollbackEngine::new(data.path()).unwrap();
            engine
                .register(
                    "CMD-7",
                    "node-0",
                    "create_folder",
                    &created,
                    None,
                    RollbackType::Delete,
                    HashMap::new(),
                )
                .unwrap();
        }

        let engine = RollbackEngine::new(data.path()).unwrap();
        assert!(engine.has_rollback("CMD-7"));
        assert!(engine.rollback("CMD-7").success);
        assert!(!created.exists());
    }

    #[test]
    fn test_clear_trash_by_age() {
        let (engine, data, work) = engine();
        let victim = work.path().join("old.txt");
        fs::write(&victim, "x").unwrap();
        engine.move_to_trash(&victim, "CMD-8").unwrap();

        let cmd_trash = data.path().join(".trash").join("CMD-8");
        assert!(cmd_trash.exists());

        // Fresh trash survives a 7-day sweep
        assert_eq!(engine.clear_trash(7).unwrap(), 0);

        // Age the folder and sweep again
        let old = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&cmd_trash, old).unwrap();
        assert_eq!(engine.clear_trash(7).unwrap(), 1);
        assert!(!cmd_trash.exists());
    }
}
