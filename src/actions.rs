//! Node actions - the fixed set of host operations a graph node can run.
//!
//! Each implementation registers its rollback artifact with the rollback
//! engine *before* returning, so a failure later in the graph still finds
//! every earlier effect reversible. In dry-run mode nothing touches the
//! disk and no rollback record is written.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command as ProcessCommand;

use crate::command::Intent;
use crate::error::{AgentError, Result};
use crate::graph::ExecutionNode;
use crate::paths::SystemPaths;
use crate::rollback::{copy_recursively, RollbackEngine, RollbackType};

pub struct ActionContext<'a> {
    pub command_id: &'a str,
    pub dry_run: bool,
    pub paths: &'a SystemPaths,
    pub rollback: &'a RollbackEngine,
    /// Results of already-completed nodes, keyed by node id.
    pub shared: &'a HashMap<String, String>,
}

pub trait NodeAction: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String>;
}

/// Launching applications is OS-specific; the agent only depends on this
/// seam.
pub trait AppLauncher: Send + Sync {
    fn launch(&self, target: &str) -> Result<String>;
}

/// Default launcher: hands the target to the platform opener.
pub struct SystemAppLauncher;

impl AppLauncher for SystemAppLauncher {
    fn launch(&self, target: &str) -> Result<String> {
        let opener = if cfg!(target_os = "macos") {
            "open"
        } else if cfg!(target_os = "windows") {
            "start"
        } else {
            "xdg-open"
        };

        ProcessCommand::new(opener)
            .arg(target)
            .spawn()
            .map_err(|e| AgentError::NodeExecution(format!("failed to launch {}: {}", target, e)))?;
        Ok(format!("launched {}", target))
    }
}

fn resolve(node: &ExecutionNode, ctx: &ActionContext<'_>) -> PathBuf {
    ctx.paths.resolve_target(&node.target, &node.location)
}

// ── file-system actions ──────────────────────────────────────────────

pub struct CreateFolderAction;

impl NodeAction for CreateFolderAction {
    fn name(&self) -> &'static str {
        "create_folder"
    }

    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String> {
        let path = resolve(node, ctx);
        if path.exists() {
            return Err(AgentError::NodeExecution(format!(
                "folder already exists: {}",
                path.display()
            )));
        }

        if ctx.dry_run {
            return Ok(format!("[dry-run] would create folder {}", path.display()));
        }

        fs::create_dir_all(&path)?;
        ctx.rollback.register(
            ctx.command_id,
            &node.id,
            self.name(),
            &path,
            None,
            RollbackType::Delete,
            HashMap::new(),
        )?;
        Ok(format!("created folder {}", path.display()))
    }
}

pub struct CreateFileAction;

impl NodeAction for CreateFileAction {
    fn name(&self) -> &'static str {
        "create_file"
    }

    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String> {
        let path = resolve(node, ctx);
        if path.exists() {
            return Err(AgentError::NodeExecution(format!(
                "file already exists: {}",
                path.display()
            )));
        }

        if ctx.dry_run {
            return Ok(format!("[dry-run] would create file {}", path.display()));
        }

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                return Err(AgentError::NodeExecution(format!(
                    "parent folder missing: {}",
                    parent.display()
                )));
            }
        }

        fs::write(&path, "")?;
        ctx.rollback.register(
            ctx.command_id,
            &node.id,
            self.name(),
            &path,
            None,
            RollbackType::Delete,
            HashMap::new(),
        )?;
        Ok(format!("created file {}", path.display()))
    }
}

pub struct WriteFileAction;

impl NodeAction for WriteFileAction {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String> {
        let path = resolve(node, ctx);
        let content = node.params.get("param").cloned().unwrap_or_default();

        if ctx.dry_run {
            return Ok(format!(
                "[dry-run] would write {} bytes to {}",
                content.len(),
                path.display()
            ));
        }

        if path.exists() {
            // Existing content is backed up so the write is reversible.
            let backup = ctx.rollback.create_backup(&path, ctx.command_id)?;
            ctx.rollback.register(
                ctx.command_id,
                &node.id,
                self.name(),
                &path,
                Some(&backup),
                RollbackType::RestoreBackup,
                HashMap::new(),
            )?;
        } else {
            ctx.rollback.register(
                ctx.command_id,
                &node.id,
                self.name(),
                &path,
                None,
                RollbackType::Delete,
                HashMap::new(),
            )?;
        }

        fs::write(&path, &content)?;
        Ok(format!("wrote {} bytes to {}", content.len(), path.display()))
    }
}

pub struct DeleteAction;

impl NodeAction for DeleteAction {
    fn name(&self) -> &'static str {
        "delete"
    }

    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String> {
        let path = resolve(node, ctx);
        if !path.exists() {
            return Err(AgentError::NodeExecution(format!(
                "nothing to delete at {}",
                path.display()
            )));
        }

        if ctx.dry_run {
            return Ok(format!("[dry-run] would delete {}", path.display()));
        }

        let trash_path = ctx.rollback.move_to_trash(&path, ctx.command_id)?;
        ctx.rollback.register(
            ctx.command_id,
            &node.id,
            self.name(),
            &path,
            Some(&trash_path),
            RollbackType::Restore,
            HashMap::new(),
        )?;
        Ok(format!("moved {} to trash", path.display()))
    }
}

pub struct MoveAction;

impl NodeAction for MoveAction {
    fn name(&self) -> &'static str {
        "move"
    }

    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String> {
        let source = resolve(node, ctx);
        let dest_name = node
            .params
            .get("destination")
            .ok_or_else(|| AgentError::NodeExecution("move has no destination".to_string()))?;
        let dest_dir = ctx.paths.resolve(dest_name);
        let dest = dest_dir.join(source.file_name().unwrap_or_default());

        if !source.exists() {
            return Err(AgentError::NodeExecution(format!(
                "source missing: {}",
                source.display()
            )));
        }

        if ctx.dry_run {
            return Ok(format!(
                "[dry-run] would move {} to {}",
                source.display(),
                dest.display()
            ));
        }

        fs::create_dir_all(&dest_dir)?;
        fs::rename(&source, &dest).or_else(|_| -> std::io::Result<()> {
            copy_recursively(&source, &dest)
                .and_then(|_| crate::rollback::remove_path(&source))
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;

        let mut meta = HashMap::new();
        meta.insert("destination".to_string(), dest.display().to_string());
        ctx.rollback.register(
            ctx.command_id,
            &node.id,
            self.name(),
            &source,
            None,
            RollbackType::MoveBack,
            meta,
        )?;
        Ok(format!("moved {} to {}", source.display(), dest.display()))
    }
}

pub struct CopyAction;

impl NodeAction for CopyAction {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String> {
        let source = resolve(node, ctx);
        let dest_name = node
            .params
            .get("destination")
            .ok_or_else(|| AgentError::NodeExecution("copy has no destination".to_string()))?;
        let dest_dir = ctx.paths.resolve(dest_name);
        let dest = dest_dir.join(source.file_name().unwrap_or_default());

        if !source.exists() {
            return Err(AgentError::NodeExecution(format!(
                "source missing: {}",
                source.display()
            )));
        }

        if ctx.dry_run {
            return Ok(format!(
                "[dry-run] would copy {} to {}",
                source.display(),
                dest.display()
            ));
        }

        fs::create_dir_all(&dest_dir)?;
        copy_recursively(&source, &dest)?;

        ctx.rollback.register(
            ctx.command_id,
            &node.id,
            self.name(),
            &dest,
            None,
            RollbackType::Delete,
            HashMap::new(),
        )?;
        Ok(format!("copied {} to {}", source.display(), dest.display()))
    }
}

pub struct RenameAction;

impl NodeAction for RenameAction {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String> {
        let source = resolve(node, ctx);
        let new_name = node
            .params
            .get("destination")
            .or_else(|| node.params.get("param"))
            .ok_or_else(|| AgentError::NodeExecution("rename has no new name".to_string()))?;

        if !source.exists() {
            return Err(AgentError::NodeExecution(format!(
                "nothing to rename at {}",
                source.display()
            )));
        }

        let new_path = source
            .parent()
            .map(|p| p.join(new_name))
            .unwrap_or_else(|| PathBuf::from(new_name));

        if ctx.dry_run {
            return Ok(format!(
                "[dry-run] would rename {} to {}",
                source.display(),
                new_path.display()
            ));
        }

        fs::rename(&source, &new_path)?;

        let mut meta = HashMap::new();
        meta.insert("new_name".to_string(), new_name.clone());
        ctx.rollback.register(
            ctx.command_id,
            &node.id,
            self.name(),
            &source,
            None,
            RollbackType::RenameBack,
            meta,
        )?;
        Ok(format!(
            "renamed {} to {}",
            source.display(),
            new_path.display()
        ))
    }
}

/// Conservative clean: only non-hidden files whose name contains the
/// filter (case-insensitive) move to `<destination>/Cleaned`; an empty
/// filter matches every non-hidden file.
pub struct CleanAction;

impl NodeAction for CleanAction {
    fn name(&self) -> &'static str {
        "clean"
    }

    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String> {
        let source_dir = ctx.paths.resolve(if node.target.is_empty() {
            &node.location
        } else {
            &node.target
        });
        if !source_dir.is_dir() {
            return Err(AgentError::NodeExecution(format!(
                "not a folder: {}",
                source_dir.display()
            )));
        }

        let filter = node
            .params
            .get("filter_key")
            .map(|f| f.to_lowercase())
            .unwrap_or_default();
        let dest_name = node
            .params
            .get("destination")
            .cloned()
            .unwrap_or_else(|| "documents".to_string());
        let dest_dir = ctx.paths.resolve(&dest_name).join("Cleaned");
        let max_items: usize = node
            .params
            .get("max_items")
            .and_then(|m| m.parse().ok())
            .unwrap_or(500);

        let mut matched = Vec::new();
        for entry in fs::read_dir(&source_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.path().is_file() || name.starts_with('.') {
                continue;
            }
            if !filter.is_empty() && !name.to_lowercase().contains(&filter) {
                continue;
            }
            matched.push((entry.path(), name));
            if matched.len() >= max_items {
                break;
            }
        }

        if ctx.dry_run {
            return Ok(format!(
                "[dry-run] would move {} files to {}",
                matched.len(),
                dest_dir.display()
            ));
        }

        fs::create_dir_all(&dest_dir)?;
        let mut moved = 0;
        for (path, name) in matched {
            let dest = dest_dir.join(&name);
            if fs::rename(&path, &dest).is_err() {
                continue;
            }

            let mut meta = HashMap::new();
            meta.insert("destination".to_string(), dest.display().to_string());
            ctx.rollback.register(
                ctx.command_id,
                &node.id,
                self.name(),
                &path,
                None,
                RollbackType::MoveBack,
                meta,
            )?;
            moved += 1;
        }

        Ok(format!("moved {} files to {}", moved, dest_dir.display()))
    }
}

pub struct OpenAction {
    launcher: Box<dyn AppLauncher>,
}

impl OpenAction {
    pub fn new(launcher: Box<dyn AppLauncher>) -> Self {
        Self { launcher }
    }
}

impl NodeAction for OpenAction {
    fn name(&self) -> &'static str {
        "open"
    }

    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String> {
        if ctx.dry_run {
            return Ok(format!("[dry-run] would open {}", node.target));
        }
        self.launcher.launch(&node.target)
    }
}

pub struct OpenFileAction {
    launcher: Box<dyn AppLauncher>,
}

impl OpenFileAction {
    pub fn new(launcher: Box<dyn AppLauncher>) -> Self {
        Self { launcher }
    }
}

impl NodeAction for OpenFileAction {
    fn name(&self) -> &'static str {
        "open_file"
    }

    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String> {
        let path = resolve(node, ctx);
        if !path.exists() {
            return Err(AgentError::NodeExecution(format!(
                "file not found: {}",
                path.display()
            )));
        }
        if ctx.dry_run {
            return Ok(format!("[dry-run] would open {}", path.display()));
        }
        self.launcher.launch(&path.display().to_string())
    }
}

/// Online macros: searches open in the browser, notes land on the desktop.
pub struct MacroAction {
    launcher: Box<dyn AppLauncher>,
}

impl MacroAction {
    pub fn new(launcher: Box<dyn AppLauncher>) -> Self {
        Self { launcher }
    }
}

impl NodeAction for MacroAction {
    fn name(&self) -> &'static str {
        "macro"
    }

    fn execute(&self, node: &ExecutionNode, ctx: &ActionContext<'_>) -> Result<String> {
        let cmd = node.params.get("cmd").map(String::as_str).unwrap_or("");
        let param = node.params.get("param").map(String::as_str).unwrap_or("");

        match cmd {
            "web_search" => {
                let url = format!("https://www.google.com/search?q={}", param);
                if ctx.dry_run {
                    return Ok(format!("[dry-run] would open {}", url));
                }
                self.launcher.launch(&url)
            }
            "youtube_search" => {
                let url = format!("https://www.youtube.com/results?search_query={}", param);
                if ctx.dry_run {
                    return Ok(format!("[dry-run] would open {}", url));
                }
                self.launcher.launch(&url)
            }
            "write_note" => {
                let stamp = chrono::Local::now().format("%H%M");
                let path = ctx.paths.desktop().join(format!("note_{}.txt", stamp));
                if ctx.dry_run {
                    return Ok(format!("[dry-run] would write note {}", path.display()));
                }
                fs::write(&path, param)?;
                ctx.rollback.register(
                    ctx.command_id,
                    &node.id,
                    self.name(),
                    &path,
                    None,
                    RollbackType::Delete,
                    HashMap::new(),
                )?;
                Ok(format!("note saved to {}", path.display()))
            }
            other => Err(AgentError::NodeExecution(format!(
                "unknown macro: {}",
                other
            ))),
        }
    }
}

/// Fixed capability table selected at plan→graph time.
pub struct ActionRegistry {
    actions: HashMap<Intent, Box<dyn NodeAction>>,
}

impl ActionRegistry {
    /// The default set of file and app operations. Reactive intents are
    /// registered separately by the watcher owner.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            actions: HashMap::new(),
        };
        registry.insert(Intent::CreateFolder, Box::new(CreateFolderAction));
        registry.insert(Intent::CreateFile, Box::new(CreateFileAction));
        registry.insert(Intent::WriteFile, Box::new(WriteFileAction));
        registry.insert(Intent::Delete, Box::new(DeleteAction));
        registry.insert(Intent::Move, Box::new(MoveAction));
        registry.insert(Intent::Copy, Box::new(CopyAction));
        registry.insert(Intent::Rename, Box::new(RenameAction));
        registry.insert(Intent::Clean, Box::new(CleanAction));
        registry.insert(Intent::Open, Box::new(OpenAction::new(Box::new(SystemAppLauncher))));
        registry.insert(
            Intent::OpenFile,
            Box::new(OpenFileAction::new(Box::new(SystemAppLauncher))),
        );
        registry.insert(
            Intent::Macro,
            Box::new(MacroAction::new(Box::new(SystemAppLauncher))),
        );
        registry
    }

    pub fn insert(&mut self, intent: Intent, action: Box<dyn NodeAction>) {
        self.actions.insert(intent, action);
    }

    pub fn get(&self, intent: Intent) -> Option<&dyn NodeAction> {
        self.actions.get(&intent).map(|a| a.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ExecutionGraph, NodeStatus};
    use tempfile::TempDir;

    struct Fixture {
        _data: TempDir,
        work: TempDir,
        rollback: RollbackEngine,
        paths: SystemPaths,
    }

    impl Fixture {
        fn new() -> Self {
            let data = TempDir::new().unwrap();
            let rollback = RollbackEngine::new(data.path()).unwrap();
            Self {
                _data: data,
                work: TempDir::new().unwrap(),
                rollback,
                paths: SystemPaths::new(),
            }
        }

        fn ctx<'a>(&'a self, shared: &'a HashMap<String, String>, dry_run: bool) -> ActionContext<'a> {
            ActionContext {
                command_id: "CMD-TEST",
                dry_run,
                paths: &self.paths,
                rollback: &self.rollback,
                shared,
            }
        }

        fn node(&self, intent: Intent, target: &str, params: HashMap<String, String>) -> ExecutionNode {
            let mut graph = ExecutionGraph::new();
            let id = graph.add_node(
                intent,
                target,
                &self.work.path().display().to_string(),
                params,
                vec![],
            );
            let mut node = graph.get(&id).unwrap().clone();
            node.status = NodeStatus::Pending;
            node
        }
    }

    #[test]
    fn test_create_folder_registers_delete_rollback() {
        let fx = Fixture::new();
        let shared = HashMap::new();
        let node = fx.node(Intent::CreateFolder, "new_dir", HashMap::new());

        let result = CreateFolderAction
            .execute(&node, &fx.ctx(&shared, false))
            .unwrap();
        assert!(result.contains("created folder"));
        assert!(fx.work.path().join("new_dir").exists());

        let records = fx.rollback.records_for("CMD-TEST");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rollback_type, RollbackType::Delete);
    }

    #[test]
    fn test_create_folder_refuses_existing() {
        let fx = Fixture::new();
        let shared = HashMap::new();
        fs::create_dir(fx.work.path().join("already")).unwrap();
        let node = fx.node(Intent::CreateFolder, "already", HashMap::new());

        assert!(CreateFolderAction
            .execute(&node, &fx.ctx(&shared, false))
            .is_err());
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let fx = Fixture::new();
        let shared = HashMap::new();
        let node = fx.node(Intent::CreateFolder, "phantom", HashMap::new());

        let result = CreateFolderAction
            .execute(&node, &fx.ctx(&shared, true))
            .unwrap();
        assert!(result.starts_with("[dry-run]"));
        assert!(!fx.work.path().join("phantom").exists());
        assert!(fx.rollback.records_for("CMD-TEST").is_empty());
    }

    #[test]
    fn test_write_existing_file_backs_up_first() {
        let fx = Fixture::new();
        let shared = HashMap::new();
        let file = fx.work.path().join("doc.txt");
        fs::write(&file, "old").unwrap();

        let mut params = HashMap::new();
        params.insert("param".to_string(), "new content".to_string());
        let node = fx.node(Intent::WriteFile, "doc.txt", params);

        WriteFileAction
            .execute(&node, &fx.ctx(&shared, false))
            .unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "new content");

        let records = fx.rollback.records_for("CMD-TEST");
        assert_eq!(records[0].rollback_type, RollbackType::RestoreBackup);

        // Undo restores the original content
        assert!(fx.rollback.rollback("CMD-TEST").success);
        assert_eq!(fs::read_to_string(&file).unwrap(), "old");
    }

    #[test]
    fn test_delete_is_reversible() {
        let fx = Fixture::new();
        let shared = HashMap::new();
        let file = fx.work.path().join("victim.txt");
        fs::write(&file, "keep me").unwrap();

        let node = fx.node(Intent::Delete, "victim.txt", HashMap::new());
        DeleteAction.execute(&node, &fx.ctx(&shared, false)).unwrap();
        assert!(!file.exists());

        assert!(fx.rollback.rollback("CMD-TEST").success);
        assert_eq!(fs::read_to_string(&file).unwrap(), "keep me");
    }

    #[test]
    fn test_rename_and_rollback() {
        let fx = Fixture::new();
        let shared = HashMap::new();
        let file = fx.work.path().join("a.txt");
        fs::write(&file, "x").unwrap();

        let mut params = HashMap::new();
        params.insert("destination".to_string(), "b.txt".to_string());
        let node = fx.node(Intent::Rename, "a.txt", params);

        RenameAction.execute(&node, &fx.ctx(&shared, false)).unwrap();
        assert!(fx.work.path().join("b.txt").exists());
        assert!(!file.exists());

        assert!(fx.rollback.rollback("CMD-TEST").success);
        assert!(file.exists());
    }

    #[test]
    fn test_clean_moves_only_matching_files() {
        let fx = Fixture::new();
        let shared = HashMap::new();

        fs::write(fx.work.path().join("report.pdf"), "x").unwrap();
        fs::write(fx.work.path().join("summary.PDF"), "x").unwrap();
        fs::write(fx.work.path().join("notes.txt"), "x").unwrap();
        fs::write(fx.work.path().join(".hidden.pdf"), "x").unwrap();

        let dest = TempDir::new().unwrap();
        let mut params = HashMap::new();
        params.insert("filter_key".to_string(), "pdf".to_string());
        params.insert(
            "destination".to_string(),
            dest.path().display().to_string(),
        );
        let node = fx.node(
            Intent::Clean,
            &fx.work.path().display().to_string(),
            params,
        );

        let result = CleanAction.execute(&node, &fx.ctx(&shared, false)).unwrap();
        assert!(result.contains("moved 2 files"));

        let cleaned = dest.path().join("Cleaned");
        assert!(cleaned.join("report.pdf").exists());
        assert!(cleaned.join("summary.PDF").exists());
        assert!(fx.work.path().join("notes.txt").exists());
        assert!(fx.work.path().join(".hidden.pdf").exists());
    }

    #[test]
    fn test_clean_empty_filter_moves_all_visible() {
        let fx = Fixture::new();
        let shared = HashMap::new();

        fs::write(fx.work.path().join("a.txt"), "x").unwrap();
        fs::write(fx.work.path().join("b.txt"), "x").unwrap();
        fs::write(fx.work.path().join(".keep"), "x").unwrap();

        let dest = TempDir::new().unwrap();
        let mut params = HashMap::new();
        params.insert(
            "destination".to_string(),
            dest.path().display().to_string(),
        );
        let node = fx.node(
            Intent::Clean,
            &fx.work.path().display().to_string(),
            params,
        );

        let result = CleanAction.execute(&node, &fx.ctx(&shared, false)).unwrap();
        assert!(result.contains("moved 2 files"));
        assert!(fx.work.path().join(".keep").exists());
    }

    #[test]
    fn test_registry_has_all_file_ops() {
        let registry = ActionRegistry::with_defaults();
        for intent in [
            Intent::CreateFolder,
            Intent::CreateFile,
            Intent::WriteFile,
            Intent::Delete,
            Intent::Move,
            Intent::Copy,
            Intent::Rename,
            Intent::Clean,
            Intent::Open,
            Intent::OpenFile,
        ] {
            assert!(registry.get(intent).is_some(), "missing {:?}", intent);
        }
        assert!(registry.get(Intent::Watch).is_none());
    }
}
