//! Agent configuration - load-or-create config.json in the data directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

fn default_profile() -> String {
    "safe".to_string()
}

fn default_language() -> String {
    "ar".to_string()
}

fn default_worker_host() -> String {
    "localhost".to_string()
}

fn default_worker_port() -> u16 {
    6000
}

fn default_worker_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_max_watches() -> usize {
    10
}

fn default_rate_limit_requests() -> usize {
    10
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_trash_retention() -> u64 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_profile")]
    pub default_profile: String,

    #[serde(default = "default_language")]
    pub language: String,

    // Worker IPC
    #[serde(default = "default_worker_host")]
    pub worker_host: String,
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,

    // Notifications
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default = "default_true")]
    pub sound_enabled: bool,

    // Risk knobs
    #[serde(default = "default_true")]
    pub confirm_high_risk: bool,
    #[serde(default = "default_true")]
    pub dry_run_by_default: bool,

    #[serde(default = "default_max_watches")]
    pub max_watches: usize,

    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_max_requests: usize,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,

    #[serde(default = "default_trash_retention")]
    pub trash_retention_days: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults always deserialize")
    }
}

/// Owns the config file lifecycle: load on construction, persist on set.
pub struct ConfigManager {
    data_dir: PathBuf,
    config: AgentConfig,
}

impl ConfigManager {
    /// Load config.json from `data_dir`, creating it with defaults when
    /// missing or unreadable.
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let path = data_dir.join("config.json");
        let config = if path.exists() {
            match fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str::<AgentConfig>(&text).ok())
            {
                Some(cfg) => cfg,
                None => {
                    eprintln!("[Config] unreadable config.json, falling back to defaults");
                    AgentConfig::default()
                }
            }
        } else {
            let cfg = AgentConfig::default();
            Self::write(&path, &cfg)?;
            cfg
        };

        Ok(Self { data_dir, config })
    }

    fn write(path: &Path, config: &AgentConfig) -> Result<()> {
        let text = serde_json::to_string_pretty(config)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn set_profile(&mut self, profile: &str) -> Result<()> {
        self.config.default_profile = profile.to_string();
        self.save()
    }

    pub fn update(&mut self, f: impl FnOnce(&mut AgentConfig)) -> Result<()> {
        f(&mut self.config);
        self.save()
    }

    fn save(&self) -> Result<()> {
        Self::write(&self.data_dir.join("config.json"), &self.config)
    }
}
