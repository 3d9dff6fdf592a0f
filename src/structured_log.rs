//! Structured Logging - JSON-formatted logs for machine parsing
//!
//! Every pipeline stage logs through here so traces can be replayed in
//! tests and monitoring tools.
//!
//! Usage:
//!   use crate::structured_log::{log_event, LogLevel};
//!
//!   log_event(LogLevel::Info, "PIPELINE", "decision", json!({
//!       "command_id": "CMD-20260801-8F3A",
//!       "action": "execute",
//!       "confidence": 0.85
//!   }));
//!
//! Output (to stderr and optionally file):
//!   {"timestamp":"2026-08-01T12:34:56Z","level":"info","component":"PIPELINE","event":"decision","data":{...}}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

lazy_static::lazy_static! {
    static ref LOG_FILE: Mutex<Option<File>> = Mutex::new(None);
    static ref LOG_CONFIG: Mutex<LogConfig> = Mutex::new(LogConfig::default());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    fn order(&self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub component: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub json_output: bool,
    pub file_path: Option<PathBuf>,
    pub min_level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            json_output: true,
            file_path: None,
            min_level: LogLevel::Info,
        }
    }
}

/// Initialize the structured logger
pub fn init_logger(config: LogConfig) {
    if let Some(path) = &config.file_path {
        if let Ok(file) = OpenOptions::new().create(true).append(true).open(path) {
            if let Ok(mut log_file) = LOG_FILE.lock() {
                *log_file = Some(file);
            }
        }
    }

    if let Ok(mut cfg) = LOG_CONFIG.lock() {
        *cfg = config;
    }
}

/// Log an event with structured data
pub fn log_event(level: LogLevel, component: &str, event: &str, data: serde_json::Value) {
    log_entry(level, component, event, None, Some(data));
}

/// Log a message with optional data
pub fn log_message(
    level: LogLevel,
    component: &str,
    event: &str,
    message: &str,
    data: Option<serde_json::Value>,
) {
    log_entry(level, component, event, Some(message.to_string()), data);
}

fn log_entry(
    level: LogLevel,
    component: &str,
    event: &str,
    message: Option<String>,
    data: Option<serde_json::Value>,
) {
    let config = match LOG_CONFIG.lock() {
        Ok(guard) => (*guard).clone(),
        Err(_) => LogConfig::default(),
    };

    if level.order() < config.min_level.order() {
        return;
    }

    let entry = LogEntry {
        timestamp: Utc::now(),
        level: level.as_str().to_string(),
        component: component.to_string(),
        event: event.to_string(),
        message,
        data,
    };

    let output = if config.json_output {
        serde_json::to_string(&entry).unwrap_or_else(|_| format!("{:?}", entry))
    } else {
        // Traditional format: [COMPONENT] event: message
        let msg = entry.message.as_deref().unwrap_or("");
        let data_str = entry
            .data
            .as_ref()
            .map(|d| format!(" {}", d))
            .unwrap_or_default();

        format!("[{}] {}: {}{}", entry.component, entry.event, msg, data_str)
    };

    eprintln!("{}", output);

    if let Ok(mut log_file) = LOG_FILE.lock() {
        if let Some(ref mut file) = *log_file {
            let _ = writeln!(file, "{}", output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serializes_as_json_line() {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level: "info".to_string(),
            component: "PIPELINE".to_string(),
            event: "decision".to_string(),
            message: None,
            data: Some(serde_json::json!({"action": "execute"})),
        };

        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"component\":\"PIPELINE\""));
        assert!(!line.contains("\"message\""));
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug.order() < LogLevel::Error.order());
    }
}
