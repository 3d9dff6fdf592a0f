//! Long-term store - conversations, system events and app usage counters.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub timestamp: f64,
    pub user_text: String,
    pub ai_response: Option<String>,
    pub intent: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: i64,
    pub timestamp: f64,
    pub event_type: String,
    pub details: Option<String>,
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppUsage {
    pub app_name: String,
    pub open_count: i64,
    pub last_used: f64,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                user_text TEXT NOT NULL,
                ai_response TEXT,
                intent TEXT,
                success INTEGER DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                event_type TEXT NOT NULL,
                details TEXT,
                target TEXT
            );
            CREATE TABLE IF NOT EXISTS app_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_name TEXT UNIQUE NOT NULL,
                open_count INTEGER DEFAULT 1,
                last_used REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conv_timestamp ON conversations(timestamp);
            CREATE INDEX IF NOT EXISTS idx_conv_intent ON conversations(intent);
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
            CREATE INDEX IF NOT EXISTS idx_app_name ON app_usage(app_name);",
        )?;
        Ok(())
    }

    pub fn save_conversation(
        &self,
        user_text: &str,
        ai_response: &serde_json::Value,
        intent: Option<&str>,
        success: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversations (timestamp, user_text, ai_response, intent, success)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                now_secs(),
                user_text,
                ai_response.to_string(),
                intent,
                success as i64
            ],
        )?;
        Ok(())
    }

    pub fn recent_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, user_text, ai_response, intent, success
             FROM conversations ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    user_text: row.get(2)?,
                    ai_response: row.get(3)?,
                    intent: row.get(4)?,
                    success: row.get::<_, i64>(5)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn save_event(&self, event_type: &str, details: &str, target: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (timestamp, event_type, details, target)
             VALUES (?1, ?2, ?3, ?4)",
            params![now_secs(), event_type, details, target],
        )?;
        Ok(())
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<SystemEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_type, details, target
             FROM events ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(SystemEvent {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    event_type: row.get(2)?,
                    details: row.get(3)?,
                    target: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn track_app_usage(&self, app_name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO app_usage (app_name, open_count, last_used)
             VALUES (?1, 1, ?2)
             ON CONFLICT(app_name) DO UPDATE SET
                open_count = open_count + 1,
                last_used = ?2",
            params![app_name.to_lowercase(), now_secs()],
        )?;
        Ok(())
    }

    pub fn most_used_apps(&self, limit: usize) -> Result<Vec<AppUsage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT app_name, open_count, last_used
             FROM app_usage ORDER BY open_count DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AppUsage {
                    app_name: row.get(0)?,
                    open_count: row.get(1)?,
                    last_used: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
