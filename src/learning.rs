//! Learning Store - persists user-resolved clarifications as reusable
//! patterns, plus the graph-fix patterns recorded by auto-repair.
//!
//! Flow: ask → user answers → learn(); next time → recall() fills the
//! blanks without asking, and confirm_usage() nudges confidence up.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::command::Command;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningPattern {
    pub pattern_id: String,
    pub intent: String,
    pub missing_fields: Vec<String>,
    pub resolution: HashMap<String, String>,
    pub confidence: f64,
    pub usage_count: i64,
    pub last_used: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphFixPattern {
    pub fix_id: String,
    pub rule_name: String,
    pub trigger_action: String,
    pub fix_action: String,
    pub usage_count: i64,
    pub created_at: String,
}

const INITIAL_CONFIDENCE: f64 = 0.6;
const USAGE_BOOST: f64 = 0.05;

/// SQLite-backed pattern storage (learning.db). Uniqueness key is
/// (intent, sorted missing_fields).
pub struct LearningStore {
    conn: Mutex<Connection>,
}

impl LearningStore {
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
            "CREATE TABLE IF NOT EXISTS patterns (
                pattern_id TEXT PRIMARY KEY,
                intent TEXT NOT NULL,
                missing_fields TEXT NOT NULL,
                resolution TEXT NOT NULL,
                confidence REAL DEFAULT 0.6,
                usage_count INTEGER DEFAULT 0,
                last_used TEXT,
                source TEXT DEFAULT 'user_confirmation',
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_patterns_intent ON patterns(intent);

            CREATE TABLE IF NOT EXISTS graph_fixes (
                fix_id TEXT PRIMARY KEY,
                rule_name TEXT NOT NULL,
                trigger_action TEXT NOT NULL,
                fix_action TEXT NOT NULL,
                usage_count INTEGER DEFAULT 0,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );",
        )?;
        Ok(())
    }

    fn missing_key(missing_fields: &[String]) -> String {
        let mut sorted: Vec<&String> = missing_fields.iter().collect();
        sorted.sort();
        serde_json::to_string(&sorted).unwrap_or_default()
    }

    /// Save a new pattern learned from a user resolution.
    pub fn learn(
        &self,
        intent: &str,
        missing_fields: &[String],
        resolution: &HashMap<String, String>,
    ) -> Result<LearningPattern> {
        let pattern = LearningPattern {
            pattern_id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            intent: intent.to_string(),
            missing_fields: {
                let mut sorted = missing_fields.to_vec();
                sorted.sort();
                sorted
            },
            resolution: resolution.clone(),
            confidence: INITIAL_CONFIDENCE,
            usage_count: 1,
            last_used: Utc::now().to_rfc3339(),
            source: "user_confirmation".to_string(),
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO patterns
             (pattern_id, intent, missing_fields, resolution, confidence, usage_count, last_used, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                pattern.pattern_id,
                pattern.intent,
                Self::missing_key(&pattern.missing_fields),
                serde_json::to_string(&pattern.resolution)?,
                pattern.confidence,
                pattern.usage_count,
                pattern.last_used,
                pattern.source,
            ],
        )?;

        Ok(pattern)
    }

    /// Highest-confidence pattern matching (intent, sorted missing).
    pub fn recall(&self, intent: &str, missing_fields: &[String]) -> Result<Option<LearningPattern>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT pattern_id, intent, missing_fields, resolution,
                        confidence, usage_count, last_used, source
                 FROM patterns
                 WHERE intent = ?1 AND missing_fields = ?2
                 ORDER BY confidence DESC, usage_count DESC
                 LIMIT 1",
                params![intent, Self::missing_key(missing_fields)],
                Self::row_to_pattern,
            )
            .optional()?;

        Ok(row)
    }

    fn row_to_pattern(row: &rusqlite::Row<'_>) -> rusqlite::Result<LearningPattern> {
        let missing_json: String = row.get(2)?;
        let resolution_json: String = row.get(3)?;
        Ok(LearningPattern {
            pattern_id: row.get(0)?,
            intent: row.get(1)?,
            missing_fields: serde_json::from_str(&missing_json).unwrap_or_default(),
            resolution: serde_json::from_str(&resolution_json).unwrap_or_default(),
            confidence: row.get(4)?,
            usage_count: row.get(5)?,
            last_used: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            source: row.get(7)?,
        })
    }

    /// Increment usage and add 0.05 confidence, clamped to 1.0.
    pub fn confirm_usage(&self, pattern_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE patterns
             SET usage_count = usage_count + 1,
                 confidence = MIN(1.0, confidence + ?1),
                 last_used = ?2
             WHERE pattern_id = ?3",
            params![USAGE_BOOST, Utc::now().to_rfc3339(), pattern_id],
        )?;
        Ok(())
    }

    /// Substitute learned values into the command's missing slots,
    /// marking the pattern id on success.
    pub fn apply_to_command(&self, command: &Command) -> Result<Command> {
        let missing = command.missing_fields();
        if missing.is_empty() {
            return Ok(command.clone());
        }

        let recalled = self.recall(command.intent.as_str(), &missing)?;
        let pattern = match recalled {
            Some(p) if p.confidence >= 0.5 => p,
            _ => return Ok(command.clone()),
        };

        let mut enhanced = command.clone();
        for (field, value) in &pattern.resolution {
            match field.as_str() {
                "target" if missing.contains(&"target".to_string()) => {
                    enhanced.target = Some(value.clone());
                }
                "loc" if missing.contains(&"loc".to_string()) => {
                    enhanced.loc = Some(value.clone());
                }
                "destination" => {
                    if enhanced.destination.is_none() {
                        enhanced.destination = Some(value.clone());
                    }
                }
                _ => {}
            }
        }
        enhanced.learning_pattern = Some(pattern.pattern_id.clone());

        Ok(enhanced)
    }

    pub fn all_patterns(&self) -> Result<Vec<LearningPattern>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT pattern_id, intent, missing_fields, resolution,
                    confidence, usage_count, last_used, source
             FROM patterns ORDER BY last_used DESC",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_pattern)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── graph-fix patterns ────────────────────────────────────────────

    pub fn learn_graph_fix(&self, rule: &str, trigger: &str, fix: &str) -> Result<GraphFixPattern> {
        let pattern = GraphFixPattern {
            fix_id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            rule_name: rule.to_string(),
            trigger_action: trigger.to_string(),
            fix_action: fix.to_string(),
            usage_count: 0,
            created_at: Utc::now().to_rfc3339(),
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO graph_fixes
             (fix_id, rule_name, trigger_action, fix_action, usage_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                pattern.fix_id,
                pattern.rule_name,
                pattern.trigger_action,
                pattern.fix_action,
                pattern.usage_count,
                pattern.created_at,
            ],
        )?;

        Ok(pattern)
    }

    pub fn graph_fixes(&self, rule: Option<&str>) -> Result<Vec<GraphFixPattern>> {
        let conn = self.conn.lock().unwrap();
        let mut query = String::from(
            "SELECT fix_id, rule_name, trigger_action, fix_action, usage_count, created_at
             FROM graph_fixes",
        );
        if rule.is_some() {
            query.push_str(" WHERE rule_name = ?1");
        }

        let mut stmt = conn.prepare(&query)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<GraphFixPattern> {
            Ok(GraphFixPattern {
                fix_id: row.get(0)?,
                rule_name: row.get(1)?,
                trigger_action: row.get(2)?,
                fix_action: row.get(3)?,
                usage_count: row.get(4)?,
                created_at: row.get(5)?,
            })
        };

        let rows = match rule {
            Some(r) => stmt
                .query_map(params![r], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }
}
