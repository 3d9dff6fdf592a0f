//! Scheduler - durable time-triggered tasks.
//!
//! Rows live in the `scheduled_tasks` table. A background loop wakes
//! every ~5 s, pops due pending rows and hands them to the dispatcher
//! channel; reminders become notifications, everything else re-enters
//! the pipeline. Repeating rows advance by their period, `once` rows are
//! marked done (multiple missed periods coalesce into one fire).

use chrono::{Local, NaiveTime, TimeZone};
use regex::Regex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{AgentError, Result};
use crate::structured_log::{log_event, LogLevel};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    Once,
    Hourly,
    Daily,
    Weekly,
}

impl Repeat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Repeat::Once => "once",
            Repeat::Hourly => "hourly",
            Repeat::Daily => "daily",
            Repeat::Weekly => "weekly",
        }
    }

    pub fn parse(s: &str) -> Repeat {
        match s {
            "hourly" => Repeat::Hourly,
            "daily" => Repeat::Daily,
            "weekly" => Repeat::Weekly,
            _ => Repeat::Once,
        }
    }

    fn period_secs(&self) -> f64 {
        match self {
            Repeat::Once => 0.0,
            Repeat::Hourly => 3_600.0,
            Repeat::Daily => 86_400.0,
            Repeat::Weekly => 604_800.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: i64,
    pub run_at: f64,
    pub command: String,
    pub command_data: serde_json::Value,
    pub repeat: Repeat,
    pub status: String,
    pub created_at: f64,
    pub executed_at: Option<f64>,
}

/// A due row handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct DueTask {
    pub id: i64,
    pub command: String,
    pub data: serde_json::Value,
    pub repeat: Repeat,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct Scheduler {
    conn: Arc<Mutex<Connection>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init_table(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_table(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    fn init_table(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_at REAL NOT NULL,
                command TEXT NOT NULL,
                command_data TEXT,
                repeat TEXT DEFAULT 'once',
                status TEXT DEFAULT 'pending',
                created_at REAL NOT NULL,
                executed_at REAL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_run_at ON scheduled_tasks(run_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks(status);",
        )?;
        Ok(())
    }

    /// Insert a task. Exactly one of `run_at`, `delay_secs`, `time_str`
    /// decides the fire time; with none given the task runs in a minute.
    pub fn add_task(
        &self,
        command: &str,
        run_at: Option<f64>,
        delay_secs: Option<u64>,
        time_str: Option<&str>,
        repeat: Repeat,
        command_data: Option<serde_json::Value>,
    ) -> Result<i64> {
        let run_at = run_at
            .or_else(|| delay_secs.map(|d| now_secs() + d as f64))
            .or_else(|| time_str.and_then(next_occurrence))
            .unwrap_or_else(|| now_secs() + 60.0);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scheduled_tasks
             (run_at, command, command_data, repeat, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                run_at,
                command,
                command_data.map(|d| d.to_string()),
                repeat.as_str(),
                now_secs(),
            ],
        )?;
        let task_id = conn.last_insert_rowid();

        log_event(
            LogLevel::Info,
            "SCHEDULER",
            "task_added",
            serde_json::json!({"task_id": task_id, "command": command, "repeat": repeat.as_str()}),
        );
        Ok(task_id)
    }

    pub fn add_reminder(&self, message: &str, delay_secs: u64) -> Result<i64> {
        self.add_task(
            "reminder",
            None,
            Some(delay_secs),
            None,
            Repeat::Once,
            Some(serde_json::json!({"message": message})),
        )
    }

    pub fn cancel_task(&self, task_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE scheduled_tasks SET status = 'cancelled'
             WHERE id = ?1 AND status = 'pending'",
            params![task_id],
        )?;
        Ok(changed > 0)
    }

    pub fn pending_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.query_tasks("WHERE status = 'pending' ORDER BY run_at ASC", None)
    }

    pub fn all_tasks(&self, limit: usize) -> Result<Vec<ScheduledTask>> {
        self.query_tasks("ORDER BY created_at DESC LIMIT ?1", Some(limit))
    }

    fn query_tasks(&self, suffix: &str, limit: Option<usize>) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, run_at, command, command_data, repeat, status, created_at, executed_at
             FROM scheduled_tasks {}",
            suffix
        );
        let mut stmt = conn.prepare(&sql)?;

        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ScheduledTask> {
            let data: Option<String> = row.get(3)?;
            let repeat: String = row.get(4)?;
            Ok(ScheduledTask {
                id: row.get(0)?,
                run_at: row.get(1)?,
                command: row.get(2)?,
                command_data: data
                    .and_then(|d| serde_json::from_str(&d).ok())
                    .unwrap_or(serde_json::Value::Null),
                repeat: Repeat::parse(&repeat),
                status: row.get(5)?,
                created_at: row.get(6)?,
                executed_at: row.get(7)?,
            })
        };

        let rows = match limit {
            Some(n) => stmt
                .query_map(params![n as i64], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Start the background loop. Due tasks go to `dispatcher`.
    pub fn start(&self, dispatcher: Sender<DueTask>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let conn = self.conn.clone();
        let running = self.running.clone();

        let handle = std::thread::spawn(move || {
            eprintln!("[Scheduler] loop started");
            while running.load(Ordering::SeqCst) {
                if let Err(e) = Self::dispatch_due(&conn, &dispatcher) {
                    eprintln!("[Scheduler] dispatch error: {}", e);
                }

                // Sleep in slices so stop() is prompt
                for _ in 0..10 {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::sleep(POLL_INTERVAL / 10);
                }
            }
        });

        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Select due pending rows, dispatch each once, then either mark it
    /// done or advance its next run.
    fn dispatch_due(conn: &Arc<Mutex<Connection>>, dispatcher: &Sender<DueTask>) -> Result<()> {
        let now = now_secs();

        let due: Vec<(i64, String, Option<String>, String, f64)> = {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, command, command_data, repeat, run_at
                 FROM scheduled_tasks
                 WHERE status = 'pending' AND run_at <= ?1",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for (id, command, data, repeat_str, run_at) in due {
            let repeat = Repeat::parse(&repeat_str);
            let data = data
                .and_then(|d| serde_json::from_str(&d).ok())
                .unwrap_or(serde_json::Value::Null);

            dispatcher
                .send(DueTask {
                    id,
                    command: command.clone(),
                    data,
                    repeat,
                })
                .map_err(|_| AgentError::Internal("scheduler dispatcher closed".to_string()))?;

            let conn = conn.lock().unwrap();
            if repeat == Repeat::Once {
                conn.execute(
                    "UPDATE scheduled_tasks SET status = 'done', executed_at = ?1 WHERE id = ?2",
                    params![now_secs(), id],
                )?;
            } else {
                // Advance past now so a long outage does not cause a burst
                let period = repeat.period_secs();
                let mut next = run_at + period;
                while next <= now {
                    next += period;
                }
                conn.execute(
                    "UPDATE scheduled_tasks SET run_at = ?1, executed_at = ?2 WHERE id = ?3",
                    params![next, now_secs(), id],
                )?;
            }

            log_event(
                LogLevel::Info,
                "SCHEDULER",
                "task_fired",
                serde_json::json!({"task_id": id, "command": command}),
            );
        }

        Ok(())
    }

    /// Test hook: run one dispatch cycle synchronously.
    #[cfg(test)]
    fn dispatch_once(&self, dispatcher: &Sender<DueTask>) -> Result<()> {
        Self::dispatch_due(&self.conn, dispatcher)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// "5 دقائق" → 300. Understands seconds, minutes and hours in Arabic
/// and English.
pub fn parse_delay(text: &str) -> Option<u64> {
    let patterns: [(&str, u64); 3] = [
        (r"(\d+)\s*(ثانية|ثواني|sec|second)", 1),
        (r"(\d+)\s*(دقيقة|دقائق|min|minute)", 60),
        (r"(\d+)\s*(ساعة|ساعات|hour)", 3600),
    ];

    for (pattern, multiplier) in patterns {
        let re = Regex::new(pattern).expect("static pattern");
        if let Some(captures) = re.captures(text) {
            if let Ok(value) = captures[1].parse::<u64>() {
                return Some(value * multiplier);
            }
        }
    }
    None
}

/// "الساعة 9" → "09:00"; "9:30" stays "09:30"; مساءً adds 12.
pub fn parse_time(text: &str) -> Option<String> {
    let clock = Regex::new(r"(\d{1,2}):(\d{2})").expect("static pattern");
    if let Some(captures) = clock.captures(text) {
        let hour: u32 = captures[1].parse().ok()?;
        let minute: u32 = captures[2].parse().ok()?;
        if hour < 24 && minute < 60 {
            return Some(format!("{:02}:{:02}", hour, minute));
        }
    }

    let spoken = Regex::new(r"الساعة\s*(\d{1,2})|(\d{1,2})\s*(صباحا|مساء)").expect("static pattern");
    if let Some(captures) = spoken.captures(text) {
        let hour: u32 = captures
            .get(1)
            .or_else(|| captures.get(2))?
            .as_str()
            .parse()
            .ok()?;
        let hour = if text.contains("مساء") && hour < 12 {
            hour + 12
        } else {
            hour
        };
        if hour < 24 {
            return Some(format!("{:02}:00", hour));
        }
    }

    None
}

/// Today's instance of "HH:MM", or tomorrow's if it already passed.
fn next_occurrence(time_str: &str) -> Option<f64> {
    let time = NaiveTime::parse_from_str(time_str, "%H:%M").ok()?;
    let now = Local::now();
    let mut target = now.date_naive().and_time(time);
    if Local.from_local_datetime(&target).single()? <= now {
        target += chrono::Duration::days(1);
    }
    Some(Local.from_local_datetime(&target).single()?.timestamp() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_add_and_list() {
        let scheduler = Scheduler::open_in_memory().unwrap();
        let id = scheduler
            .add_reminder("الاجتماع", 300)
            .unwrap();

        let pending = scheduler.pending_tasks().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].command, "reminder");
        assert_eq!(pending[0].command_data["message"], "الاجتماع");

        let expected = now_secs() + 300.0;
        assert!((pending[0].run_at - expected).abs() < 5.0);
    }

    #[test]
    fn test_due_task_dispatched_and_marked_done() {
        let scheduler = Scheduler::open_in_memory().unwrap();
        scheduler
            .add_task(
                "reminder",
                Some(now_secs() - 1.0),
                None,
                None,
                Repeat::Once,
                Some(serde_json::json!({"message": "الاجتماع"})),
            )
            .unwrap();

        let (tx, rx) = channel();
        scheduler.dispatch_once(&tx).unwrap();

        let due = rx.try_recv().unwrap();
        assert_eq!(due.command, "reminder");

        let pending = scheduler.pending_tasks().unwrap();
        assert!(pending.is_empty());

        let all = scheduler.all_tasks(10).unwrap();
        assert_eq!(all[0].status, "done");
        assert!(all[0].executed_at.is_some());
    }

    #[test]
    fn test_repeating_task_advances() {
        let scheduler = Scheduler::open_in_memory().unwrap();
        scheduler
            .add_task(
                "open",
                Some(now_secs() - 10.0),
                None,
                None,
                Repeat::Hourly,
                Some(serde_json::json!({"target": "chrome"})),
            )
            .unwrap();

        let (tx, rx) = channel();
        scheduler.dispatch_once(&tx).unwrap();
        assert!(rx.try_recv().is_ok());

        let pending = scheduler.pending_tasks().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].run_at > now_secs());
    }

    #[test]
    fn test_overdue_once_fires_once() {
        let scheduler = Scheduler::open_in_memory().unwrap();
        // Three periods overdue, still exactly one fire
        scheduler
            .add_task(
                "reminder",
                Some(now_secs() - 10_000.0),
                None,
                None,
                Repeat::Once,
                None,
            )
            .unwrap();

        let (tx, rx) = channel();
        scheduler.dispatch_once(&tx).unwrap();
        scheduler.dispatch_once(&tx).unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel() {
        let scheduler = Scheduler::open_in_memory().unwrap();
        let id = scheduler.add_reminder("x", 600).unwrap();

        assert!(scheduler.cancel_task(id).unwrap());
        assert!(!scheduler.cancel_task(id).unwrap());
        assert!(scheduler.pending_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay("ذكرني بعد 5 دقائق"), Some(300));
        assert_eq!(parse_delay("after 30 seconds"), Some(30));
        assert_eq!(parse_delay("بعد ساعتين 2 ساعات"), Some(7200));
        assert_eq!(parse_delay("no time here"), None);
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("at 9:30"), Some("09:30".to_string()));
        assert_eq!(parse_time("الساعة 9"), Some("09:00".to_string()));
        assert_eq!(parse_time("9 مساء"), Some("21:00".to_string()));
        assert_eq!(parse_time("nothing"), None);
    }

    #[test]
    fn test_time_str_schedules_future() {
        let scheduler = Scheduler::open_in_memory().unwrap();
        scheduler
            .add_task("open", None, None, Some("00:00"), Repeat::Daily, None)
            .unwrap();

        let pending = scheduler.pending_tasks().unwrap();
        assert!(pending[0].run_at > now_secs());
    }
}
