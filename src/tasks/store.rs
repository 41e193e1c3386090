//! Durable persistence for the two tables this core owns (§6). Backed by
//! `rusqlite`; calls block the calling task directly rather than going
//! through `spawn_blocking` — the design assumes a local SQLite file with
//! per-operation latency bounded at tens of ms, so holding the task mutex
//! across a write is an accepted cost, not a bug (§5).

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::model::{ProgressEntry, Task, TaskMode, TaskStatus};

#[derive(Debug)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError(e.to_string())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tool_tasks (
  id TEXT PRIMARY KEY,
  tool_name TEXT, args TEXT, working_dir TEXT,
  session_id TEXT NULL, call_id TEXT NULL,
  mode TEXT, agent_name TEXT, command_name TEXT, command_args TEXT,
  origin TEXT, client_id TEXT,
  status TEXT, result TEXT, metadata TEXT, error TEXT,
  created_at INTEGER, updated_at INTEGER,
  completed_at INTEGER NULL
);
CREATE TABLE IF NOT EXISTS tool_task_progress (
  task_id TEXT,
  timestamp INTEGER,
  text TEXT, metadata TEXT, status TEXT
);
CREATE INDEX IF NOT EXISTS idx_tool_task_progress_task_id ON tool_task_progress(task_id, timestamp);
";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// Loads every `tool_tasks` row and attaches its `tool_task_progress`
    /// rows, ordered by `(task_id, timestamp)`. Progress rows whose task
    /// did not load are dropped.
    pub fn load_all(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().expect("task store mutex poisoned");

        let mut tasks: HashMap<String, Task> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, tool_name, args, working_dir, session_id, call_id, mode, agent_name,
                        command_name, command_args, origin, client_id, status, result, metadata,
                        error, created_at, updated_at, completed_at FROM tool_tasks",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Task {
                    id: row.get(0)?,
                    tool_name: row.get(1)?,
                    args: decode_json(row.get::<_, Option<String>>(2)?),
                    working_dir: row.get(3)?,
                    session_id: row.get(4)?,
                    call_id: row.get(5)?,
                    mode: TaskMode::from_str(&row.get::<_, String>(6)?),
                    agent_name: row.get(7)?,
                    command_name: row.get(8)?,
                    command_args: row
                        .get::<_, Option<String>>(9)?
                        .map(|s| decode_json(Some(s))),
                    origin: row.get(10)?,
                    client_id: row.get(11)?,
                    status: TaskStatus::from_str(&row.get::<_, String>(12)?),
                    result: row.get(13)?,
                    metadata: decode_json(row.get::<_, Option<String>>(14)?),
                    error: row.get(15)?,
                    created_at: from_epoch_nanos(row.get(16)?),
                    updated_at: from_epoch_nanos(row.get(17)?),
                    completed_at: row.get::<_, Option<i64>>(18)?.map(from_epoch_nanos),
                    progress: Vec::new(),
                })
            })?;
            for row in rows {
                let task = row?;
                tasks.insert(task.id.clone(), task);
            }
        }

        {
            let mut stmt = conn.prepare(
                "SELECT task_id, timestamp, text, metadata, status FROM tool_task_progress ORDER BY task_id, timestamp",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ProgressEntry {
                    task_id: row.get(0)?,
                    timestamp: from_epoch_nanos(row.get(1)?),
                    text: row.get(2)?,
                    metadata: row.get::<_, Option<String>>(3)?.map(|s| decode_json(Some(s))),
                    status: row.get(4)?,
                })
            })?;
            for row in rows {
                let entry = row?;
                if let Some(task) = tasks.get_mut(&entry.task_id) {
                    task.progress.push(entry);
                }
            }
        }

        Ok(tasks.into_values().collect())
    }

    /// `INSERT ... ON CONFLICT(id) DO UPDATE` — the manager is the only
    /// writer of this row, so this is always safe as an upsert.
    pub fn upsert_task(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("task store mutex poisoned");
        conn.execute(
            "INSERT INTO tool_tasks (
                id, tool_name, args, working_dir, session_id, call_id, mode, agent_name,
                command_name, command_args, origin, client_id, status, result, metadata,
                error, created_at, updated_at, completed_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
            ON CONFLICT(id) DO UPDATE SET
                tool_name=excluded.tool_name, args=excluded.args, working_dir=excluded.working_dir,
                session_id=excluded.session_id, call_id=excluded.call_id, mode=excluded.mode,
                agent_name=excluded.agent_name, command_name=excluded.command_name,
                command_args=excluded.command_args, origin=excluded.origin, client_id=excluded.client_id,
                status=excluded.status, result=excluded.result, metadata=excluded.metadata,
                error=excluded.error, updated_at=excluded.updated_at, completed_at=excluded.completed_at",
            params![
                task.id,
                task.tool_name,
                encode_json(&task.args),
                task.working_dir,
                task.session_id,
                task.call_id,
                task.mode.as_str(),
                task.agent_name,
                task.command_name,
                task.command_args.as_ref().map(encode_json),
                task.origin,
                task.client_id,
                task.status.as_str(),
                task.result,
                encode_json(&task.metadata),
                task.error,
                to_epoch_nanos(task.created_at),
                to_epoch_nanos(task.updated_at),
                task.completed_at.map(to_epoch_nanos),
            ],
        )?;
        Ok(())
    }

    pub fn insert_progress(&self, entry: &ProgressEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("task store mutex poisoned");
        conn.execute(
            "INSERT INTO tool_task_progress (task_id, timestamp, text, metadata, status) VALUES (?1,?2,?3,?4,?5)",
            params![
                entry.task_id,
                to_epoch_nanos(entry.timestamp),
                entry.text,
                entry.metadata.as_ref().map(encode_json),
                entry.status,
            ],
        )?;
        Ok(())
    }

    /// Deletes progress rows then task rows for the given IDs in one
    /// transaction, then prunes any orphaned progress rows.
    pub fn delete_tasks(&self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("task store mutex poisoned");
        let tx = conn.transaction()?;
        {
            let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let progress_sql = format!("DELETE FROM tool_task_progress WHERE task_id IN ({placeholders})");
            let task_sql = format!("DELETE FROM tool_tasks WHERE id IN ({placeholders})");
            let refs: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
            tx.execute(&progress_sql, refs.as_slice())?;
            tx.execute(&task_sql, refs.as_slice())?;
            tx.execute(
                "DELETE FROM tool_task_progress WHERE task_id NOT IN (SELECT id FROM tool_tasks)",
                [],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn task_ids_by_session(&self, session_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().expect("task store mutex poisoned");
        let mut stmt = conn.prepare("SELECT id FROM tool_tasks WHERE session_id = ?1")?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn task_ids_by_call(&self, call_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().expect("task store mutex poisoned");
        let mut stmt = conn.prepare("SELECT id FROM tool_tasks WHERE call_id = ?1")?;
        let rows = stmt
            .query_map(params![call_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn task_ids_by_agent(&self, agent_name: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().expect("task store mutex poisoned");
        let mut stmt = conn.prepare("SELECT id FROM tool_tasks WHERE agent_name = ?1")?;
        let rows = stmt
            .query_map(params![agent_name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub fn progress_row_count(&self, task_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("task store mutex poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tool_task_progress WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    #[cfg(test)]
    pub fn task_exists(&self, task_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("task store mutex poisoned");
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM tool_tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn encode_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn decode_json(raw: Option<String>) -> Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null)
}

fn to_epoch_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(0)
}

fn from_epoch_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}
