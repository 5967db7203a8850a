//! Task repository: SQLite-backed durable store for tasks, cost log
//! entries, and session summaries.
//!
//! The repository is the single source of truth for cost and status.
//! Mutations are last-write-wins per field; there is no concurrent writer
//! to the same node under the cooperative scheduler. The ancestor cost
//! cascade is applied as a sequential series of single-row updates so
//! arbitrarily deep trees need no multi-row transaction.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::memory::SessionMemory;
use crate::task::{NewTask, Task, TaskId, TaskRole, TaskStatus};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    parent_id     TEXT,
    depth         INTEGER NOT NULL DEFAULT 0,
    status        TEXT NOT NULL DEFAULT 'queued',
    role          TEXT NOT NULL DEFAULT 'worker',
    description   TEXT NOT NULL,
    model         TEXT,
    step_count    INTEGER NOT NULL DEFAULT 0,
    max_steps     INTEGER NOT NULL DEFAULT 10,
    budget_nanos  INTEGER NOT NULL DEFAULT 0,
    cost_nanos    INTEGER NOT NULL DEFAULT 0,
    input_tokens  INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    result        TEXT,
    error         TEXT,
    conversation  TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);

CREATE TABLE IF NOT EXISTS cost_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp     TEXT NOT NULL,
    task_id       TEXT,
    model         TEXT NOT NULL,
    input_tokens  INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cost_nanos    INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cost_log_timestamp ON cost_log(timestamp);

CREATE TABLE IF NOT EXISTS memory_session (
    id          TEXT PRIMARY KEY NOT NULL,
    task_id     TEXT NOT NULL,
    description TEXT NOT NULL,
    result      TEXT NOT NULL,
    tags        TEXT NOT NULL,
    tier        TEXT NOT NULL,
    steps       INTEGER NOT NULL,
    role        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memory_session_created ON memory_session(created_at);
"#;

/// Errors from repository operations.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    InvalidRow(String),

    #[error("background task failed: {0}")]
    Background(String),
}

/// Immutable record of one reasoning-service call.
#[derive(Debug, Clone)]
pub struct CostLogEntry {
    pub task_id: TaskId,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanos: u64,
}

/// Durable store consumed by the engine.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(&self, new: NewTask) -> Result<Task, RepoError>;
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, RepoError>;

    /// Set the status and optionally the terminal payload. Last write wins.
    async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), RepoError>;

    async fn set_model(&self, id: &TaskId, model: &str) -> Result<(), RepoError>;
    async fn set_step_count(&self, id: &TaskId, steps: u32) -> Result<(), RepoError>;

    /// Store or clear the suspended conversation snapshot for a node.
    async fn save_conversation(
        &self,
        id: &TaskId,
        conversation_json: Option<&str>,
    ) -> Result<(), RepoError>;
    async fn load_conversation(&self, id: &TaskId) -> Result<Option<String>, RepoError>;

    /// Tasks that are queued, classifying, or in progress.
    async fn list_active(&self) -> Result<Vec<Task>, RepoError>;

    /// Tasks stranded `in_progress`, for the recovery sweep.
    async fn list_interrupted(&self) -> Result<Vec<Task>, RepoError>;

    async fn children_of(&self, parent: &TaskId) -> Result<Vec<Task>, RepoError>;
    async fn subtask_count(&self, parent: &TaskId) -> Result<u32, RepoError>;

    /// Append a cost-log entry and add its cost to the owning task.
    async fn log_cost(&self, entry: CostLogEntry) -> Result<(), RepoError>;

    /// Add `delta_nanos` to every ancestor of `from`, walking the parent
    /// chain one row at a time. Returns the number of ancestors touched.
    async fn cascade_cost(&self, from: &TaskId, delta_nanos: u64) -> Result<u32, RepoError>;

    async fn daily_cost(&self) -> Result<u64, RepoError>;
    async fn monthly_cost(&self) -> Result<u64, RepoError>;

    async fn save_session_memory(&self, memory: &SessionMemory) -> Result<(), RepoError>;
    async fn recent_session_memories(&self, limit: u32) -> Result<Vec<SessionMemory>, RepoError>;
    async fn search_session_memories(
        &self,
        keywords: &[String],
        limit: u32,
    ) -> Result<Vec<SessionMemory>, RepoError>;
}

/// SQLite implementation of the task repository.
pub struct SqliteTaskRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskRepository {
    /// Open (or create) the database at `path`.
    pub async fn open(path: PathBuf) -> Result<Self, RepoError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, RepoError> {
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| RepoError::Background(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self, RepoError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn now_string() -> String {
    Utc::now().to_rfc3339()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepoError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RepoError::InvalidRow(format!("bad timestamp '{}': {}", raw, e)))
}

fn row_to_task(row: &Row<'_>) -> Result<Task, RepoError> {
    let id_raw: String = row.get("id")?;
    let id = id_raw
        .parse()
        .map_err(|_| RepoError::InvalidRow(format!("bad task id '{}'", id_raw)))?;

    let parent_id = match row.get::<_, Option<String>>("parent_id")? {
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| RepoError::InvalidRow(format!("bad parent id '{}'", raw)))?,
        ),
        None => None,
    };

    let status_raw: String = row.get("status")?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| RepoError::InvalidRow(format!("bad status '{}'", status_raw)))?;

    let role_raw: String = row.get("role")?;
    let role = TaskRole::parse(&role_raw)
        .ok_or_else(|| RepoError::InvalidRow(format!("bad role '{}'", role_raw)))?;

    let created_raw: String = row.get("created_at")?;
    let updated_raw: String = row.get("updated_at")?;

    Ok(Task {
        id,
        created_at: parse_timestamp(&created_raw)?,
        updated_at: parse_timestamp(&updated_raw)?,
        parent_id,
        depth: row.get::<_, i64>("depth")? as u8,
        status,
        role,
        description: row.get("description")?,
        model: row.get("model")?,
        step_count: row.get::<_, i64>("step_count")? as u32,
        max_steps: row.get::<_, i64>("max_steps")? as u32,
        budget_nanos: row.get::<_, i64>("budget_nanos")? as u64,
        cost_nanos: row.get::<_, i64>("cost_nanos")? as u64,
        input_tokens: row.get::<_, i64>("input_tokens")? as u64,
        output_tokens: row.get::<_, i64>("output_tokens")? as u64,
        result: row.get("result")?,
        error: row.get("error")?,
    })
}

fn row_to_memory(row: &Row<'_>) -> Result<SessionMemory, RepoError> {
    let task_raw: String = row.get("task_id")?;
    let task_id = task_raw
        .parse()
        .map_err(|_| RepoError::InvalidRow(format!("bad task id '{}'", task_raw)))?;

    let role_raw: String = row.get("role")?;
    let role = TaskRole::parse(&role_raw)
        .ok_or_else(|| RepoError::InvalidRow(format!("bad role '{}'", role_raw)))?;

    let tags_raw: String = row.get("tags")?;
    let created_raw: String = row.get("created_at")?;

    Ok(SessionMemory {
        id: row.get("id")?,
        task_id,
        description: row.get("description")?,
        result: row.get("result")?,
        tags: tags_raw
            .split(',')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect(),
        tier: row.get("tier")?,
        steps: row.get::<_, i64>("steps")? as u32,
        role,
        created_at: parse_timestamp(&created_raw)?,
    })
}

const TASK_COLUMNS: &str = "id, created_at, updated_at, parent_id, depth, status, role, \
     description, model, step_count, max_steps, budget_nanos, cost_nanos, \
     input_tokens, output_tokens, result, error";

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create_task(&self, new: NewTask) -> Result<Task, RepoError> {
        let conn = self.conn.lock().await;
        let now = now_string();
        let id = TaskId::new();

        conn.execute(
            "INSERT INTO tasks (id, created_at, updated_at, parent_id, depth, status, role, \
                                description, budget_nanos, max_steps) \
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id.to_string(),
                now,
                new.parent_id.map(|p| p.to_string()),
                new.depth as i64,
                TaskStatus::Queued.as_str(),
                new.role.as_str(),
                new.description,
                new.budget_nanos as i64,
                new.max_steps as i64,
            ],
        )?;

        let task = conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id.to_string()],
            |row| Ok(row_to_task(row)),
        )??;
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, RepoError> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id.to_string()],
                |row| Ok(row_to_task(row)),
            )
            .optional()?
            .transpose()?;
        Ok(task)
    }

    async fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), RepoError> {
        let conn = self.conn.lock().await;

        let previous: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(prev) = previous.as_deref().and_then(TaskStatus::parse) {
            if prev != status && !prev.can_transition_to(status) {
                tracing::warn!(task_id = %id, from = %prev, to = %status, "irregular status transition");
            }
        }

        conn.execute(
            "UPDATE tasks SET status = ?1, \
                 result = COALESCE(?2, result), \
                 error = COALESCE(?3, error), \
                 updated_at = ?4 \
             WHERE id = ?5",
            params![status.as_str(), result, error, now_string(), id.to_string()],
        )?;
        Ok(())
    }

    async fn set_model(&self, id: &TaskId, model: &str) -> Result<(), RepoError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET model = ?1, updated_at = ?2 WHERE id = ?3",
            params![model, now_string(), id.to_string()],
        )?;
        Ok(())
    }

    async fn set_step_count(&self, id: &TaskId, steps: u32) -> Result<(), RepoError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET step_count = ?1, updated_at = ?2 WHERE id = ?3",
            params![steps as i64, now_string(), id.to_string()],
        )?;
        Ok(())
    }

    async fn save_conversation(
        &self,
        id: &TaskId,
        conversation_json: Option<&str>,
    ) -> Result<(), RepoError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET conversation = ?1, updated_at = ?2 WHERE id = ?3",
            params![conversation_json, now_string(), id.to_string()],
        )?;
        Ok(())
    }

    async fn load_conversation(&self, id: &TaskId) -> Result<Option<String>, RepoError> {
        let conn = self.conn.lock().await;
        let snapshot: Option<Option<String>> = conn
            .query_row(
                "SELECT conversation FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(snapshot.flatten())
    }

    async fn list_active(&self) -> Result<Vec<Task>, RepoError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks \
             WHERE status IN ('queued', 'classifying', 'in_progress') \
             ORDER BY created_at",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map([], |row| Ok(row_to_task(row)))?;
        rows.collect::<Result<Result<Vec<_>, _>, _>>()?
    }

    async fn list_interrupted(&self) -> Result<Vec<Task>, RepoError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE status = 'in_progress' ORDER BY created_at",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map([], |row| Ok(row_to_task(row)))?;
        rows.collect::<Result<Result<Vec<_>, _>, _>>()?
    }

    async fn children_of(&self, parent: &TaskId) -> Result<Vec<Task>, RepoError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE parent_id = ?1 ORDER BY created_at",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![parent.to_string()], |row| Ok(row_to_task(row)))?;
        rows.collect::<Result<Result<Vec<_>, _>, _>>()?
    }

    async fn subtask_count(&self, parent: &TaskId) -> Result<u32, RepoError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE parent_id = ?1",
            params![parent.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    async fn log_cost(&self, entry: CostLogEntry) -> Result<(), RepoError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cost_log (timestamp, task_id, model, input_tokens, output_tokens, cost_nanos) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                now_string(),
                entry.task_id.to_string(),
                entry.model,
                entry.input_tokens as i64,
                entry.output_tokens as i64,
                entry.cost_nanos as i64,
            ],
        )?;
        conn.execute(
            "UPDATE tasks SET \
                 cost_nanos = cost_nanos + ?1, \
                 input_tokens = input_tokens + ?2, \
                 output_tokens = output_tokens + ?3, \
                 updated_at = ?4 \
             WHERE id = ?5",
            params![
                entry.cost_nanos as i64,
                entry.input_tokens as i64,
                entry.output_tokens as i64,
                now_string(),
                entry.task_id.to_string(),
            ],
        )?;
        Ok(())
    }

    async fn cascade_cost(&self, from: &TaskId, delta_nanos: u64) -> Result<u32, RepoError> {
        if delta_nanos == 0 {
            return Ok(0);
        }
        let conn = self.conn.lock().await;
        let mut current = from.to_string();
        let mut touched = 0u32;

        loop {
            let parent: Option<String> = conn
                .query_row(
                    "SELECT parent_id FROM tasks WHERE id = ?1",
                    params![current],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?
                .flatten();

            let Some(parent_id) = parent else { break };

            conn.execute(
                "UPDATE tasks SET cost_nanos = cost_nanos + ?1, updated_at = ?2 WHERE id = ?3",
                params![delta_nanos as i64, now_string(), parent_id],
            )?;
            touched += 1;
            current = parent_id;
        }

        Ok(touched)
    }

    async fn daily_cost(&self) -> Result<u64, RepoError> {
        let conn = self.conn.lock().await;
        let prefix = format!("{}%", Utc::now().format("%Y-%m-%d"));
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(cost_nanos), 0) FROM cost_log WHERE timestamp LIKE ?1",
            params![prefix],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    async fn monthly_cost(&self) -> Result<u64, RepoError> {
        let conn = self.conn.lock().await;
        let prefix = format!("{}%", Utc::now().format("%Y-%m"));
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(cost_nanos), 0) FROM cost_log WHERE timestamp LIKE ?1",
            params![prefix],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    async fn save_session_memory(&self, memory: &SessionMemory) -> Result<(), RepoError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO memory_session \
                 (id, task_id, description, result, tags, tier, steps, role, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                memory.id,
                memory.task_id.to_string(),
                memory.description,
                memory.result,
                memory.tags.join(","),
                memory.tier,
                memory.steps as i64,
                memory.role.as_str(),
                memory.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn recent_session_memories(&self, limit: u32) -> Result<Vec<SessionMemory>, RepoError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, description, result, tags, tier, steps, role, created_at \
             FROM memory_session ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| Ok(row_to_memory(row)))?;
        rows.collect::<Result<Result<Vec<_>, _>, _>>()?
    }

    async fn search_session_memories(
        &self,
        keywords: &[String],
        limit: u32,
    ) -> Result<Vec<SessionMemory>, RepoError> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().await;

        let conditions = keywords
            .iter()
            .enumerate()
            .map(|(i, _)| format!("tags LIKE ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT id, task_id, description, result, tags, tier, steps, role, created_at \
             FROM memory_session WHERE {} ORDER BY created_at DESC LIMIT ?{}",
            conditions,
            keywords.len() + 1
        );

        let mut values: Vec<rusqlite::types::Value> = keywords
            .iter()
            .map(|kw| rusqlite::types::Value::Text(format!("%{}%", kw)))
            .collect();
        values.push(rusqlite::types::Value::Integer(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| Ok(row_to_memory(row)))?;
        rows.collect::<Result<Result<Vec<_>, _>, _>>()?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SqliteTaskRepository {
        SqliteTaskRepository::open_in_memory().unwrap()
    }

    fn root_task(budget_nanos: u64) -> NewTask {
        NewTask::root("summarize chapter 3", TaskRole::Worker, budget_nanos, 12)
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let repo = repo();
        let task = repo.create_task(root_task(500_000_000)).await.unwrap();

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.depth, 0);
        assert_eq!(task.budget_nanos, 500_000_000);
        assert_eq!(task.cost_nanos, 0);

        let fetched = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.description, "summarize chapter 3");
    }

    #[tokio::test]
    async fn get_missing_task_returns_none() {
        let repo = repo();
        assert!(repo.get_task(&TaskId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_status_persists_terminal_payload() {
        let repo = repo();
        let task = repo.create_task(root_task(1_000_000_000)).await.unwrap();

        repo.update_status(&task.id, TaskStatus::Classifying, None, None)
            .await
            .unwrap();
        repo.update_status(&task.id, TaskStatus::InProgress, None, None)
            .await
            .unwrap();
        repo.update_status(&task.id, TaskStatus::Completed, Some("done"), None)
            .await
            .unwrap();

        let fetched = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.result.as_deref(), Some("done"));
        assert!(fetched.error.is_none());
    }

    #[tokio::test]
    async fn log_cost_appends_and_updates_task_totals() {
        let repo = repo();
        let task = repo.create_task(root_task(1_000_000_000)).await.unwrap();

        repo.log_cost(CostLogEntry {
            task_id: task.id,
            model: "anthropic/claude-sonnet-4.5".to_string(),
            input_tokens: 1000,
            output_tokens: 500,
            cost_nanos: 10_500_000,
        })
        .await
        .unwrap();

        let fetched = repo.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.cost_nanos, 10_500_000);
        assert_eq!(fetched.input_tokens, 1000);
        assert_eq!(fetched.output_tokens, 500);
        assert_eq!(repo.daily_cost().await.unwrap(), 10_500_000);
        assert_eq!(repo.monthly_cost().await.unwrap(), 10_500_000);
    }

    #[tokio::test]
    async fn cascade_adds_to_every_ancestor_exactly_once() {
        let repo = repo();
        let root = repo.create_task(root_task(5_000_000_000)).await.unwrap();
        let mid = repo
            .create_task(NewTask::child("mid", root.id, 0, 1_000_000_000, 8))
            .await
            .unwrap();
        let leaf = repo
            .create_task(NewTask::child("leaf", mid.id, 1, 200_000_000, 5))
            .await
            .unwrap();

        let touched = repo.cascade_cost(&leaf.id, 7_000_000).await.unwrap();
        assert_eq!(touched, 2);

        let root_after = repo.get_task(&root.id).await.unwrap().unwrap();
        let mid_after = repo.get_task(&mid.id).await.unwrap().unwrap();
        let leaf_after = repo.get_task(&leaf.id).await.unwrap().unwrap();
        assert_eq!(root_after.cost_nanos, 7_000_000);
        assert_eq!(mid_after.cost_nanos, 7_000_000);
        // The cascade only touches ancestors, never the child itself
        assert_eq!(leaf_after.cost_nanos, 0);

        // Re-reading the child does not re-apply the cascade
        let _ = repo.get_task(&leaf.id).await.unwrap();
        let root_again = repo.get_task(&root.id).await.unwrap().unwrap();
        assert_eq!(root_again.cost_nanos, 7_000_000);
    }

    #[tokio::test]
    async fn cascade_of_zero_is_a_no_op() {
        let repo = repo();
        let root = repo.create_task(root_task(1_000_000_000)).await.unwrap();
        let child = repo
            .create_task(NewTask::child("child", root.id, 0, 100_000_000, 8))
            .await
            .unwrap();
        assert_eq!(repo.cascade_cost(&child.id, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn subtask_count_tracks_children() {
        let repo = repo();
        let root = repo.create_task(root_task(1_000_000_000)).await.unwrap();
        assert_eq!(repo.subtask_count(&root.id).await.unwrap(), 0);

        for i in 0..3 {
            repo.create_task(NewTask::child(
                format!("child {}", i),
                root.id,
                0,
                100_000_000,
                8,
            ))
            .await
            .unwrap();
        }
        assert_eq!(repo.subtask_count(&root.id).await.unwrap(), 3);
        assert_eq!(repo.children_of(&root.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn interrupted_scan_sees_only_in_progress_rows() {
        let repo = repo();
        let stuck = repo.create_task(root_task(1_000_000_000)).await.unwrap();
        let done = repo.create_task(root_task(1_000_000_000)).await.unwrap();
        let paused = repo.create_task(root_task(1_000_000_000)).await.unwrap();

        repo.update_status(&stuck.id, TaskStatus::InProgress, None, None)
            .await
            .unwrap();
        repo.update_status(&done.id, TaskStatus::Completed, Some("ok"), None)
            .await
            .unwrap();
        repo.update_status(&paused.id, TaskStatus::Checkpoint, None, None)
            .await
            .unwrap();

        let interrupted = repo.list_interrupted().await.unwrap();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].id, stuck.id);
    }

    #[tokio::test]
    async fn conversation_snapshot_round_trips() {
        let repo = repo();
        let task = repo.create_task(root_task(1_000_000_000)).await.unwrap();

        assert!(repo.load_conversation(&task.id).await.unwrap().is_none());
        repo.save_conversation(&task.id, Some(r#"[{"role":"user"}]"#))
            .await
            .unwrap();
        assert_eq!(
            repo.load_conversation(&task.id).await.unwrap().as_deref(),
            Some(r#"[{"role":"user"}]"#)
        );
        repo.save_conversation(&task.id, None).await.unwrap();
        assert!(repo.load_conversation(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_memories_search_by_tag() {
        let repo = repo();
        let task = repo.create_task(root_task(1_000_000_000)).await.unwrap();

        let memory = SessionMemory::from_completion(
            task.id,
            "analyze the fft results",
            "peaks found at 50Hz",
            "standard",
            4,
            TaskRole::Worker,
        );
        repo.save_session_memory(&memory).await.unwrap();

        let recent = repo.recent_session_memories(2).await.unwrap();
        assert_eq!(recent.len(), 1);

        let hits = repo
            .search_session_memories(&["fft".to_string()], 3)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].task_id, task.id);

        let misses = repo
            .search_session_memories(&["unrelated".to_string()], 3)
            .await
            .unwrap();
        assert!(misses.is_empty());
    }
}
