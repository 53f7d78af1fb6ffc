//! SQLite implementation of the task store.
//!
//! One `agent_tasks` table; the plan, stats and conversation aggregates are
//! stored as opaque JSON so the schema survives plan-shape changes.
//! Transient connection errors retry up to three times with exponential
//! backoff; everything else surfaces.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::domain::errors::{sqlx_is_transient, CoreError, CoreResult};
use crate::domain::models::{
    Plan, Platform, Task, TaskMode, TaskPatch, TaskStats, TaskStatus,
};
use crate::domain::ports::TaskStore;

use super::migrations::{all_embedded_migrations, Migrator};

/// Exponential backoff for transient database failures.
const DB_RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Connect, create the schema idempotently and return the store.
    pub async fn connect(database_url: &str) -> CoreResult<Self> {
        ensure_database_directory(database_url)?;
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| CoreError::Fatal(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(CoreError::from)?;

        let migrator = Migrator::new(pool.clone());
        migrator
            .run_embedded_migrations(all_embedded_migrations())
            .await
            .map_err(|e| CoreError::Fatal(format!("migration failed: {e}")))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `op` with bounded retry of transient connection errors.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if sqlx_is_transient(&err) && attempt < DB_RETRY_BACKOFF.len() => {
                    warn!(attempt = attempt + 1, error = %err, "transient database error, retrying");
                    tokio::time::sleep(DB_RETRY_BACKOFF[attempt]).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn ensure_database_directory(database_url: &str) -> CoreResult<()> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Fatal(format!("failed to create db directory: {e}")))?;
        }
    }
    Ok(())
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> CoreResult<Task> {
    let id: String = row.get("task_id");
    let status: String = row.get("status");
    let mode: String = row.get("mode");
    let platform: String = row.get("platform");
    let stats: String = row.get("stats");
    let plan: String = row.get("plan");
    let conversation: String = row.get("conversation");
    let created_at: String = row.get("created_at");
    let started_at: Option<String> = row.get("started_at");
    let ended_at: Option<String> = row.get("ended_at");

    let parse_time = |s: &str| -> CoreResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| CoreError::Fatal(format!("bad timestamp in store: {e}")))
    };

    Ok(Task {
        id: Uuid::parse_str(&id).map_err(|e| CoreError::Fatal(format!("bad task id: {e}")))?,
        instruction: row.get("instruction"),
        status: TaskStatus::from_str(&status)
            .ok_or_else(|| CoreError::Fatal(format!("unknown status {status}")))?,
        created_at: parse_time(&created_at)?,
        started_at: started_at.as_deref().map(parse_time).transpose()?,
        ended_at: ended_at.as_deref().map(parse_time).transpose()?,
        sandbox_id: row.get("sandbox_id"),
        destroy_sandbox_on_exit: row.get::<i64, _>("destroy_sandbox_on_exit") != 0,
        mode: TaskMode::from_str(&mode).unwrap_or_default(),
        max_steps: row.get::<i64, _>("max_steps") as u32,
        platform: Platform::from_str(&platform).unwrap_or_default(),
        stats: serde_json::from_str::<TaskStats>(&stats).unwrap_or_default(),
        final_message: row.get("final_message"),
        plan: serde_json::from_str::<Plan>(&plan).unwrap_or_default(),
        conversation: serde_json::from_str(&conversation).unwrap_or_default(),
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: &Task) -> CoreResult<()> {
        let stats = serde_json::to_string(&task.stats)?;
        let plan = serde_json::to_string(&task.plan)?;
        let conversation = serde_json::to_string(&task.conversation)?;

        let result = self
            .with_retry(|| {
                let stats = stats.clone();
                let plan = plan.clone();
                let conversation = conversation.clone();
                async move {
                    sqlx::query(
                        r#"INSERT INTO agent_tasks
                           (task_id, instruction, status, mode, platform, max_steps, sandbox_id,
                            destroy_sandbox_on_exit, stats, plan, conversation, final_message,
                            created_at, started_at, ended_at)
                           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                    )
                    .bind(task.id.to_string())
                    .bind(&task.instruction)
                    .bind(task.status.as_str())
                    .bind(task.mode.as_str())
                    .bind(task.platform.as_str())
                    .bind(task.max_steps as i64)
                    .bind(&task.sandbox_id)
                    .bind(task.destroy_sandbox_on_exit as i64)
                    .bind(stats)
                    .bind(plan)
                    .bind(conversation)
                    .bind(&task.final_message)
                    .bind(task.created_at.to_rfc3339())
                    .bind(task.started_at.map(|t| t.to_rfc3339()))
                    .bind(task.ended_at.map(|t| t.to_rfc3339()))
                    .execute(&self.pool)
                    .await
                }
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(CoreError::Fatal(message)) if message.contains("UNIQUE constraint") => {
                Err(CoreError::AlreadyExists(task.id))
            }
            Err(err) => Err(err),
        }
    }

    async fn update(&self, id: Uuid, patch: TaskPatch) -> CoreResult<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(status) = patch.status {
            sets.push("status = ?");
            values.push(status.as_str().to_string());
        }
        if let Some(at) = patch.started_at {
            sets.push("started_at = ?");
            values.push(at.to_rfc3339());
        }
        if let Some(at) = patch.ended_at {
            sets.push("ended_at = ?");
            values.push(at.to_rfc3339());
        }
        if let Some(ref sandbox_id) = patch.sandbox_id {
            sets.push("sandbox_id = ?");
            values.push(sandbox_id.clone());
        }
        if let Some(ref stats) = patch.stats {
            sets.push("stats = ?");
            values.push(serde_json::to_string(stats)?);
        }
        if let Some(ref message) = patch.final_message {
            sets.push("final_message = ?");
            values.push(message.clone());
        }
        if let Some(ref plan) = patch.plan {
            sets.push("plan = ?");
            values.push(serde_json::to_string(plan)?);
        }

        let sql = format!(
            "UPDATE agent_tasks SET {} WHERE task_id = ?",
            sets.join(", ")
        );

        let affected = self
            .with_retry(|| {
                let sql = sql.clone();
                let values = values.clone();
                async move {
                    let mut query = sqlx::query(&sql);
                    for value in &values {
                        query = query.bind(value);
                    }
                    query
                        .bind(id.to_string())
                        .execute(&self.pool)
                        .await
                        .map(|r| r.rows_affected())
                }
            })
            .await?;

        if affected == 0 {
            return Err(CoreError::not_found_task(id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Task> {
        let row = self
            .with_retry(|| async {
                sqlx::query("SELECT * FROM agent_tasks WHERE task_id = ?")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await
            })
            .await?;

        match row {
            Some(row) => row_to_task(&row),
            None => Err(CoreError::not_found_task(id)),
        }
    }

    async fn list(&self, limit: usize, offset: usize) -> CoreResult<(Vec<Task>, usize)> {
        let total: i64 = self
            .with_retry(|| async {
                sqlx::query_scalar("SELECT COUNT(*) FROM agent_tasks")
                    .fetch_one(&self.pool)
                    .await
            })
            .await?;

        let rows = self
            .with_retry(|| async {
                sqlx::query(
                    "SELECT * FROM agent_tasks ORDER BY created_at DESC, task_id LIMIT ? OFFSET ?",
                )
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await
            })
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(row_to_task(row)?);
        }
        Ok((tasks, total as usize))
    }

    async fn append_conversation(
        &self,
        id: Uuid,
        messages: Vec<serde_json::Value>,
    ) -> CoreResult<()> {
        // Read-modify-write is safe: the dispatcher is the only writer for
        // a given task id.
        let task = self.get(id).await?;
        let mut conversation = task.conversation;
        conversation.extend(messages);
        let serialized = serde_json::to_string(&conversation)?;

        let affected = self
            .with_retry(|| {
                let serialized = serialized.clone();
                async move {
                    sqlx::query("UPDATE agent_tasks SET conversation = ? WHERE task_id = ?")
                        .bind(serialized)
                        .bind(id.to_string())
                        .execute(&self.pool)
                        .await
                        .map(|r| r.rows_affected())
                }
            })
            .await?;

        if affected == 0 {
            return Err(CoreError::not_found_task(id));
        }
        Ok(())
    }

    async fn recover_interrupted(&self) -> CoreResult<u64> {
        let affected = self
            .with_retry(|| async {
                sqlx::query(
                    "UPDATE agent_tasks
                     SET status = 'failed', final_message = 'process_restart', ended_at = ?
                     WHERE status IN ('running', 'pending')",
                )
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Subtask;

    async fn store() -> SqliteTaskStore {
        SqliteTaskStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_schema_is_created_idempotently() {
        let store = store().await;
        let migrator = Migrator::new(store.pool().clone());
        // Second run applies nothing.
        let applied = migrator
            .run_embedded_migrations(all_embedded_migrations())
            .await
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(migrator.get_current_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let store = store().await;
        let mut task = Task::new("open calculator");
        task.plan.install(vec![Subtask::new("OpenCalculator", "click dock icon")]);
        task.stats.input_tokens = 42;
        store.create(&task).await.unwrap();

        let loaded = store.get(task.id).await.unwrap();
        assert_eq!(loaded.instruction, "open calculator");
        assert_eq!(loaded.plan.remaining[0].name, "OpenCalculator");
        assert_eq!(loaded.stats.input_tokens, 42);
        assert_eq!(loaded.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_already_exists() {
        let store = store().await;
        let task = Task::new("dup");
        store.create(&task).await.unwrap();
        assert!(matches!(
            store.create(&task).await,
            Err(CoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_patch_updates_only_set_fields() {
        let store = store().await;
        let task = Task::new("patch me");
        store.create(&task).await.unwrap();

        store
            .update(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::Running),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let loaded = store.get(task.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert!(loaded.started_at.is_some());
        assert!(loaded.ended_at.is_none());
        assert_eq!(loaded.instruction, "patch me");
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let store = store().await;
        assert!(matches!(
            store
                .update(Uuid::new_v4(), TaskPatch::status(TaskStatus::Running))
                .await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_reverse_chronological_with_total() {
        let store = store().await;
        let mut ids = Vec::new();
        for i in 0..4 {
            let mut task = Task::new(format!("t{i}"));
            task.created_at = Utc::now() + chrono::Duration::milliseconds(i * 10);
            store.create(&task).await.unwrap();
            ids.push(task.id);
        }
        let (page, total) = store.list(2, 0).await.unwrap();
        assert_eq!(total, 4);
        assert_eq!(page[0].id, ids[3]);
        assert_eq!(page[1].id, ids[2]);
    }

    #[tokio::test]
    async fn test_conversation_appends() {
        let store = store().await;
        let task = Task::new("conv");
        store.create(&task).await.unwrap();
        store
            .append_conversation(task.id, vec![serde_json::json!({"role": "user", "content": "hi"})])
            .await
            .unwrap();
        store
            .append_conversation(task.id, vec![serde_json::json!({"role": "assistant", "content": "hello"})])
            .await
            .unwrap();
        let loaded = store.get(task.id).await.unwrap();
        assert_eq!(loaded.conversation.len(), 2);
    }

    #[tokio::test]
    async fn test_recovery_marks_running_tasks_failed() {
        let store = store().await;
        let mut running = Task::new("interrupted");
        running.status = TaskStatus::Running;
        store.create(&running).await.unwrap();
        let mut done = Task::new("finished");
        done.status = TaskStatus::Completed;
        store.create(&done).await.unwrap();

        let recovered = store.recover_interrupted().await.unwrap();
        assert_eq!(recovered, 1);

        let loaded = store.get(running.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.final_message.as_deref(), Some("process_restart"));
        assert!(loaded.ended_at.is_some());

        let untouched = store.get(done.id).await.unwrap();
        assert_eq!(untouched.status, TaskStatus::Completed);
    }
}
