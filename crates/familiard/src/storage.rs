//! SQLite storage for workflow records and the ordered event log.

use chrono::{DateTime, Utc};
use familiar_core::events::EventPayload;
use familiar_core::{Event, Workflow, WorkflowStatus};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

const WORKFLOW_COLUMNS: &str = "task_id, status, state_json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run the embedded migrations. Safe to call repeatedly.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Workflow operations ---

    /// Insert or replace the record for `workflow.task_id`.
    pub async fn upsert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let state_json = serde_json::to_string(workflow)?;
        sqlx::query(
            "INSERT INTO workflows (task_id, grimoire_name, status, state_json, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(task_id) DO UPDATE SET grimoire_name = excluded.grimoire_name, \
             status = excluded.status, state_json = excluded.state_json, \
             created_at = excluded.created_at, updated_at = excluded.updated_at",
        )
        .bind(&workflow.task_id)
        .bind(&workflow.grimoire_name)
        .bind(workflow.status.as_str())
        .bind(&state_json)
        .bind(workflow.created_at.timestamp_millis())
        .bind(workflow.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_workflow(&self, task_id: &str) -> Result<Option<Workflow>> {
        let query = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE task_id = ?1");
        let row = sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WorkflowRow::into_workflow).transpose()
    }

    pub async fn get_workflow(&self, task_id: &str) -> Result<Workflow> {
        self.find_workflow(task_id)
            .await?
            .ok_or_else(|| StorageError::WorkflowNotFound(task_id.to_string()))
    }

    /// Workflows, newest first, optionally filtered by status.
    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>> {
        let rows = match status {
            Some(status) => {
                let query = format!(
                    "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE status = ?1 ORDER BY created_at DESC"
                );
                sqlx::query_as::<_, WorkflowRow>(&query)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query =
                    format!("SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at DESC");
                sqlx::query_as::<_, WorkflowRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }

    // --- Event operations ---

    /// Append an event; the returned event carries its stream position.
    pub async fn append_event(&self, payload: &EventPayload) -> Result<Event> {
        let now = Utc::now();
        let event_type = payload.event_type().as_str().to_string();
        let payload_json = payload.to_json()?;
        let task_id = payload.task_id().map(str::to_string);

        let result = sqlx::query(
            "INSERT INTO events (task_id, type, ts, payload_json) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(task_id.as_deref())
        .bind(&event_type)
        .bind(now.timestamp_millis())
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(Event {
            seq: result.last_insert_rowid(),
            task_id,
            event_type,
            timestamp: now,
            payload_json,
        })
    }

    /// Events with `seq > after`, oldest first.
    pub async fn list_events_after(&self, after: i64, limit: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT seq, task_id, type, ts, payload_json FROM events WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    pub async fn list_events_for_task(&self, task_id: &str) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT seq, task_id, type, ts, payload_json FROM events WHERE task_id = ?1 ORDER BY seq ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    task_id: String,
    status: String,
    state_json: String,
}

impl WorkflowRow {
    fn into_workflow(self) -> Result<Workflow> {
        let mut workflow: Workflow = serde_json::from_str(&self.state_json)?;
        // Indexed columns win over the serialized copy.
        workflow.task_id = self.task_id;
        if let Some(status) = WorkflowStatus::parse(&self.status) {
            workflow.status = status;
        }
        Ok(workflow)
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    task_id: Option<String>,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            seq: self.seq,
            task_id: self.task_id,
            event_type: self.event_type,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            payload_json: self.payload_json,
        }
    }
}
