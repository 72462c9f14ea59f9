use tracing::instrument;

use ensemble_core::ids::TaskId;
use ensemble_core::task::Task;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Persistence collaborator for task records.
///
/// Implementations must be durable before returning from `put`: once the call
/// succeeds, a fresh process opening the same store sees the write.
pub trait TaskStore: Send + Sync {
    fn put(&self, task: &Task) -> Result<(), StoreError>;
    fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;
    /// Most recently created first.
    fn list(&self, limit: u32) -> Result<Vec<Task>, StoreError>;
}

const TASK_COLUMNS: &str = "id, description, status, config, round, metadata, result,
     error_message, failure_kind, created_at, updated_at";

/// SQLite-backed task store.
#[derive(Clone)]
pub struct TaskRepo {
    db: Database,
}

impl TaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Number of stored tasks.
    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }
}

impl TaskStore for TaskRepo {
    #[instrument(skip(self, task), fields(task_id = %task.id, status = %task.status))]
    fn put(&self, task: &Task) -> Result<(), StoreError> {
        let config = serde_json::to_string(&task.config)?;
        let metadata = serde_json::to_string(&task.metadata)?;
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO tasks (id, description, status, config, round, metadata, result,
                                    error_message, failure_kind, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    description = excluded.description,
                    status = excluded.status,
                    config = excluded.config,
                    round = excluded.round,
                    metadata = excluded.metadata,
                    result = excluded.result,
                    error_message = excluded.error_message,
                    failure_kind = excluded.failure_kind,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    task.id.as_str(),
                    task.description,
                    task.status.as_str(),
                    config,
                    task.round,
                    metadata,
                    result,
                    task.error_message,
                    task.failure.map(|f| f.as_str()),
                    row_helpers::format_timestamp(&task.created_at),
                    row_helpers::format_timestamp(&task.updated_at),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(task_id = %id))]
    fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_task(row).map(Some),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self))]
    fn list(&self, limit: u32) -> Result<Vec<Task>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, id DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_task(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<Task, StoreError> {
    let status: String = row_helpers::get(row, 2, "tasks", "status")?;
    let config: String = row_helpers::get(row, 3, "tasks", "config")?;
    let metadata: String = row_helpers::get(row, 5, "tasks", "metadata")?;
    let result: Option<String> = row_helpers::get_opt(row, 6, "tasks", "result")?;
    let failure: Option<String> = row_helpers::get_opt(row, 8, "tasks", "failure_kind")?;
    let created_at: String = row_helpers::get(row, 9, "tasks", "created_at")?;
    let updated_at: String = row_helpers::get(row, 10, "tasks", "updated_at")?;

    let metadata = match row_helpers::parse_json(&metadata, "tasks", "metadata")? {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(StoreError::CorruptRow {
                table: "tasks",
                column: "metadata",
                detail: format!("expected object, got {other}"),
            })
        }
    };

    Ok(Task {
        id: TaskId::from_raw(row_helpers::get::<String>(row, 0, "tasks", "id")?),
        description: row_helpers::get(row, 1, "tasks", "description")?,
        status: row_helpers::parse_enum(&status, "tasks", "status")?,
        config: row_helpers::parse_json(&config, "tasks", "config")?,
        round: row_helpers::get(row, 4, "tasks", "round")?,
        metadata,
        result: result
            .map(|r| row_helpers::parse_json(&r, "tasks", "result"))
            .transpose()?,
        error_message: row_helpers::get_opt(row, 7, "tasks", "error_message")?,
        failure: failure
            .map(|f| row_helpers::parse_enum(&f, "tasks", "failure_kind"))
            .transpose()?,
        created_at: row_helpers::parse_timestamp(&created_at, "tasks", "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, "tasks", "updated_at")?,
    })
}
