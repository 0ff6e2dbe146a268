use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BatchConfig;
use crate::types::{BatchResult, BatchStatus, Task, TaskStatus};

/// A batch as recorded in a [`BatchStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub batch_id: String,
    pub status: BatchStatus,
    pub config: BatchConfig,
    pub total_tasks: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<BatchResult>,
}

/// Durable mirror of batch and task state.
///
/// The scheduler writes through this trait on every transition but never
/// reads from it, and a failing store never affects scheduling.
pub trait BatchStore: Send + Sync {
    fn save_batch(&self, batch: &BatchRecord) -> anyhow::Result<()>;

    fn update_batch_status(&self, batch_id: &str, status: BatchStatus) -> anyhow::Result<()>;

    /// Insert or replace the full task record.
    fn save_task(&self, batch_id: &str, task: &Task) -> anyhow::Result<()>;

    fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> anyhow::Result<()>;

    fn save_batch_result(&self, result: &BatchResult) -> anyhow::Result<()>;

    fn load_batch(&self, batch_id: &str) -> anyhow::Result<Option<BatchRecord>>;

    fn load_batch_tasks(&self, batch_id: &str) -> anyhow::Result<Vec<Task>>;

    /// Most recent batches first.
    fn list_batches(
        &self,
        status: Option<BatchStatus>,
        limit: usize,
    ) -> anyhow::Result<Vec<BatchRecord>>;

    /// Delete terminal batches (and their tasks) completed more than `days`
    /// ago. Returns the number of batches deleted.
    fn cleanup_older_than(&self, days: u32) -> anyhow::Result<usize>;
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBatchStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use std::path::Path;
    use std::sync::Mutex;

    use anyhow::{Context, Result};
    use chrono::{DateTime, SecondsFormat, Utc};
    use rusqlite::{params, Connection, OptionalExtension, Row};

    use super::{BatchRecord, BatchStore};
    use crate::types::{BatchResult, BatchStatus, Task, TaskStatus};

    const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    id              TEXT PRIMARY KEY,
    status          TEXT CHECK(status IN ('created', 'running', 'paused', 'completed', 'failed', 'cancelled')),
    config_json     TEXT NOT NULL,
    total_tasks     INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT,
    result_json     TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    batch_id        TEXT NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    status          TEXT CHECK(status IN ('pending', 'processing', 'completed', 'failed', 'cancelled', 'retrying')),
    input_path      TEXT NOT NULL,
    output_path     TEXT NOT NULL,
    retry_count     INTEGER DEFAULT 0,
    error_message   TEXT,
    task_json       TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_batches_status_created ON batches(status, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_batch ON tasks(batch_id);
"#;

    /// SQLite-backed [`BatchStore`].
    pub struct SqliteBatchStore {
        conn: Mutex<Connection>,
    }

    impl SqliteBatchStore {
        /// Open (or create) the store. Pass `None` for an in-memory database.
        pub fn open(path: Option<&Path>) -> Result<Self> {
            let conn = match path {
                Some(p) => Connection::open(p).context("Failed to open batch database")?,
                None => {
                    Connection::open_in_memory().context("Failed to open in-memory database")?
                }
            };

            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
            .context("Failed to set PRAGMA options")?;

            conn.execute_batch(SCHEMA)
                .context("Failed to create batch schema")?;

            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
            let conn = self
                .conn
                .lock()
                .map_err(|e| anyhow::anyhow!("batch database mutex poisoned: {}", e))?;
            f(&conn)
        }
    }

    fn ts(t: DateTime<Utc>) -> String {
        t.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
        value
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .with_context(|| format!("Invalid timestamp '{}'", s))
            })
            .transpose()
    }

    type BatchRow = (
        String,
        String,
        String,
        i64,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
    );

    const BATCH_COLUMNS: &str = "id, status, config_json, total_tasks, created_at, \
                                 started_at, completed_at, result_json";

    fn read_batch_row(row: &Row<'_>) -> rusqlite::Result<BatchRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    }

    fn batch_from_row(row: BatchRow) -> Result<BatchRecord> {
        let (id, status, config_json, total, created, started, completed, result_json) = row;
        let status = BatchStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("Unknown batch status '{}'", status))?;
        let config =
            serde_json::from_str(&config_json).context("Failed to parse batch config JSON")?;
        let result: Option<BatchResult> = result_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .context("Failed to parse batch result JSON")?;
        let created_at = parse_time(Some(created))?
            .ok_or_else(|| anyhow::anyhow!("Batch '{}' has no creation time", id))?;

        Ok(BatchRecord {
            batch_id: id,
            status,
            config,
            total_tasks: total.max(0) as usize,
            created_at,
            started_at: parse_time(started)?,
            completed_at: parse_time(completed)?,
            result,
        })
    }

    impl BatchStore for SqliteBatchStore {
        fn save_batch(&self, batch: &BatchRecord) -> Result<()> {
            let config_json = serde_json::to_string(&batch.config)?;
            let result_json = batch
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO batches
                     (id, status, config_json, total_tasks, created_at, started_at, completed_at, result_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                        status = excluded.status,
                        config_json = excluded.config_json,
                        total_tasks = excluded.total_tasks,
                        started_at = excluded.started_at,
                        completed_at = excluded.completed_at,
                        result_json = excluded.result_json",
                    params![
                        batch.batch_id,
                        batch.status.as_str(),
                        config_json,
                        batch.total_tasks as i64,
                        ts(batch.created_at),
                        batch.started_at.map(ts),
                        batch.completed_at.map(ts),
                        result_json,
                    ],
                )
                .context("Failed to save batch")?;
                Ok(())
            })
        }

        fn update_batch_status(&self, batch_id: &str, status: BatchStatus) -> Result<()> {
            let now = ts(Utc::now());
            self.with_conn(|conn| {
                let updated = match status {
                    BatchStatus::Running => conn.execute(
                        "UPDATE batches SET status = ?1, started_at = COALESCE(started_at, ?2)
                         WHERE id = ?3",
                        params![status.as_str(), now, batch_id],
                    ),
                    s if s.is_terminal() => conn.execute(
                        "UPDATE batches SET status = ?1, completed_at = COALESCE(completed_at, ?2)
                         WHERE id = ?3",
                        params![status.as_str(), now, batch_id],
                    ),
                    _ => conn.execute(
                        "UPDATE batches SET status = ?1 WHERE id = ?2",
                        params![status.as_str(), batch_id],
                    ),
                }
                .context("Failed to update batch status")?;

                if updated == 0 {
                    anyhow::bail!("Batch '{}' not found", batch_id);
                }
                Ok(())
            })
        }

        fn save_task(&self, batch_id: &str, task: &Task) -> Result<()> {
            let task_json = serde_json::to_string(task)?;
            let now = ts(Utc::now());
            self.with_conn(|conn| {
                let saved = conn
                    .execute(
                        "INSERT INTO tasks
                         (id, batch_id, status, input_path, output_path, retry_count,
                          error_message, task_json, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                         ON CONFLICT(id) DO UPDATE SET
                            status = excluded.status,
                            retry_count = excluded.retry_count,
                            error_message = excluded.error_message,
                            task_json = excluded.task_json,
                            updated_at = excluded.updated_at
                         WHERE tasks.batch_id = excluded.batch_id",
                        params![
                            task.id,
                            batch_id,
                            task.status.as_str(),
                            task.input_path,
                            task.output_path,
                            task.retry_count,
                            task.error_message,
                            task_json,
                            ts(task.created_at),
                            now,
                        ],
                    )
                    .context("Failed to save task")?;

                // The upsert's WHERE leaves rows owned by another batch untouched.
                if saved == 0 {
                    anyhow::bail!(
                        "Task '{}' already belongs to a batch other than '{}'",
                        task.id,
                        batch_id
                    );
                }
                Ok(())
            })
        }

        fn update_task_status(
            &self,
            task_id: &str,
            status: TaskStatus,
            error_message: Option<&str>,
        ) -> Result<()> {
            let now = ts(Utc::now());
            self.with_conn(|conn| {
                let updated = conn
                    .execute(
                        "UPDATE tasks SET status = ?1, error_message = ?2, updated_at = ?3
                         WHERE id = ?4",
                        params![status.as_str(), error_message, now, task_id],
                    )
                    .context("Failed to update task status")?;
                if updated == 0 {
                    anyhow::bail!("Task '{}' not found", task_id);
                }
                Ok(())
            })
        }

        fn save_batch_result(&self, result: &BatchResult) -> Result<()> {
            let result_json = serde_json::to_string(result)?;
            self.with_conn(|conn| {
                let updated = conn
                    .execute(
                        "UPDATE batches SET status = ?1, completed_at = ?2, result_json = ?3
                         WHERE id = ?4",
                        params![
                            result.status.as_str(),
                            ts(result.completed_at),
                            result_json,
                            result.batch_id,
                        ],
                    )
                    .context("Failed to save batch result")?;
                if updated == 0 {
                    anyhow::bail!("Batch '{}' not found", result.batch_id);
                }
                Ok(())
            })
        }

        fn load_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
            let row = self.with_conn(|conn| {
                conn.query_row(
                    &format!("SELECT {} FROM batches WHERE id = ?1", BATCH_COLUMNS),
                    params![batch_id],
                    read_batch_row,
                )
                .optional()
                .context("Failed to load batch")
            })?;
            row.map(batch_from_row).transpose()
        }

        fn load_batch_tasks(&self, batch_id: &str) -> Result<Vec<Task>> {
            let rows: Vec<(String, String, Option<String>)> = self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT status, task_json, error_message FROM tasks
                         WHERE batch_id = ?1
                         ORDER BY created_at ASC, rowid ASC",
                    )
                    .context("Failed to prepare load_batch_tasks query")?;
                let rows = stmt
                    .query_map(params![batch_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })
                    .context("Failed to execute load_batch_tasks query")?;

                let mut out = Vec::new();
                for row in rows {
                    out.push(row.context("Failed to read task row")?);
                }
                Ok(out)
            })?;

            rows.into_iter()
                .map(|(status, task_json, error_message)| {
                    let mut task: Task =
                        serde_json::from_str(&task_json).context("Failed to parse task JSON")?;
                    // Status columns may be newer than the JSON snapshot.
                    if let Some(status) = TaskStatus::parse(&status) {
                        task.status = status;
                    }
                    task.error_message = error_message;
                    Ok(task)
                })
                .collect()
        }

        fn list_batches(
            &self,
            status: Option<BatchStatus>,
            limit: usize,
        ) -> Result<Vec<BatchRecord>> {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows: Vec<BatchRow> = self.with_conn(|conn| {
                let mut out = Vec::new();
                match status {
                    Some(status) => {
                        let mut stmt = conn
                            .prepare(&format!(
                                "SELECT {} FROM batches WHERE status = ?1
                                 ORDER BY created_at DESC LIMIT ?2",
                                BATCH_COLUMNS
                            ))
                            .context("Failed to prepare list_batches query")?;
                        let rows = stmt
                            .query_map(params![status.as_str(), limit], read_batch_row)
                            .context("Failed to execute list_batches query")?;
                        for row in rows {
                            out.push(row.context("Failed to read batch row")?);
                        }
                    }
                    None => {
                        let mut stmt = conn
                            .prepare(&format!(
                                "SELECT {} FROM batches ORDER BY created_at DESC LIMIT ?1",
                                BATCH_COLUMNS
                            ))
                            .context("Failed to prepare list_batches query")?;
                        let rows = stmt
                            .query_map(params![limit], read_batch_row)
                            .context("Failed to execute list_batches query")?;
                        for row in rows {
                            out.push(row.context("Failed to read batch row")?);
                        }
                    }
                }
                Ok(out)
            })?;

            rows.into_iter().map(batch_from_row).collect()
        }

        fn cleanup_older_than(&self, days: u32) -> Result<usize> {
            let cutoff = ts(Utc::now() - chrono::Duration::days(days as i64));
            self.with_conn(|conn| {
                let count = conn
                    .execute(
                        "DELETE FROM batches
                         WHERE status IN ('completed', 'failed', 'cancelled')
                         AND completed_at < ?1",
                        params![cutoff],
                    )
                    .context("Failed to delete old batches")?;
                Ok(count)
            })
        }
    }

}
