//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::models::*;
use crate::error::{Error, Result};
use crate::workflow::WorkflowDefinition;

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> Option<chrono::DateTime<Utc>> {
    s.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Default query limit.
const DEFAULT_QUERY_LIMIT: usize = 50;
/// Maximum query limit to prevent abuse.
const MAX_QUERY_LIMIT: usize = 1000;

const EXECUTION_COLUMNS: &str = "id, workflow_definition_id, workflow_name, customer_id, status, current_step, context, steps, started_at, completed_at, retry_count, error";

const DEFINITION_COLUMNS: &str =
    "id, name, description, version, steps, enabled, created_at, updated_at";

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        Self::init_schema_sync(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing and memory persistence mode).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &mut Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflow_definitions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                version INTEGER NOT NULL,
                steps TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workflow_executions (
                id TEXT PRIMARY KEY,
                workflow_definition_id TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                status TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                context TEXT NOT NULL,
                steps TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                FOREIGN KEY (workflow_definition_id) REFERENCES workflow_definitions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS workflow_steps (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                position INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                FOREIGN KEY (execution_id) REFERENCES workflow_executions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS fallback_snapshots (
                unit_name TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                result TEXT NOT NULL,
                cached_at TEXT NOT NULL,
                PRIMARY KEY (unit_name, subject_id)
            );

            CREATE INDEX IF NOT EXISTS idx_executions_customer_status
                ON workflow_executions(customer_id, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_one_active
                ON workflow_executions(workflow_name, customer_id)
                WHERE status IN ('pending', 'running');
            CREATE INDEX IF NOT EXISTS idx_steps_execution
                ON workflow_steps(execution_id, position);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Definition operations
    // ========================================================================

    /// Insert a definition, or update the one with the same name.
    ///
    /// Updating keeps the original id and bumps the version when the steps
    /// or description change. Returns the stored definition.
    pub async fn save_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowDefinition> {
        let conn = self.conn.lock().await;
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {} FROM workflow_definitions WHERE name = ?1",
                    DEFINITION_COLUMNS
                ),
                [definition.name.as_str()],
                Self::row_to_definition,
            )
            .optional()?;

        let effective = match existing {
            Some(current) => {
                let changed = current.steps != definition.steps
                    || current.description != definition.description;
                let updated = WorkflowDefinition {
                    id: current.id.clone(),
                    name: current.name.clone(),
                    description: definition.description.clone(),
                    version: if changed {
                        current.version + 1
                    } else {
                        current.version
                    },
                    steps: definition.steps.clone(),
                    enabled: definition.enabled,
                    created_at: current.created_at,
                    updated_at: Utc::now(),
                };
                conn.execute(
                    "UPDATE workflow_definitions
                     SET description = ?1, version = ?2, steps = ?3, enabled = ?4, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        updated.description,
                        updated.version,
                        serde_json::to_string(&updated.steps)?,
                        updated.enabled,
                        updated.updated_at.to_rfc3339(),
                        updated.id,
                    ],
                )?;
                updated
            }
            None => {
                conn.execute(
                    "INSERT INTO workflow_definitions
                     (id, name, description, version, steps, enabled, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        definition.id,
                        definition.name,
                        definition.description,
                        definition.version,
                        serde_json::to_string(&definition.steps)?,
                        definition.enabled,
                        definition.created_at.to_rfc3339(),
                        definition.updated_at.to_rfc3339(),
                    ],
                )?;
                definition.clone()
            }
        };

        Ok(effective)
    }

    pub async fn get_definition(&self, name: &str) -> Result<Option<WorkflowDefinition>> {
        let conn = self.conn.lock().await;
        let definition = conn
            .query_row(
                &format!(
                    "SELECT {} FROM workflow_definitions WHERE name = ?1",
                    DEFINITION_COLUMNS
                ),
                [name],
                Self::row_to_definition,
            )
            .optional()?;
        Ok(definition)
    }

    pub async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM workflow_definitions ORDER BY name",
            DEFINITION_COLUMNS
        ))?;
        let definitions = stmt
            .query_map([], Self::row_to_definition)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(definitions)
    }

    /// Enable or disable a definition. Returns false if it does not exist.
    pub async fn set_definition_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE workflow_definitions SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
            params![enabled, Utc::now().to_rfc3339(), name],
        )?;
        Ok(updated > 0)
    }

    fn row_to_definition(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowDefinition> {
        let steps_str: String = row.get(4)?;
        Ok(WorkflowDefinition {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            version: row.get(3)?,
            steps: serde_json::from_str(&steps_str).unwrap_or_default(),
            enabled: row.get(5)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
        })
    }

    // ========================================================================
    // Execution operations
    // ========================================================================

    /// Write an execution only if no other pending/running execution exists
    /// for the same (workflow, customer).
    ///
    /// The check and the write happen in one transaction under the
    /// connection lock, so two near-simultaneous callers cannot both pass.
    pub async fn save_execution_guarded(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let conflicting: Option<String> = tx
            .query_row(
                "SELECT id FROM workflow_executions
                 WHERE workflow_name = ?1 AND customer_id = ?2
                   AND status IN ('pending', 'running') AND id != ?3
                 LIMIT 1",
                params![execution.workflow_name, execution.customer_id, execution.id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(other) = conflicting {
            debug!(
                execution_id = %execution.id,
                conflicting_execution = %other,
                "Concurrency guard rejected execution"
            );
            tx.rollback()?;
            return Err(Error::AlreadyRunning {
                workflow: execution.workflow_name.clone(),
                customer_id: execution.customer_id.clone(),
            });
        }

        Self::upsert_execution(&tx, execution)?;
        tx.commit()?;
        Ok(())
    }

    /// Write an execution without the concurrency guard.
    pub async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::upsert_execution(&conn, execution)
    }

    /// Persist an execution transition and its step record atomically.
    ///
    /// On any write failure the transaction is rolled back and the error
    /// returned to the caller.
    pub async fn commit_transition(
        &self,
        execution: &WorkflowExecution,
        step: Option<&WorkflowStep>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let written = (|| -> Result<()> {
            Self::upsert_execution(&tx, execution)?;
            if let Some(step) = step {
                Self::upsert_step(&tx, step)?;
            }
            Ok(())
        })();

        match written {
            Ok(()) => {
                tx.commit()?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(
                        execution_id = %execution.id,
                        "Rollback failed after write error: {}", rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        let conn = self.conn.lock().await;
        let execution = conn
            .query_row(
                &format!(
                    "SELECT {} FROM workflow_executions WHERE id = ?1",
                    EXECUTION_COLUMNS
                ),
                [id],
                Self::row_to_execution,
            )
            .optional()?;
        Ok(execution)
    }

    pub async fn query_executions(&self, query: &ExecutionQuery) -> Result<Vec<WorkflowExecution>> {
        let conn = self.conn.lock().await;

        let mut sql = format!(
            "SELECT {} FROM workflow_executions WHERE 1=1",
            EXECUTION_COLUMNS
        );
        let mut bind: Vec<SqlValue> = Vec::new();

        if let Some(customer_id) = &query.customer_id {
            sql.push_str(" AND customer_id = ?");
            bind.push(SqlValue::Text(customer_id.clone()));
        }

        if let Some(workflow_name) = &query.workflow_name {
            sql.push_str(" AND workflow_name = ?");
            bind.push(SqlValue::Text(workflow_name.clone()));
        }

        if let Some(status) = &query.status {
            sql.push_str(" AND status = ?");
            bind.push(SqlValue::Text(status.to_string()));
        }

        sql.push_str(" ORDER BY started_at DESC LIMIT ? OFFSET ?");
        let limit = if query.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            query.limit.min(MAX_QUERY_LIMIT)
        };
        bind.push(SqlValue::Integer(limit as i64));
        bind.push(SqlValue::Integer(query.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map(params_from_iter(bind.iter()), Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(executions)
    }

    fn upsert_execution(conn: &Connection, execution: &WorkflowExecution) -> Result<()> {
        conn.execute(
            "INSERT INTO workflow_executions
             (id, workflow_definition_id, workflow_name, customer_id, status, current_step, context, steps, started_at, completed_at, retry_count, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                current_step = excluded.current_step,
                context = excluded.context,
                completed_at = excluded.completed_at,
                retry_count = excluded.retry_count,
                error = excluded.error",
            params![
                execution.id,
                execution.workflow_definition_id,
                execution.workflow_name,
                execution.customer_id,
                execution.status.to_string(),
                execution.current_step,
                serde_json::to_string(&execution.context)?,
                serde_json::to_string(&execution.steps)?,
                execution.started_at.to_rfc3339(),
                execution.completed_at.map(|t| t.to_rfc3339()),
                execution.retry_count,
                execution.error,
            ],
        )?;
        Ok(())
    }

    fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowExecution> {
        let status_str: String = row.get(4)?;
        let context_str: String = row.get(6)?;
        let steps_str: String = row.get(7)?;

        Ok(WorkflowExecution {
            id: row.get(0)?,
            workflow_definition_id: row.get(1)?,
            workflow_name: row.get(2)?,
            customer_id: row.get(3)?,
            status: status_str.parse().unwrap_or(ExecutionStatus::Failed),
            current_step: row.get(5)?,
            context: serde_json::from_str(&context_str).unwrap_or_default(),
            steps: serde_json::from_str(&steps_str).unwrap_or_default(),
            started_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            completed_at: parse_optional_datetime(row.get(9)?),
            retry_count: row.get(10)?,
            error: row.get(11)?,
        })
    }

    // ========================================================================
    // Step operations
    // ========================================================================

    pub async fn get_steps(&self, execution_id: &str) -> Result<Vec<WorkflowStep>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, step_name, position, status, started_at, completed_at, retry_count, error
             FROM workflow_steps WHERE execution_id = ?1 ORDER BY position, started_at",
        )?;

        let steps = stmt
            .query_map([execution_id], |row| {
                let status_str: String = row.get(4)?;
                Ok(WorkflowStep {
                    id: row.get(0)?,
                    execution_id: row.get(1)?,
                    step_name: row.get(2)?,
                    position: row.get(3)?,
                    status: status_str.parse().unwrap_or(StepStatus::Failed),
                    started_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
                    completed_at: parse_optional_datetime(row.get(6)?),
                    retry_count: row.get(7)?,
                    error: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(steps)
    }

    fn upsert_step(conn: &Connection, step: &WorkflowStep) -> Result<()> {
        conn.execute(
            "INSERT INTO workflow_steps
             (id, execution_id, step_name, position, status, started_at, completed_at, retry_count, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                retry_count = excluded.retry_count,
                error = excluded.error",
            params![
                step.id,
                step.execution_id,
                step.step_name,
                step.position,
                step.status.to_string(),
                step.started_at.to_rfc3339(),
                step.completed_at.map(|t| t.to_rfc3339()),
                step.retry_count,
                step.error,
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // Fallback snapshot operations
    // ========================================================================

    pub async fn save_fallback_snapshot(&self, snapshot: &FallbackSnapshot) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO fallback_snapshots (unit_name, subject_id, result, cached_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(unit_name, subject_id) DO UPDATE SET
                result = excluded.result,
                cached_at = excluded.cached_at",
            params![
                snapshot.unit_name,
                snapshot.subject_id,
                serde_json::to_string(&snapshot.result)?,
                snapshot.cached_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_fallback_snapshot(
        &self,
        unit_name: &str,
        subject_id: &str,
    ) -> Result<Option<FallbackSnapshot>> {
        let conn = self.conn.lock().await;
        let snapshot = conn
            .query_row(
                "SELECT unit_name, subject_id, result, cached_at
                 FROM fallback_snapshots WHERE unit_name = ?1 AND subject_id = ?2",
                [unit_name, subject_id],
                |row| {
                    let result_str: String = row.get(2)?;
                    Ok(FallbackSnapshot {
                        unit_name: row.get(0)?,
                        subject_id: row.get(1)?,
                        result: serde_json::from_str(&result_str)
                            .unwrap_or(serde_json::Value::Null),
                        cached_at: parse_datetime_utc(&row.get::<_, String>(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }
}
