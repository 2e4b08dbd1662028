//! libSQL checkpoint store and filesystem object store.
//!
//! The [`Storage`] struct wraps a libSQL database holding one checkpoint row per
//! workflow execution plus an append-only transition history. The executor
//! writes a checkpoint after every completed step, so an interrupted run can be
//! resumed from the last persisted state.
//!
//! A runner must [claim](Storage::claim_execution) an execution before driving
//! it. Checkpoint writes compare-and-swap on the row's `version`, and rows in a
//! terminal state are never rewritten.
//!
//! [`ObjectStore`] is the local blob store that result pages are written to.

mod migrations;
mod objects;

use std::path::Path;

use chrono::{DateTime, Utc};
use docflow_shared::{
    DocflowError, ExecutionId, RequestId, Result, WorkflowContext, WorkflowState,
};
use libsql::{Connection, Database, params};

pub use objects::{ObjectStore, PutReceipt, validate_location};

/// A persisted workflow execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub request_id: RequestId,
    /// State the execution will run next (or the terminal state it reached).
    pub state: WorkflowState,
    /// Context as returned by the last successful step.
    pub context: WorkflowContext,
    /// Failed attempts of the current step.
    pub attempt: u32,
    /// When a waiting execution may resume.
    pub resume_at: Option<DateTime<Utc>>,
    /// Cause recorded when the execution reached `Failure`.
    pub error: Option<String>,
    /// Bumped by every claim and checkpoint write.
    pub version: i64,
    /// Runner holding the claim, if any.
    pub owner: Option<String>,
    /// When the current claim lapses.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// A fresh record positioned at `Initialize`.
    pub fn new(context: WorkflowContext) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::new(),
            request_id: context.request_id.clone(),
            state: WorkflowState::Initialize,
            context,
            attempt: 0,
            resume_at: None,
            error: None,
            version: 0,
            owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Kind of entry in the execution history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The execution moved into a state.
    Entered,
    /// A step attempt failed.
    StepFailed,
    /// A failed step will be re-invoked.
    RetryScheduled,
    /// The execution reached `Success` or `Failure`.
    Terminal,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entered => "entered",
            Self::StepFailed => "step_failed",
            Self::RetryScheduled => "retry_scheduled",
            Self::Terminal => "terminal",
        }
    }
}

/// One row of the execution history.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub state: String,
    pub kind: String,
    pub detail: Option<String>,
    pub at: String,
}

const EXECUTION_COLUMNS: &str = "id, request_id, state, context_json, attempt, resume_at, error, \
     created_at, updated_at, version, owner, lease_expires_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    DocflowError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Execution operations
    // -----------------------------------------------------------------------

    /// Insert a new execution unless one already exists for its request id.
    ///
    /// Returns `true` when the row was created, `false` when the request id
    /// was already known.
    pub async fn insert_execution(&self, record: &ExecutionRecord) -> Result<bool> {
        let context_json = serde_json::to_string(&record.context)
            .map_err(|e| DocflowError::Storage(format!("serialize context: {e}")))?;
        let inserted = self
            .conn
            .execute(
                "INSERT INTO executions (id, request_id, state, context_json, attempt, resume_at, error, created_at, updated_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(request_id) DO NOTHING",
                params![
                    record.id.to_string(),
                    record.request_id.as_str(),
                    record.state.as_str(),
                    context_json,
                    record.attempt,
                    record.resume_at.map(|t| t.to_rfc3339()),
                    record.error.as_deref(),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    record.version,
                ],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(inserted > 0)
    }

    /// Persist the checkpoint fields of an existing execution.
    ///
    /// The write only lands if the row is still at `record.version` and not yet
    /// terminal; on success `record.version` is advanced to match the row.
    /// Otherwise the caller's view is stale and a [`DocflowError::Conflict`]
    /// is returned.
    pub async fn save_execution(&self, record: &mut ExecutionRecord) -> Result<()> {
        let context_json = serde_json::to_string(&record.context)
            .map_err(|e| DocflowError::Storage(format!("serialize context: {e}")))?;
        let updated = self
            .conn
            .execute(
                "UPDATE executions
                 SET state = ?1, context_json = ?2, attempt = ?3, resume_at = ?4, error = ?5,
                     updated_at = ?6, version = version + 1,
                     owner = CASE WHEN ?1 IN ('Success', 'Failure') THEN NULL ELSE owner END,
                     lease_expires_at = CASE WHEN ?1 IN ('Success', 'Failure') THEN NULL ELSE ?7 END
                 WHERE id = ?8 AND version = ?9 AND state NOT IN ('Success', 'Failure')",
                params![
                    record.state.as_str(),
                    context_json,
                    record.attempt,
                    record.resume_at.map(|t| t.to_rfc3339()),
                    record.error.as_deref(),
                    Utc::now().to_rfc3339(),
                    record.lease_expires_at.map(|t| t.timestamp_millis()),
                    record.id.to_string(),
                    record.version,
                ],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        if updated == 0 {
            return match self.get_execution(&record.id).await? {
                None => Err(DocflowError::Storage(format!(
                    "execution {} does not exist",
                    record.id
                ))),
                Some(current) => Err(DocflowError::conflict(format!(
                    "execution {} is at version {} in state {}, expected version {}",
                    record.id, current.version, current.state, record.version
                ))),
            };
        }
        record.version += 1;
        if record.state.is_terminal() {
            record.owner = None;
            record.lease_expires_at = None;
        }
        Ok(())
    }

    /// Claim a non-terminal execution for `owner` until `lease_until`.
    ///
    /// Succeeds when nobody holds the execution, when `owner` already does, or
    /// when the previous claim has lapsed. The claim bumps `version`, so a
    /// runner whose lease was taken over fails on its next checkpoint write.
    /// Returns the claimed record, or `None` when the execution is terminal,
    /// unknown, or held by another live runner.
    pub async fn claim_execution(
        &self,
        id: &ExecutionId,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>> {
        let claimed = self
            .conn
            .execute(
                "UPDATE executions
                 SET owner = ?1, lease_expires_at = ?2, version = version + 1
                 WHERE id = ?3
                   AND state NOT IN ('Success', 'Failure')
                   AND (owner IS NULL OR owner = ?1 OR lease_expires_at IS NULL OR lease_expires_at < ?4)",
                params![
                    owner,
                    lease_until.timestamp_millis(),
                    id.to_string(),
                    Utc::now().timestamp_millis(),
                ],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        if claimed == 0 {
            return Ok(None);
        }
        self.get_execution(id).await
    }

    /// Drop `owner`'s claim. A claim held by someone else is left alone.
    pub async fn release_execution(&self, id: &ExecutionId, owner: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE executions SET owner = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND owner = ?2 AND state NOT IN ('Success', 'Failure')",
                params![id.to_string(), owner],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get an execution by ID.
    pub async fn get_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>> {
        self.query_one(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
            id.to_string(),
        )
        .await
    }

    /// Get the execution started for a request id.
    pub async fn get_execution_by_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<ExecutionRecord>> {
        self.query_one(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE request_id = ?1"),
            request_id.as_str().to_string(),
        )
        .await
    }

    async fn query_one(&self, sql: &str, key: String) -> Result<Option<ExecutionRecord>> {
        let mut rows = self
            .conn
            .query(sql, params![key])
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_execution(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DocflowError::Storage(e.to_string())),
        }
    }

    /// List all executions, newest first.
    pub async fn list_executions(&self) -> Result<Vec<ExecutionRecord>> {
        self.query_many(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions ORDER BY created_at DESC"
        ))
        .await
    }

    /// List executions that have not reached a terminal state, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<ExecutionRecord>> {
        self.query_many(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE state NOT IN ('Success', 'Failure') ORDER BY created_at"
        ))
        .await
    }

    async fn query_many(&self, sql: &str) -> Result<Vec<ExecutionRecord>> {
        let mut rows = self
            .conn
            .query(sql, params![])
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_execution(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // History operations
    // -----------------------------------------------------------------------

    /// Append an entry to an execution's history.
    pub async fn append_event(
        &self,
        execution_id: &ExecutionId,
        state: WorkflowState,
        kind: EventKind,
        detail: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO execution_events (execution_id, state, kind, detail, at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    execution_id.to_string(),
                    state.as_str(),
                    kind.as_str(),
                    detail,
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;
        Ok(())
    }

    /// History of an execution in insertion order.
    pub async fn list_events(&self, execution_id: &ExecutionId) -> Result<Vec<ExecutionEvent>> {
        let mut rows = self
            .conn
            .query(
                "SELECT state, kind, detail, at FROM execution_events
                 WHERE execution_id = ?1 ORDER BY id",
                params![execution_id.to_string()],
            )
            .await
            .map_err(|e| DocflowError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(ExecutionEvent {
                state: row
                    .get::<String>(0)
                    .map_err(|e| DocflowError::Storage(e.to_string()))?,
                kind: row
                    .get::<String>(1)
                    .map_err(|e| DocflowError::Storage(e.to_string()))?,
                detail: row.get::<String>(2).ok(),
                at: row
                    .get::<String>(3)
                    .map_err(|e| DocflowError::Storage(e.to_string()))?,
            });
        }
        Ok(results)
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DocflowError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to an [`ExecutionRecord`].
fn row_to_execution(row: &libsql::Row) -> Result<ExecutionRecord> {
    let id: String = row
        .get(0)
        .map_err(|e| DocflowError::Storage(e.to_string()))?;
    let state: String = row
        .get(2)
        .map_err(|e| DocflowError::Storage(e.to_string()))?;
    let context_json: String = row
        .get(3)
        .map_err(|e| DocflowError::Storage(e.to_string()))?;
    let created_at: String = row
        .get(7)
        .map_err(|e| DocflowError::Storage(e.to_string()))?;
    let updated_at: String = row
        .get(8)
        .map_err(|e| DocflowError::Storage(e.to_string()))?;

    Ok(ExecutionRecord {
        id: id
            .parse()
            .map_err(|e| DocflowError::Storage(format!("invalid execution id: {e}")))?,
        request_id: RequestId(
            row.get::<String>(1)
                .map_err(|e| DocflowError::Storage(e.to_string()))?,
        ),
        state: state.parse()?,
        context: serde_json::from_str(&context_json)
            .map_err(|e| DocflowError::Storage(format!("invalid checkpoint: {e}")))?,
        attempt: row.get::<u32>(4).unwrap_or(0),
        resume_at: match row.get::<String>(5).ok() {
            Some(s) => Some(parse_time(&s)?),
            None => None,
        },
        error: row.get::<String>(6).ok(),
        version: row.get::<i64>(9).unwrap_or(0),
        owner: row.get::<String>(10).ok(),
        lease_expires_at: row
            .get::<i64>(11)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}
