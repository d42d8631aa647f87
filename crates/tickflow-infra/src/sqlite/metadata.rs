//! SQLite metadata sink.
//!
//! Implements [`MetadataSink`] over the split-pool database. The sink holds
//! one row per execution and one row per step attempt, sized for listing
//! and filtering; everything bulky stays in the pointer store behind
//! `record_pointer`. Step summaries over the payload limit are rejected
//! rather than truncated, since the caller already capped every free-text
//! field.
//!
//! The schema is created on construction with `CREATE TABLE IF NOT
//! EXISTS`, so a fresh database file needs no separate migration step.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tickflow_engine::audit::{FlowAuditRecord, StepAuditSummary};
use tickflow_engine::ports::MetadataSink;
use tickflow_types::error::{FlowErrorInfo, SinkError};
use tickflow_types::pointer::BlobPointer;
use tickflow_types::state::FlowStatus;
use uuid::Uuid;

use super::pool::DatabasePool;

const CREATE_FLOW_EXECUTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS flow_executions (
    id TEXT PRIMARY KEY,
    flow_id TEXT NOT NULL,
    flow_version TEXT NOT NULL,
    status TEXT NOT NULL,
    branch_id TEXT,
    parent_execution_id TEXT,
    error_name TEXT,
    error_message TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT
)"#;

const CREATE_STEP_EXECUTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS step_executions (
    id TEXT PRIMARY KEY,
    flow_execution_id TEXT NOT NULL,
    flow_id TEXT NOT NULL,
    step_instance_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    disposition TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    handler TEXT,
    error_summary TEXT,
    record_pointer TEXT
)"#;

/// SQLite-backed [`MetadataSink`] plus the read side operators use to list
/// executions and their step trails.
#[derive(Debug, Clone)]
pub struct SqliteMetadataSink {
    pool: DatabasePool,
    payload_limit_bytes: usize,
}

impl SqliteMetadataSink {
    /// Open the sink over `pool`, creating the schema if it does not
    /// exist. `payload_limit_bytes` caps the encoded size of each step
    /// summary accepted by [`MetadataSink::log_step`].
    pub async fn new(pool: DatabasePool, payload_limit_bytes: usize) -> Result<Self, SinkError> {
        for statement in [
            CREATE_FLOW_EXECUTIONS,
            CREATE_STEP_EXECUTIONS,
            "CREATE INDEX IF NOT EXISTS idx_flow_executions_flow ON flow_executions(flow_id, started_at)",
            "CREATE INDEX IF NOT EXISTS idx_step_executions_execution ON step_executions(flow_execution_id, started_at)",
        ] {
            sqlx::query(statement)
                .execute(&pool.writer)
                .await
                .map_err(|e| SinkError::Unavailable(format!("schema creation failed: {e}")))?;
        }
        Ok(Self {
            pool,
            payload_limit_bytes,
        })
    }

    //  -------------------------------------------------------------------
    //  Read side
    //  -------------------------------------------------------------------

    /// Fetch one execution row.
    pub async fn execution(
        &self,
        flow_execution_id: Uuid,
    ) -> Result<Option<ExecutionListing>, SinkError> {
        let row = sqlx::query("SELECT * FROM flow_executions WHERE id = ?")
            .bind(flow_execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(write_error)?;

        match row {
            Some(row) => {
                let r = FlowRow::from_row(&row).map_err(write_error)?;
                Ok(Some(r.into_listing()?))
            }
            None => Ok(None),
        }
    }

    /// Most recent executions of a flow, newest first.
    pub async fn list_executions(
        &self,
        flow_id: &str,
        limit: u32,
    ) -> Result<Vec<ExecutionListing>, SinkError> {
        let rows = sqlx::query(
            "SELECT * FROM flow_executions WHERE flow_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(flow_id)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(write_error)?;

        let mut listings = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = FlowRow::from_row(row).map_err(write_error)?;
            listings.push(r.into_listing()?);
        }
        Ok(listings)
    }

    /// Step trail of one execution in attempt order.
    pub async fn step_summaries(
        &self,
        flow_execution_id: Uuid,
    ) -> Result<Vec<StepAuditSummary>, SinkError> {
        let rows = sqlx::query(
            "SELECT * FROM step_executions WHERE flow_execution_id = ? ORDER BY started_at ASC, attempt ASC",
        )
        .bind(flow_execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(write_error)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(write_error)?;
            summaries.push(r.into_summary()?);
        }
        Ok(summaries)
    }
}

// ---------------------------------------------------------------------------
// MetadataSink impl
// ---------------------------------------------------------------------------

impl MetadataSink for SqliteMetadataSink {
    async fn log_step(&self, summary: StepAuditSummary) -> Result<(), SinkError> {
        let encoded = serde_json::to_vec(&summary)
            .map_err(|e| SinkError::Write(format!("serialize step summary: {e}")))?;
        if encoded.len() > self.payload_limit_bytes {
            return Err(SinkError::Write(format!(
                "step summary is {} bytes, over the {} byte metadata limit",
                encoded.len(),
                self.payload_limit_bytes
            )));
        }

        let record_pointer = summary
            .record_pointer
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| SinkError::Write(format!("serialize record pointer: {e}")))?;

        sqlx::query(
            r#"INSERT INTO step_executions
               (id, flow_execution_id, flow_id, step_instance_id, attempt, disposition,
                started_at, finished_at, duration_ms, handler, error_summary, record_pointer)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(summary.flow_execution_id.to_string())
        .bind(&summary.flow_id)
        .bind(&summary.step_instance_id)
        .bind(summary.attempt as i32)
        .bind(summary.disposition.as_str())
        .bind(format_datetime(&summary.started_at))
        .bind(format_datetime(&summary.finished_at))
        .bind(summary.duration_ms as i64)
        .bind(&summary.handler)
        .bind(&summary.error_summary)
        .bind(&record_pointer)
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn create_flow_record(&self, record: FlowAuditRecord) -> Result<(), SinkError> {
        // Re-delivered invocations may announce the same execution twice;
        // the first row wins.
        sqlx::query(
            r#"INSERT INTO flow_executions
               (id, flow_id, flow_version, status, branch_id, parent_execution_id, started_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(record.flow_execution_id.to_string())
        .bind(&record.flow_id)
        .bind(record.flow_version.to_string())
        .bind(status_str(FlowStatus::Running))
        .bind(&record.branch_id)
        .bind(record.parent_execution_id.map(|id| id.to_string()))
        .bind(format_datetime(&record.started_at))
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn update_final_status(
        &self,
        flow_execution_id: Uuid,
        status: FlowStatus,
        error: Option<FlowErrorInfo>,
    ) -> Result<(), SinkError> {
        let result = sqlx::query(
            "UPDATE flow_executions SET status = ?, error_name = ?, error_message = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status_str(status))
        .bind(error.as_ref().map(|e| e.error_name.clone()))
        .bind(error.as_ref().map(|e| e.error_message.clone()))
        .bind(format_datetime(&Utc::now()))
        .bind(flow_execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        if result.rows_affected() == 0 {
            return Err(SinkError::Write(format!(
                "no execution row for {flow_execution_id}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

/// One `flow_executions` row as operators see it. Error details beyond
/// name and message live in the pointer-store records.
#[derive(Debug, Clone)]
pub struct ExecutionListing {
    pub flow_execution_id: Uuid,
    pub flow_id: String,
    pub flow_version: semver::Version,
    pub status: FlowStatus,
    pub branch_id: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub error: Option<FlowErrorInfo>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct FlowRow {
    id: String,
    flow_id: String,
    flow_version: String,
    status: String,
    branch_id: Option<String>,
    parent_execution_id: Option<String>,
    error_name: Option<String>,
    error_message: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

impl FlowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            flow_id: row.try_get("flow_id")?,
            flow_version: row.try_get("flow_version")?,
            status: row.try_get("status")?,
            branch_id: row.try_get("branch_id")?,
            parent_execution_id: row.try_get("parent_execution_id")?,
            error_name: row.try_get("error_name")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_listing(self) -> Result<ExecutionListing, SinkError> {
        let status: FlowStatus =
            serde_json::from_value(serde_json::Value::String(self.status.clone()))
                .map_err(|_| SinkError::Write(format!("invalid status: {}", self.status)))?;

        let flow_version = semver::Version::parse(&self.flow_version)
            .map_err(|e| SinkError::Write(format!("invalid flow version: {e}")))?;

        let error = match (self.error_name, self.error_message) {
            (Some(name), Some(message)) => Some(FlowErrorInfo::terminal(name, message)),
            _ => None,
        };

        Ok(ExecutionListing {
            flow_execution_id: parse_uuid(&self.id)?,
            flow_id: self.flow_id,
            flow_version,
            status,
            branch_id: self.branch_id,
            parent_execution_id: self
                .parent_execution_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            error,
            started_at: parse_datetime(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepRow {
    flow_execution_id: String,
    flow_id: String,
    step_instance_id: String,
    attempt: i32,
    disposition: String,
    started_at: String,
    finished_at: String,
    duration_ms: i64,
    handler: Option<String>,
    error_summary: Option<String>,
    record_pointer: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            flow_execution_id: row.try_get("flow_execution_id")?,
            flow_id: row.try_get("flow_id")?,
            step_instance_id: row.try_get("step_instance_id")?,
            attempt: row.try_get("attempt")?,
            disposition: row.try_get("disposition")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            duration_ms: row.try_get("duration_ms")?,
            handler: row.try_get("handler")?,
            error_summary: row.try_get("error_summary")?,
            record_pointer: row.try_get("record_pointer")?,
        })
    }

    fn into_summary(self) -> Result<StepAuditSummary, SinkError> {
        let disposition = serde_json::from_value(serde_json::Value::String(
            self.disposition.clone(),
        ))
        .map_err(|_| SinkError::Write(format!("invalid disposition: {}", self.disposition)))?;

        let record_pointer: Option<BlobPointer> = self
            .record_pointer
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| SinkError::Write(format!("invalid record pointer: {e}")))?;

        Ok(StepAuditSummary {
            flow_execution_id: parse_uuid(&self.flow_execution_id)?,
            flow_id: self.flow_id,
            step_instance_id: self.step_instance_id,
            attempt: self.attempt as u32,
            disposition,
            started_at: parse_datetime(&self.started_at)?,
            finished_at: parse_datetime(&self.finished_at)?,
            duration_ms: self.duration_ms as u64,
            handler: self.handler,
            error_summary: self.error_summary,
            record_pointer,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn status_str(status: FlowStatus) -> &'static str {
    match status {
        FlowStatus::Running => "RUNNING",
        FlowStatus::Completed => "COMPLETED",
        FlowStatus::Failed => "FAILED",
        FlowStatus::TimedOut => "TIMED_OUT",
        FlowStatus::Cancelled => "CANCELLED",
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, SinkError> {
    s.parse::<Uuid>()
        .map_err(|e| SinkError::Write(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, SinkError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SinkError::Write(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn write_error(e: sqlx::Error) -> SinkError {
    SinkError::Write(e.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
