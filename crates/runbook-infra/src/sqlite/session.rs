//! SQLite session repository implementation.
//!
//! Implements `SessionRepository` from `runbook-core` using sqlx with split
//! read/write pools. The full `SessionState` is stored as a JSON blob; the
//! workflow, status, and timestamps are duplicated into columns for
//! listing without decoding every blob.

use chrono::{DateTime, SecondsFormat, Utc};
use runbook_core::repository::session::SessionRepository;
use runbook_types::error::RepositoryError;
use runbook_types::session::{RunStatus, SessionState, SessionSummary};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `SessionRepository`.
pub struct SqliteSessionRepository {
    pool: DatabasePool,
}

impl SqliteSessionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct SummaryRow {
    run_id: String,
    workflow: String,
    status: String,
    updated_at: String,
}

impl SummaryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow: row.try_get("workflow")?,
            status: row.try_get("status")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_summary(self) -> Result<SessionSummary, RepositoryError> {
        let status: RunStatus = serde_json::from_value(serde_json::Value::String(
            self.status.clone(),
        ))
        .map_err(|_| RepositoryError::Corrupt(format!("invalid run status: {}", self.status)))?;

        Ok(SessionSummary {
            run_id: parse_uuid(&self.run_id)?,
            workflow: self.workflow.into(),
            status,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Corrupt(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Corrupt(format!("invalid datetime: {e}")))
}

/// Fixed-width so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

// ---------------------------------------------------------------------------
// SessionRepository impl
// ---------------------------------------------------------------------------

impl SessionRepository for SqliteSessionRepository {
    async fn save_session(&self, state: &SessionState) -> Result<(), RepositoryError> {
        let state_json = serde_json::to_string(state)
            .map_err(|e| RepositoryError::Corrupt(format!("serialize session: {e}")))?;

        sqlx::query(
            r#"INSERT INTO sessions (run_id, workflow, status, state, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                 workflow = excluded.workflow,
                 status = excluded.status,
                 state = excluded.state,
                 updated_at = excluded.updated_at"#,
        )
        .bind(state.run_id.to_string())
        .bind(state.workflow.display().to_string())
        .bind(state.status.to_string())
        .bind(&state_json)
        .bind(format_datetime(&state.created_at))
        .bind(format_datetime(&state.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn load_session(&self, run_id: &Uuid) -> Result<Option<SessionState>, RepositoryError> {
        let row = sqlx::query("SELECT state FROM sessions WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let state: String = row
                    .try_get("state")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                let state = serde_json::from_str(&state)
                    .map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT run_id, workflow, status, updated_at FROM sessions ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                SummaryRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_summary()
            })
            .collect()
    }

    async fn delete_session(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM sessions WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }
}
