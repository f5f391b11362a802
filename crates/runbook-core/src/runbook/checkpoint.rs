//! Durable checkpoints of run sessions.
//!
//! Wraps a `SessionRepository`. Every request that changes a session ends
//! with a checkpoint, so any process can pick the run up again from the
//! stored state.

use runbook_types::session::{SessionState, SessionSummary};
use uuid::Uuid;

use super::loader::RunbookLoader;
use super::session::RunSession;
use crate::repository::session::SessionRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists and restores sessions through any `SessionRepository`.
pub struct CheckpointManager<R: SessionRepository> {
    repo: R,
}

impl<R: SessionRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Overwrite the stored state of `session`.
    pub async fn checkpoint(&self, session: &RunSession) -> Result<(), CheckpointError> {
        let state = session.to_state();
        self.repo
            .save_session(&state)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %session.run_id,
            status = %session.status,
            history = session.history.len(),
            "checkpointed session"
        );
        Ok(())
    }

    /// Stored state of a run.
    pub async fn load(&self, run_id: Uuid) -> Result<SessionState, CheckpointError> {
        self.repo
            .load_session(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    /// Load a run and rebuild its session against freshly loaded runbooks.
    pub async fn resume(
        &self,
        run_id: Uuid,
        loader: &dyn RunbookLoader,
    ) -> Result<RunSession, CheckpointError> {
        let state = self.load(run_id).await?;
        let session = RunSession::restore(state, loader)
            .map_err(|e| CheckpointError::Resume(e.to_string()))?;
        tracing::debug!(run_id = %run_id, status = %session.status, "resumed session");
        Ok(session)
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>, CheckpointError> {
        self.repo
            .list_sessions()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn delete(&self, run_id: Uuid) -> Result<(), CheckpointError> {
        self.repo
            .delete_session(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run_id, "deleted session");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("failed to resume run: {0}")]
    Resume(String),
}
