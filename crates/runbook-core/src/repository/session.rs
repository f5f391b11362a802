//! Session repository trait and an in-memory implementation.

use dashmap::DashMap;
use runbook_types::error::RepositoryError;
use runbook_types::session::{SessionState, SessionSummary};
use uuid::Uuid;

/// Persistence for run sessions.
///
/// Writes overwrite the previous state of the run. Uses native async fn in
/// traits (Rust 2024 edition, no async_trait macro).
pub trait SessionRepository: Send + Sync {
    /// Insert or replace the stored state of a run.
    fn save_session(
        &self,
        state: &SessionState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load_session(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<SessionState>, RepositoryError>> + Send;

    /// All stored runs, most recently updated first.
    fn list_sessions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<SessionSummary>, RepositoryError>> + Send;

    /// Delete a run. Deleting an unknown run is not an error.
    fn delete_session(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

/// Process-local session store, used by tests and `--ephemeral` runs.
#[derive(Debug, Default)]
pub struct InMemorySessionRepository {
    sessions: DashMap<Uuid, SessionState>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionRepository for InMemorySessionRepository {
    async fn save_session(&self, state: &SessionState) -> Result<(), RepositoryError> {
        self.sessions.insert(state.run_id, state.clone());
        Ok(())
    }

    async fn load_session(&self, run_id: &Uuid) -> Result<Option<SessionState>, RepositoryError> {
        Ok(self.sessions.get(run_id).map(|entry| entry.value().clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, RepositoryError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary::from(entry.value()))
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete_session(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        self.sessions.remove(run_id);
        Ok(())
    }
}
