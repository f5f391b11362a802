//! Session repository selection.
//!
//! `AnySessionRepository` picks the backend named by
//! `RunbookConfig::session_backend` at startup and delegates to it.

use std::path::Path;

use runbook_core::repository::session::SessionRepository;
use runbook_types::config::{RunbookConfig, SessionBackend};
use runbook_types::error::RepositoryError;
use runbook_types::session::{SessionState, SessionSummary};
use uuid::Uuid;

use crate::filesystem::LocalFileSystem;
use crate::filesystem::session::FileSessionRepository;
use crate::sqlite::pool::{DatabasePool, database_url};
use crate::sqlite::session::SqliteSessionRepository;

/// The configured session backend.
pub enum AnySessionRepository {
    File(FileSessionRepository),
    Sqlite(SqliteSessionRepository),
}

impl AnySessionRepository {
    /// Open the backend `config` selects under `data_dir`.
    pub async fn open(config: &RunbookConfig, data_dir: &Path) -> Result<Self, RepositoryError> {
        match config.session_backend {
            SessionBackend::File => Ok(Self::File(FileSessionRepository::new(
                LocalFileSystem::sessions_dir(data_dir),
            ))),
            SessionBackend::Sqlite => {
                tokio::fs::create_dir_all(data_dir)
                    .await
                    .map_err(|e| RepositoryError::Io(e.to_string()))?;
                let pool = DatabasePool::new(&database_url(data_dir))
                    .await
                    .map_err(|e| RepositoryError::Connection(e.to_string()))?;
                Ok(Self::Sqlite(SqliteSessionRepository::new(pool)))
            }
        }
    }

    pub fn backend(&self) -> SessionBackend {
        match self {
            Self::File(_) => SessionBackend::File,
            Self::Sqlite(_) => SessionBackend::Sqlite,
        }
    }
}

impl SessionRepository for AnySessionRepository {
    async fn save_session(&self, state: &SessionState) -> Result<(), RepositoryError> {
        match self {
            Self::File(repo) => repo.save_session(state).await,
            Self::Sqlite(repo) => repo.save_session(state).await,
        }
    }

    async fn load_session(&self, run_id: &Uuid) -> Result<Option<SessionState>, RepositoryError> {
        match self {
            Self::File(repo) => repo.load_session(run_id).await,
            Self::Sqlite(repo) => repo.load_session(run_id).await,
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, RepositoryError> {
        match self {
            Self::File(repo) => repo.list_sessions().await,
            Self::Sqlite(repo) => repo.list_sessions().await,
        }
    }

    async fn delete_session(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        match self {
            Self::File(repo) => repo.delete_session(run_id).await,
            Self::Sqlite(repo) => repo.delete_session(run_id).await,
        }
    }
}
