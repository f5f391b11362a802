//! JSON-file session repository.
//!
//! One pretty-printed `SessionState` per run at `{dir}/{run_id}.json`.
//! Saves write a temporary sibling and rename it over the old file, so a
//! crash never leaves a half-written session behind.

use std::path::{Path, PathBuf};

use runbook_core::repository::session::SessionRepository;
use runbook_types::error::RepositoryError;
use runbook_types::session::{SessionState, SessionSummary};
use uuid::Uuid;

/// File-backed implementation of `SessionRepository`.
pub struct FileSessionRepository {
    dir: PathBuf,
}

impl FileSessionRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, run_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

fn io_error(e: std::io::Error) -> RepositoryError {
    RepositoryError::Io(e.to_string())
}

impl SessionRepository for FileSessionRepository {
    async fn save_session(&self, state: &SessionState) -> Result<(), RepositoryError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| RepositoryError::Corrupt(format!("serialize session: {e}")))?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_error)?;
        let path = self.path(&state.run_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_error)?;
        Ok(())
    }

    async fn load_session(&self, run_id: &Uuid) -> Result<Option<SessionState>, RepositoryError> {
        let content = match tokio::fs::read_to_string(self.path(run_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| RepositoryError::Corrupt(e.to_string()))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, RepositoryError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(e)),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await.map_err(io_error)?;
            match serde_json::from_str::<SessionState>(&content) {
                Ok(state) => summaries.push(SessionSummary::from(&state)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt session file");
                }
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete_session(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        match tokio::fs::remove_file(self.path(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use runbook_types::session::{
        RunMode, RunStatus, SESSION_FORMAT_VERSION, SerializedLevel, SerializedNode,
    };
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn state(status: RunStatus, age_secs: i64) -> SessionState {
        let run_id = Uuid::now_v7();
        let now = Utc::now() - Duration::seconds(age_secs);
        SessionState {
            format_version: SESSION_FORMAT_VERSION,
            run_id,
            workflow: PathBuf::from("/rb/disk.yaml"),
            workflow_digest: Some("abc".to_string()),
            mode: RunMode::Live,
            status,
            initial_variables: BTreeMap::new(),
            active: SerializedLevel {
                workflow: PathBuf::from("/rb/disk.yaml"),
                run_id,
                variables: BTreeMap::new(),
                captures: BTreeMap::new(),
                queue: vec![SerializedNode::Step {
                    step_id: "check".to_string(),
                    depth: 0,
                }],
                step_counter: 0,
                child_runs: Vec::new(),
            },
            stack: Vec::new(),
            pending: None,
            history: Vec::new(),
            exchanges: Vec::new(),
            inputs: Vec::new(),
            outcome: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_save_load_overwrite() {
        let dir = tempdir().unwrap();
        let repo = FileSessionRepository::new(dir.path().join("sessions"));
        let mut s = state(RunStatus::Running, 0);

        repo.save_session(&s).await.unwrap();
        s.status = RunStatus::AwaitingUser;
        repo.save_session(&s).await.unwrap();

        let loaded = repo.load_session(&s.run_id).await.unwrap().unwrap();
        assert_eq!(loaded, s);
        assert!(!repo.dir().join(format!("{}.json.tmp", s.run_id)).exists());
    }

    #[tokio::test]
    async fn test_missing_session_is_none() {
        let dir = tempdir().unwrap();
        let repo = FileSessionRepository::new(dir.path());
        assert!(repo.load_session(&Uuid::now_v7()).await.unwrap().is_none());
        repo.delete_session(&Uuid::now_v7()).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_newest_first_skips_corrupt() {
        let dir = tempdir().unwrap();
        let repo = FileSessionRepository::new(dir.path());
        let old = state(RunStatus::Completed, 60);
        let new = state(RunStatus::Running, 0);
        repo.save_session(&old).await.unwrap();
        repo.save_session(&new).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let list = repo.list_sessions().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].run_id, new.run_id);
        assert_eq!(list[1].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_without_directory() {
        let dir = tempdir().unwrap();
        let repo = FileSessionRepository::new(dir.path().join("absent"));
        assert!(repo.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_session_reported() {
        let dir = tempdir().unwrap();
        let repo = FileSessionRepository::new(dir.path());
        let run_id = Uuid::now_v7();
        std::fs::write(dir.path().join(format!("{run_id}.json")), "not json").unwrap();
        assert!(matches!(
            repo.load_session(&run_id).await,
            Err(RepositoryError::Corrupt(_))
        ));
    }
}
