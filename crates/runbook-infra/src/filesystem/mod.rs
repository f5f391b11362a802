//! Filesystem adapters for the runbook engine.
//!
//! Implements the `FileSystem` trait from `runbook-core` for real
//! filesystem I/O, the JSON-file session store, and the data directory
//! layout.

pub mod session;

use std::path::{Path, PathBuf};

use runbook_core::service::fs::FileSystem;

/// Local filesystem implementation of the `FileSystem` trait.
///
/// All operations go through `tokio::fs` for async I/O.
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }

    /// Directory of JSON session files: `{data_dir}/sessions/`.
    pub fn sessions_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("sessions")
    }

    /// Default scenario directory for a run: `{data_dir}/scenarios/{run_id}/`.
    pub fn scenario_dir(data_dir: &Path, run_id: &uuid::Uuid) -> PathBuf {
        data_dir.join("scenarios").join(run_id.to_string())
    }
}

impl Default for LocalFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for LocalFileSystem {
    async fn write_file(&self, path: &Path, content: &str) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await
    }

    async fn read_file(&self, path: &Path) -> Result<String, std::io::Error> {
        tokio::fs::read_to_string(path).await
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `RUNBOOK_DATA_DIR` environment variable
/// 2. `~/.runbook` under the home directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RUNBOOK_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".runbook");
    }

    // Last resort: current directory
    PathBuf::from(".runbook")
}
