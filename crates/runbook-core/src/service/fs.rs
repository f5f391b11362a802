//! FileSystem trait for abstracting file I/O.
//!
//! Services write scenarios and read them back through this trait. The
//! `LocalFileSystem` adapter lives in runbook-infra.

use std::path::Path;

/// Abstraction over filesystem operations.
pub trait FileSystem: Send + Sync {
    /// Write string content to a file, creating parent directories as needed.
    fn write_file(
        &self,
        path: &Path,
        content: &str,
    ) -> impl std::future::Future<Output = Result<(), std::io::Error>> + Send;

    fn read_file(
        &self,
        path: &Path,
    ) -> impl std::future::Future<Output = Result<String, std::io::Error>> + Send;

    fn exists(&self, path: &Path) -> impl std::future::Future<Output = bool> + Send;
}
