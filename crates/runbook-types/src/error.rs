use thiserror::Error;

/// Errors from session storage backends.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("session not found")]
    NotFound,

    #[error("corrupt session record: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(String),
}
