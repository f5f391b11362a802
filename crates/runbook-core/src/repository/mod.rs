//! Repository trait definitions (ports).
//!
//! `runbook-infra` provides the file and SQLite implementations. The core
//! crate never depends on a specific storage technology.

pub mod session;
