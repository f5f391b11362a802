//! Infrastructure layer for the runbook engine.
//!
//! Contains implementations of the traits defined in `runbook-core`: file
//! and SQLite session storage, the filesystem runbook loader, SHA-256
//! digests, and the shell and replay step executors.

pub mod config;
pub mod executor;
pub mod filesystem;
pub mod hash;
pub mod loader;
pub mod repository;
pub mod sqlite;
