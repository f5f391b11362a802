//! Shared domain types for the runbook engine.
//!
//! Contains the parsed runbook tree (steps, branches, iterate blocks,
//! outcomes), the persisted session record, replay scenarios, run events,
//! configuration, and the shared error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod runbook;
pub mod scenario;
pub mod session;
