//! Continuation engine, collaborator traits, and services for runbooks.
//!
//! This crate defines the "ports" (repository, executor, loader, and
//! filesystem traits) that the infrastructure layer implements. It depends
//! only on `runbook-types` -- never on `runbook-infra` or any database/IO
//! crate.

pub mod event;
pub mod repository;
pub mod runbook;
pub mod service;
