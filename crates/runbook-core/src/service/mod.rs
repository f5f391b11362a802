//! Business logic services (use cases).
//!
//! Services orchestrate the engine, session checkpoints, and filesystem
//! access. They depend on traits (ports) -- never on concrete
//! infrastructure implementations.

pub mod fs;
pub mod hash;
pub mod runbook;
