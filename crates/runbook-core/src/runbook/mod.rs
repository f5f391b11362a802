//! Runbook execution: definitions, the continuation queue, and the engine
//! that walks it.

pub mod capture;
pub mod checkpoint;
pub mod compiled;
pub mod context;
pub mod continuation;
pub mod definition;
pub mod engine;
pub mod evidence;
pub mod executor;
pub mod expression;
pub mod invoke;
pub mod loader;
pub mod routing;
pub mod scenario;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;
