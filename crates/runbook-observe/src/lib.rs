//! Observability setup for the runbook engine: structured logging with
//! optional OpenTelemetry span export.

pub mod tracing_setup;
