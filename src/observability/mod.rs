//! Observability: structured logging for the command-line binary.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the binary so embedding callers keep control of their own.

mod tracing_init;

pub use tracing_init::*;
