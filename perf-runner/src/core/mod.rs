//! Deterministic, pure logic shared by the orchestrator and the cleanup job.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod prune;
pub mod schedule;
pub mod types;
