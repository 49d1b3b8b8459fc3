//! Stable exit codes for perf-runner CLI commands.
//!
//! Usage errors are reported by clap with its own code (2).

/// Command succeeded (or `start` stopped on request).
pub const OK: i32 = 0;
/// Invalid config or input, or a stage failure ended the loop.
pub const FAILED: i32 = 1;
