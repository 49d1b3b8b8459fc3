//! Continuous performance-test runner.
//!
//! `perf-runner start` cycles forever over a list of branches, running the
//! six-stage test pipeline for one branch at a time, while a background job
//! prunes stale `test_case_*` directories once a day. The crate keeps a strict
//! split:
//!
//! - **[`core`]**: Pure logic (branch lists, stages, the daily schedule, the
//!   prune command). No I/O.
//! - **[`io`]**: Side effects (config, child processes, the pipeline adapter,
//!   stop files, the turn journal).
//!
//! [`orchestrator`] and [`cleanup`] combine the two into the running loop.

pub mod cleanup;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
