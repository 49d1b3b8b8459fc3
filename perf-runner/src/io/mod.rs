//! I/O helpers: configuration, child processes, the pipeline adapter,
//! stop requests and the turn journal.

pub mod config;
pub mod journal;
pub mod pipeline;
pub mod process;
pub mod stop;
