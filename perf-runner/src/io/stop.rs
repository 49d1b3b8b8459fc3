//! Stop requests for the running loop.
//!
//! `perf-runner stop` drops a `STOP` file into the work root; the orchestrator
//! polls it between branch turns and between stages. The file body selects the
//! mode: `drain` lets the current branch turn finish, `after-stage` stops once
//! the stage in flight returns. In-flight stages are never killed.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// How eagerly a stop request ends the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopMode {
    /// Finish every stage of the current branch turn, then stop.
    Drain,
    /// Stop as soon as the current stage returns.
    AfterStage,
}

impl StopMode {
    pub fn from_wait_for_finished(wait_for_finished: bool) -> Self {
        if wait_for_finished {
            StopMode::Drain
        } else {
            StopMode::AfterStage
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            StopMode::Drain => "drain",
            StopMode::AfterStage => "after-stage",
        }
    }

    fn code(self) -> u8 {
        match self {
            StopMode::Drain => 1,
            StopMode::AfterStage => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(StopMode::Drain),
            2 => Some(StopMode::AfterStage),
            _ => None,
        }
    }
}

/// What the STOP-file check found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopFileStatus {
    NotPresent,
    /// STOP file was present and has been consumed.
    Detected(StopMode),
}

/// Shared stop flag. Clones observe the same request.
///
/// Requests only escalate: once `AfterStage` is set a later `Drain` request
/// does not soften it.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    mode: Arc<AtomicU8>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, mode: StopMode) {
        self.mode.fetch_max(mode.code(), Ordering::SeqCst);
    }

    pub fn requested(&self) -> Option<StopMode> {
        StopMode::from_code(self.mode.load(Ordering::SeqCst))
    }

    /// Consume a STOP file if present and turn it into a request.
    pub fn check_stop_file(&self, stop_path: &Path) -> StopFileStatus {
        if !stop_path.exists() {
            return StopFileStatus::NotPresent;
        }
        let mode = read_stop_mode(stop_path);
        info!(path = %stop_path.display(), mode = mode.as_str(), "STOP file detected, requesting shutdown");
        if let Err(e) = fs::remove_file(stop_path) {
            warn!(path = %stop_path.display(), error = %e, "failed to delete STOP file");
        }
        self.request(mode);
        StopFileStatus::Detected(mode)
    }
}

/// Write a STOP file asking a running loop to stop.
pub fn write_stop_file(stop_path: &Path, mode: StopMode) -> Result<()> {
    if let Some(parent) = stop_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(stop_path, format!("{}\n", mode.as_str()))
        .with_context(|| format!("write {}", stop_path.display()))
}

/// Remove a STOP file left behind by a previous run.
pub fn clear_stale_stop_file(stop_path: &Path) -> Result<bool> {
    if !stop_path.exists() {
        return Ok(false);
    }
    fs::remove_file(stop_path).with_context(|| format!("remove {}", stop_path.display()))?;
    Ok(true)
}

fn read_stop_mode(stop_path: &Path) -> StopMode {
    match fs::read_to_string(stop_path) {
        Ok(body) if body.trim() == StopMode::AfterStage.as_str() => StopMode::AfterStage,
        Ok(_) => StopMode::Drain,
        Err(e) => {
            warn!(path = %stop_path.display(), error = %e, "failed to read STOP file, draining");
            StopMode::Drain
        }
    }
}
