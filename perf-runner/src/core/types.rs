//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the orchestrator, the pipeline
//! adapter and the CLI. They hold no I/O handles and never change after
//! construction.

use std::fmt;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

/// Ordered list of branch names polled by the orchestrator.
///
/// Order determines polling order. Duplicates are kept and simply re-run.
/// Never empty: an empty list would make the outer loop spin without work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchList(Vec<String>);

impl BranchList {
    pub fn new(branches: Vec<String>) -> Result<Self> {
        if branches.is_empty() {
            bail!("branch list must not be empty");
        }
        if let Some(pos) = branches.iter().position(|b| b.trim().is_empty()) {
            bail!("branch list entry {} is empty", pos + 1);
        }
        Ok(Self(branches))
    }

    /// Parse a comma-separated list such as `main,3.0, 3.1`.
    pub fn parse(raw: &str) -> Result<Self> {
        let branches = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .collect::<Vec<_>>();
        if branches.len() == 1 && branches[0].is_empty() {
            return Err(anyhow!("branch list must not be empty"));
        }
        Self::new(branches)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// Per-invocation configuration handed from the CLI to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleContext {
    branches: BranchList,
    cluster_id: String,
    test_group: String,
}

impl CycleContext {
    pub fn new(
        branches: BranchList,
        cluster_id: impl Into<String>,
        test_group: impl Into<String>,
    ) -> Result<Self> {
        let cluster_id = cluster_id.into();
        let test_group = test_group.into();
        if cluster_id.trim().is_empty() {
            bail!("cluster id must not be empty");
        }
        if test_group.trim().is_empty() {
            bail!("test group must not be empty");
        }
        Ok(Self {
            branches,
            cluster_id,
            test_group,
        })
    }

    pub fn branches(&self) -> &BranchList {
        &self.branches
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn test_group(&self) -> &str {
        &self.test_group
    }
}

/// One of the six pipeline stages run per branch turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    CleanEnv,
    DownloadSource,
    Install,
    LoadData,
    RunTestCases,
    BackupResults,
}

impl Stage {
    /// Stages in execution order.
    pub const ALL: [Stage; 6] = [
        Stage::CleanEnv,
        Stage::DownloadSource,
        Stage::Install,
        Stage::LoadData,
        Stage::RunTestCases,
        Stage::BackupResults,
    ];

    /// Subcommand name passed to the external stage program.
    pub fn command_name(self) -> &'static str {
        match self {
            Stage::CleanEnv => "clean-env",
            Stage::DownloadSource => "download-db",
            Stage::Install => "install-db",
            Stage::LoadData => "insert-data",
            Stage::RunTestCases => "run-test-case",
            Stage::BackupResults => "backup-test-case",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}

/// What the orchestrator does when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Propagate the failure and end the whole run.
    FailFast,
    /// Log the failure, abandon the branch's turn, continue with the next branch.
    SkipBranch,
    /// Re-run the whole branch turn, then fail fast once attempts run out.
    Retry { max_attempts: u32, backoff_secs: u64 },
}

/// Lifecycle of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    /// Running the branch at this index of the branch list.
    RunningBranch(usize),
    /// Stop requested; finishing in-flight work.
    Draining,
    Stopped,
}

/// How a single branch turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// All six stages ran.
    Completed,
    /// The freshness check found no new commit; remaining stages skipped.
    Unchanged,
    /// A stage failed and the policy moved on to the next branch.
    Skipped,
    /// A stop request cut the turn short between stages.
    Interrupted,
    /// A stage failed and the failure ended the run.
    Failed,
}
