//! Runner configuration stored in `perf-runner.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::schedule::DailySchedule;
use crate::core::types::FailurePolicy;
use crate::io::journal::DEFAULT_JOURNAL_MAX_BYTES;

pub const DEFAULT_CONFIG_PATH: &str = "perf-runner.toml";

/// Runner configuration (TOML).
///
/// Missing fields default to the values the loop has always used. The work
/// root is shared between pipeline runs and the cleanup job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PerfConfig {
    /// Work root holding logs, test-case directories and the STOP file.
    pub perf_test_path: PathBuf,

    pub cleanup: CleanupConfig,
    pub pipeline: PipelineConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Local wall-clock time of the daily firing (`HH:MM`).
    pub at: String,
    /// `test_case_*` directories older than this many whole days are removed.
    pub retention_days: u32,
    pub poll_interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            at: "23:59".to_string(),
            retention_days: 2,
            poll_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stage program; the stage name and branch arguments are appended.
    pub command: Vec<String>,
    /// Per-stage wall-clock limit. Unset means stages may run indefinitely.
    pub stage_timeout_secs: Option<u64>,
    /// Truncate captured stage stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            command: vec!["perf-pipeline".to_string()],
            stage_timeout_secs: None,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicyKind {
    FailFast,
    SkipBranch,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub failure_policy: FailurePolicyKind,
    /// Attempts per branch turn under the `retry` policy.
    pub max_attempts: u32,
    /// Sleep between attempts under the `retry` policy.
    pub backoff_secs: u64,
    /// Skip install/test/backup when the downloaded commit was already tested.
    pub skip_unchanged_commits: bool,
    pub unchanged_commit_backoff_secs: u64,
    /// Sleep before restarting a cycle in which no branch turn got through.
    pub idle_cycle_backoff_secs: u64,
    /// Size at which `cycles.jsonl` is rotated.
    pub journal_max_bytes: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicyKind::FailFast,
            max_attempts: 3,
            backoff_secs: 60,
            skip_unchanged_commits: false,
            unchanged_commit_backoff_secs: 5,
            idle_cycle_backoff_secs: 60,
            journal_max_bytes: DEFAULT_JOURNAL_MAX_BYTES,
        }
    }
}

impl OrchestratorConfig {
    pub fn failure_policy(&self) -> FailurePolicy {
        match self.failure_policy {
            FailurePolicyKind::FailFast => FailurePolicy::FailFast,
            FailurePolicyKind::SkipBranch => FailurePolicy::SkipBranch,
            FailurePolicyKind::Retry => FailurePolicy::Retry {
                max_attempts: self.max_attempts,
                backoff_secs: self.backoff_secs,
            },
        }
    }
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            perf_test_path: PathBuf::from("perf_test"),
            cleanup: CleanupConfig::default(),
            pipeline: PipelineConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl PerfConfig {
    pub fn validate(&self) -> Result<()> {
        if self.perf_test_path.as_os_str().is_empty() {
            return Err(anyhow!("perf_test_path must not be empty"));
        }
        self.cleanup_schedule()?;
        if self.cleanup.retention_days == 0 {
            return Err(anyhow!(
                "cleanup.retention_days must be > 0 (in-flight test cases would be pruned)"
            ));
        }
        if self.cleanup.poll_interval_secs == 0 {
            return Err(anyhow!("cleanup.poll_interval_secs must be > 0"));
        }
        if self.pipeline.command.is_empty() || self.pipeline.command[0].trim().is_empty() {
            return Err(anyhow!("pipeline.command must be a non-empty array"));
        }
        if self.pipeline.stage_timeout_secs == Some(0) {
            return Err(anyhow!("pipeline.stage_timeout_secs must be > 0 when set"));
        }
        if self.pipeline.output_limit_bytes == 0 {
            return Err(anyhow!("pipeline.output_limit_bytes must be > 0"));
        }
        if self.orchestrator.failure_policy == FailurePolicyKind::Retry
            && self.orchestrator.max_attempts == 0
        {
            return Err(anyhow!("orchestrator.max_attempts must be > 0"));
        }
        if self.orchestrator.journal_max_bytes == 0 {
            return Err(anyhow!("orchestrator.journal_max_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn cleanup_schedule(&self) -> Result<DailySchedule> {
        DailySchedule::parse(&self.cleanup.at).context("cleanup.at")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup.poll_interval_secs)
    }

    pub fn log_path(&self) -> PathBuf {
        self.perf_test_path.join("perf_test.log")
    }

    pub fn stop_file_path(&self) -> PathBuf {
        self.perf_test_path.join("STOP")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.perf_test_path.join("cycles.jsonl")
    }

    pub fn stage_logs_dir(&self) -> PathBuf {
        self.perf_test_path.join("logs")
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PerfConfig::default()`.
pub fn load_config(path: &Path) -> Result<PerfConfig> {
    if !path.exists() {
        let cfg = PerfConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PerfConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PerfConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PerfConfig::default());
        assert_eq!(cfg.cleanup.at, "23:59");
        assert_eq!(cfg.cleanup.retention_days, 2);
        assert_eq!(cfg.orchestrator.failure_policy(), FailurePolicy::FailFast);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("perf-runner.toml");
        let cfg = PerfConfig {
            perf_test_path: temp.path().join("work"),
            pipeline: PipelineConfig {
                stage_timeout_secs: Some(7200),
                ..PipelineConfig::default()
            },
            ..PerfConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("perf-runner.toml");
        fs::write(
            &path,
            "perf_test_path = \"/srv/perf\"\n\n[orchestrator]\nfailure_policy = \"retry\"\nmax_attempts = 2\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.perf_test_path, PathBuf::from("/srv/perf"));
        assert_eq!(cfg.cleanup, CleanupConfig::default());
        assert_eq!(
            cfg.orchestrator.failure_policy(),
            FailurePolicy::Retry {
                max_attempts: 2,
                backoff_secs: 60
            }
        );
    }

    #[test]
    fn rejects_bad_cleanup_time_and_zero_retention() {
        let mut cfg = PerfConfig::default();
        cfg.cleanup.at = "24:30".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = PerfConfig::default();
        cfg.cleanup.retention_days = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("retention_days"));
    }

    #[test]
    fn rejects_empty_pipeline_command() {
        let mut cfg = PerfConfig::default();
        cfg.pipeline.command = Vec::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_journal_cap() {
        let mut cfg = PerfConfig::default();
        cfg.orchestrator.journal_max_bytes = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("journal_max_bytes"));
    }
}
