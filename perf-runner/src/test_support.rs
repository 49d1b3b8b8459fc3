//! Test doubles for the clock, the shell runner and the test pipeline.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDateTime, TimeDelta};
use tempfile::TempDir;

use crate::cleanup::Clock;
use crate::io::config::{PerfConfig, write_config};
use crate::io::pipeline::{PipelineFactory, TestPipeline};
use crate::io::process::{CommandOutput, CommandRunner};
use crate::io::stop::{StopMode, StopSignal};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clock driven by the test. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *lock(&self.now)
    }
}

/// Command runner that records `(path, command)` and returns a fixed exit code.
#[derive(Debug, Clone)]
pub struct RecordingRunner {
    exit_code: i32,
    calls: Arc<Mutex<Vec<(PathBuf, String)>>>,
    threads: Arc<Mutex<Vec<Option<String>>>>,
}

impl RecordingRunner {
    pub fn succeeding() -> Self {
        Self::failing(0)
    }

    pub fn failing(exit_code: i32) -> Self {
        Self {
            exit_code,
            calls: Arc::new(Mutex::new(Vec::new())),
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<(PathBuf, String)> {
        lock(&self.calls).clone()
    }

    /// Name of the thread each call ran on.
    pub fn thread_names(&self) -> Vec<Option<String>> {
        lock(&self.threads).clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run_command(&self, path: &Path, command: &str) -> Result<CommandOutput> {
        lock(&self.threads).push(std::thread::current().name().map(str::to_string));
        lock(&self.calls).push((path.to_path_buf(), command.to_string()));
        Ok(CommandOutput {
            exit_code: Some(self.exit_code),
            stdout: Vec::new(),
            stderr: if self.exit_code == 0 {
                Vec::new()
            } else {
                b"scripted failure".to_vec()
            },
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: false,
        })
    }
}

#[derive(Debug)]
struct ScriptedFailure {
    branch: String,
    call: String,
    remaining: usize,
}

#[derive(Debug, Default)]
struct ScriptState {
    calls: Vec<String>,
    failures: Vec<ScriptedFailure>,
    unchanged: HashSet<String>,
    stop_after: Option<(usize, StopSignal, StopMode)>,
    created: usize,
}

/// Pipeline factory whose pipelines record every call instead of doing work.
///
/// Calls are recorded as labels: `set_branch(main)`, `set_machine(c1)`,
/// `set_test_group(g1)`, `clean_env`, `download_db`, `install_db`,
/// `insert_data`, `run_test_case`, `backup_test_case`, `is_last_commit`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPipelineFactory {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedPipelineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `call` every time it runs for `branch`.
    pub fn fail_on(self, branch: &str, call: &str) -> Self {
        self.fail_times(branch, call, usize::MAX)
    }

    /// Fail `call` for `branch` the next `times` times it runs.
    pub fn fail_times(self, branch: &str, call: &str, times: usize) -> Self {
        lock(&self.state).failures.push(ScriptedFailure {
            branch: branch.to_string(),
            call: call.to_string(),
            remaining: times,
        });
        self
    }

    /// Report `branch`'s downloaded commit as already tested.
    pub fn unchanged(self, branch: &str) -> Self {
        lock(&self.state).unchanged.insert(branch.to_string());
        self
    }

    /// Request a stop on `signal` once `calls` calls have been recorded.
    pub fn stop_after(self, calls: usize, signal: &StopSignal, mode: StopMode) -> Self {
        lock(&self.state).stop_after = Some((calls, signal.clone(), mode));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Number of pipelines handed out so far.
    pub fn created(&self) -> usize {
        lock(&self.state).created
    }
}

impl PipelineFactory for ScriptedPipelineFactory {
    type Pipeline = ScriptedPipeline;

    fn create(&self) -> Result<ScriptedPipeline> {
        lock(&self.state).created += 1;
        Ok(ScriptedPipeline {
            state: Arc::clone(&self.state),
            branch: None,
        })
    }
}

/// Pipeline produced by [`ScriptedPipelineFactory`].
#[derive(Debug)]
pub struct ScriptedPipeline {
    state: Arc<Mutex<ScriptState>>,
    branch: Option<String>,
}

impl ScriptedPipeline {
    fn record(&self, call: &str, label: String) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(label);

        if let Some((after, signal, mode)) = &state.stop_after
            && state.calls.len() == *after
        {
            signal.request(*mode);
        }

        let branch = self.branch.as_deref().unwrap_or_default();
        if let Some(failure) = state
            .failures
            .iter_mut()
            .find(|f| f.branch == branch && f.call == call && f.remaining > 0)
        {
            failure.remaining -= 1;
            return Err(anyhow!("scripted {call} failure for {branch}"));
        }
        Ok(())
    }

    fn step(&self, call: &str) -> Result<()> {
        self.record(call, call.to_string())
    }
}

impl TestPipeline for ScriptedPipeline {
    fn set_branch(&mut self, branch: &str) -> Result<()> {
        self.branch = Some(branch.to_string());
        self.record("set_branch", format!("set_branch({branch})"))
    }

    fn set_machine(&mut self, cluster_id: &str) -> Result<()> {
        self.record("set_machine", format!("set_machine({cluster_id})"))
    }

    fn set_test_group(&mut self, test_group: &str) -> Result<()> {
        self.record("set_test_group", format!("set_test_group({test_group})"))
    }

    fn clean_env(&mut self) -> Result<()> {
        self.step("clean_env")
    }

    fn download_db(&mut self) -> Result<()> {
        self.step("download_db")
    }

    fn install_db(&mut self) -> Result<()> {
        self.step("install_db")
    }

    fn insert_data(&mut self) -> Result<()> {
        self.step("insert_data")
    }

    fn run_test_case(&mut self) -> Result<()> {
        self.step("run_test_case")
    }

    fn backup_test_case(&mut self) -> Result<()> {
        self.step("backup_test_case")
    }

    fn is_last_commit(&mut self) -> Result<bool> {
        self.step("is_last_commit")?;
        let branch = self.branch.as_deref().unwrap_or_default();
        Ok(lock(&self.state).unchanged.contains(branch))
    }
}

/// Temporary work root with a config file pointing at it.
pub struct TestWorkspace {
    _temp: TempDir,
    pub dir: PathBuf,
    pub root: PathBuf,
    pub config_path: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let dir = temp.path().to_path_buf();
        let root = dir.join("perf_test");
        let config_path = dir.join("perf-runner.toml");
        Ok(Self {
            _temp: temp,
            dir,
            root,
            config_path,
        })
    }

    /// Config rooted at this workspace with cleanup disabled.
    pub fn config(&self) -> PerfConfig {
        let mut cfg = PerfConfig {
            perf_test_path: self.root.clone(),
            ..PerfConfig::default()
        };
        cfg.cleanup.enabled = false;
        cfg
    }

    /// Write `script` as the stage program and return a config that runs it.
    pub fn config_with_stage_script(&self, script: &str) -> Result<PerfConfig> {
        let script_path = self.dir.join("stage.sh");
        std::fs::write(&script_path, script)
            .with_context(|| format!("write {}", script_path.display()))?;
        let mut cfg = self.config();
        cfg.pipeline.command = vec!["sh".to_string(), script_path.display().to_string()];
        Ok(cfg)
    }

    pub fn write_config(&self, cfg: &PerfConfig) -> Result<()> {
        write_config(&self.config_path, cfg)
    }
}
