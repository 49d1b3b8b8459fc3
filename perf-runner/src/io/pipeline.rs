//! Test pipeline abstraction.
//!
//! The [`TestPipeline`] trait decouples the orchestrator from the stage
//! implementations (environment cleanup, source download, install, data
//! loading, test execution, result backup). The bundled [`CommandPipeline`]
//! shells out to an external stage program; tests use scripted pipelines that
//! record calls without spawning processes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::Stage;
use crate::io::config::PipelineConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout, write_command_log};

/// One branch's pipeline. Every call blocks until the work is done or failed.
///
/// The setters must be called before any stage. Internal state (commit hash,
/// install path, ...) is owned by the implementation.
pub trait TestPipeline {
    fn set_branch(&mut self, branch: &str) -> Result<()>;
    fn set_machine(&mut self, cluster_id: &str) -> Result<()>;
    fn set_test_group(&mut self, test_group: &str) -> Result<()>;

    fn clean_env(&mut self) -> Result<()>;
    fn download_db(&mut self) -> Result<()>;
    fn install_db(&mut self) -> Result<()>;
    fn insert_data(&mut self) -> Result<()>;
    fn run_test_case(&mut self) -> Result<()>;
    fn backup_test_case(&mut self) -> Result<()>;

    /// True when the downloaded commit matches the last tested one.
    fn is_last_commit(&mut self) -> Result<bool> {
        Ok(false)
    }
}

/// Creates a fresh pipeline for every branch turn.
pub trait PipelineFactory {
    type Pipeline: TestPipeline;

    fn create(&self) -> Result<Self::Pipeline>;
}

/// Dispatch `stage` to the matching pipeline call.
pub fn run_stage<P: TestPipeline + ?Sized>(pipeline: &mut P, stage: Stage) -> Result<()> {
    match stage {
        Stage::CleanEnv => pipeline.clean_env(),
        Stage::DownloadSource => pipeline.download_db(),
        Stage::Install => pipeline.install_db(),
        Stage::LoadData => pipeline.insert_data(),
        Stage::RunTestCases => pipeline.run_test_case(),
        Stage::BackupResults => pipeline.backup_test_case(),
    }
}

/// Pipeline that runs `<program...> <stage> --branch B --machine C --test-group G`
/// in the work root, one process per stage.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    program: Vec<String>,
    workdir: PathBuf,
    logs_dir: PathBuf,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
    branch: Option<String>,
    machine: Option<String>,
    test_group: Option<String>,
}

impl CommandPipeline {
    pub fn new(config: &PipelineConfig, workdir: &Path, logs_dir: &Path) -> Self {
        Self {
            program: config.command.clone(),
            workdir: workdir.to_path_buf(),
            logs_dir: logs_dir.to_path_buf(),
            timeout: config.stage_timeout(),
            output_limit_bytes: config.output_limit_bytes,
            branch: None,
            machine: None,
            test_group: None,
        }
    }

    fn command_for(&self, step: &str) -> Result<Command> {
        let (program, base_args) = self
            .program
            .split_first()
            .ok_or_else(|| anyhow!("pipeline command is empty"))?;
        let branch = self
            .branch
            .as_deref()
            .ok_or_else(|| anyhow!("pipeline branch not set"))?;
        let machine = self
            .machine
            .as_deref()
            .ok_or_else(|| anyhow!("pipeline machine not set"))?;
        let test_group = self
            .test_group
            .as_deref()
            .ok_or_else(|| anyhow!("pipeline test group not set"))?;

        let mut cmd = Command::new(program);
        cmd.args(base_args)
            .arg(step)
            .arg("--branch")
            .arg(branch)
            .arg("--machine")
            .arg(machine)
            .arg("--test-group")
            .arg(test_group)
            .current_dir(&self.workdir);
        Ok(cmd)
    }

    /// Stage log location: `<logs>/<branch>/<step>.log` with `/` in branch names flattened.
    /// Each run of a step replaces its log.
    pub fn log_path(&self, step: &str) -> PathBuf {
        let branch = self.branch.as_deref().unwrap_or("unknown").replace('/', "_");
        self.logs_dir.join(branch).join(format!("{step}.log"))
    }

    #[instrument(skip_all, fields(step = %step, branch = ?self.branch))]
    fn invoke(&self, step: &str) -> Result<CommandOutput> {
        let cmd = self.command_for(step)?;
        debug!(program = ?cmd.get_program(), "invoking stage program");
        let output = run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run pipeline step {step}"))?;

        let log_path = self.log_path(step);
        let header = format!("{step} exit={:?}", output.exit_code);
        if let Err(e) = write_command_log(&log_path, &header, &output) {
            warn!(path = %log_path.display(), error = %e, "failed to write stage log");
        }
        Ok(output)
    }

    fn run_step(&self, stage: Stage) -> Result<()> {
        let step = stage.command_name();
        let output = self.invoke(step)?;
        if output.timed_out {
            return Err(anyhow!(
                "{step} timed out after {:?} (see {})",
                self.timeout.unwrap_or_default(),
                self.log_path(step).display()
            ));
        }
        if !output.success() {
            return Err(anyhow!(
                "{step} failed with status {:?} (see {})",
                output.exit_code,
                self.log_path(step).display()
            ));
        }
        info!(step, "pipeline step succeeded");
        Ok(())
    }
}

impl TestPipeline for CommandPipeline {
    fn set_branch(&mut self, branch: &str) -> Result<()> {
        self.branch = Some(branch.to_string());
        Ok(())
    }

    fn set_machine(&mut self, cluster_id: &str) -> Result<()> {
        self.machine = Some(cluster_id.to_string());
        Ok(())
    }

    fn set_test_group(&mut self, test_group: &str) -> Result<()> {
        self.test_group = Some(test_group.to_string());
        Ok(())
    }

    fn clean_env(&mut self) -> Result<()> {
        self.run_step(Stage::CleanEnv)
    }

    fn download_db(&mut self) -> Result<()> {
        self.run_step(Stage::DownloadSource)
    }

    fn install_db(&mut self) -> Result<()> {
        self.run_step(Stage::Install)
    }

    fn insert_data(&mut self) -> Result<()> {
        self.run_step(Stage::LoadData)
    }

    fn run_test_case(&mut self) -> Result<()> {
        self.run_step(Stage::RunTestCases)
    }

    fn backup_test_case(&mut self) -> Result<()> {
        self.run_step(Stage::BackupResults)
    }

    /// Exit 0 from `is-last-commit` means the commit was already tested.
    fn is_last_commit(&mut self) -> Result<bool> {
        let output = self.invoke("is-last-commit")?;
        if output.timed_out {
            return Err(anyhow!("is-last-commit timed out"));
        }
        Ok(output.success())
    }
}

/// Builds a [`CommandPipeline`] per branch turn.
#[derive(Debug, Clone)]
pub struct CommandPipelineFactory {
    config: PipelineConfig,
    workdir: PathBuf,
    logs_dir: PathBuf,
}

impl CommandPipelineFactory {
    pub fn new(config: &PipelineConfig, workdir: &Path, logs_dir: &Path) -> Self {
        Self {
            config: config.clone(),
            workdir: workdir.to_path_buf(),
            logs_dir: logs_dir.to_path_buf(),
        }
    }
}

impl PipelineFactory for CommandPipelineFactory {
    type Pipeline = CommandPipeline;

    fn create(&self) -> Result<CommandPipeline> {
        if !self.workdir.is_dir() {
            return Err(anyhow!(
                "pipeline workdir {} does not exist",
                self.workdir.display()
            ));
        }
        Ok(CommandPipeline::new(
            &self.config,
            &self.workdir,
            &self.logs_dir,
        ))
    }
}
