//! Branch cycle orchestration for `perf-runner start`.
//!
//! The orchestrator walks the branch list forever. Each branch turn builds a
//! fresh [`PipelineRun`] and runs the six stages strictly in order; the next
//! branch only starts once the current turn has completed or failed. Stage
//! failures go through the configured [`FailurePolicy`]. Stop requests (signal
//! or STOP file) are honored between branch turns and between stages, so an
//! in-flight stage is never interrupted.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Local;
use tracing::{debug, error, info, instrument, warn};

use crate::cleanup::{CleanupScheduler, Clock};
use crate::core::types::{CycleContext, FailurePolicy, OrchestratorState, Stage, TurnOutcome};
use crate::io::config::PerfConfig;
use crate::io::journal::{DEFAULT_JOURNAL_MAX_BYTES, TurnRecord, append_turn};
use crate::io::pipeline::{PipelineFactory, TestPipeline, run_stage};
use crate::io::process::CommandRunner;
use crate::io::stop::{StopMode, StopSignal};

/// A failed pipeline call during a branch turn.
///
/// `stage` is `None` when the pipeline could not be created or configured.
#[derive(Debug)]
pub struct StageFailure {
    pub branch: String,
    pub cycle: u64,
    pub attempt: u32,
    pub stage: Option<Stage>,
    pub source: anyhow::Error,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(
                f,
                "stage {stage} failed for branch '{}' (cycle {}, attempt {})",
                self.branch, self.cycle, self.attempt
            ),
            None => write!(
                f,
                "pipeline setup failed for branch '{}' (cycle {}, attempt {})",
                self.branch, self.cycle, self.attempt
            ),
        }
    }
}

impl StageFailure {
    /// One-line description including the underlying error chain.
    pub fn summary(&self) -> String {
        format!("{self}: {:#}", self.source)
    }
}

impl StdError for StageFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.source)
    }
}

/// Tunables for the loop, usually derived from [`PerfConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub failure_policy: FailurePolicy,
    pub skip_unchanged_commits: bool,
    pub unchanged_commit_backoff: Duration,
    /// STOP file polled alongside the in-process stop signal.
    pub stop_file: Option<PathBuf>,
    /// Journal receiving one record per finished branch turn.
    pub journal_path: Option<PathBuf>,
    pub journal_max_bytes: u64,
    /// Sleep before the next cycle when no branch turn in a cycle got through.
    pub idle_cycle_backoff: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::FailFast,
            skip_unchanged_commits: false,
            unchanged_commit_backoff: Duration::from_secs(5),
            stop_file: None,
            journal_path: None,
            journal_max_bytes: DEFAULT_JOURNAL_MAX_BYTES,
            idle_cycle_backoff: Duration::from_secs(60),
        }
    }
}

impl OrchestratorOptions {
    pub fn from_config(cfg: &PerfConfig) -> Self {
        Self {
            failure_policy: cfg.orchestrator.failure_policy(),
            skip_unchanged_commits: cfg.orchestrator.skip_unchanged_commits,
            unchanged_commit_backoff: Duration::from_secs(
                cfg.orchestrator.unchanged_commit_backoff_secs,
            ),
            stop_file: Some(cfg.stop_file_path()),
            journal_path: Some(cfg.journal_path()),
            journal_max_bytes: cfg.orchestrator.journal_max_bytes,
            idle_cycle_backoff: Duration::from_secs(cfg.orchestrator.idle_cycle_backoff_secs),
        }
    }
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles_completed: u64,
    pub turns_completed: u64,
    pub turns_unchanged: u64,
    pub turns_skipped: u64,
    pub turns_interrupted: u64,
    /// Cycles followed by the idle backoff.
    pub idle_backoffs: u64,
}

impl RunSummary {
    fn progress(&self) -> u64 {
        self.turns_completed + self.turns_unchanged
    }

    fn record(&mut self, outcome: TurnOutcome) {
        match outcome {
            TurnOutcome::Completed => self.turns_completed += 1,
            TurnOutcome::Unchanged => self.turns_unchanged += 1,
            TurnOutcome::Skipped => self.turns_skipped += 1,
            TurnOutcome::Interrupted => self.turns_interrupted += 1,
            TurnOutcome::Failed => {}
        }
    }
}

/// One branch's pipeline for one cycle. Dropped at the end of the turn.
pub struct PipelineRun<P> {
    branch: String,
    cluster_id: String,
    test_group: String,
    pipeline: P,
}

impl<P: TestPipeline> PipelineRun<P> {
    /// Create a pipeline and bind it to (branch, cluster, test group), in that order.
    pub fn open<F>(factory: &F, branch: &str, cluster_id: &str, test_group: &str) -> Result<Self>
    where
        F: PipelineFactory<Pipeline = P>,
    {
        let mut pipeline = factory.create()?;
        pipeline.set_branch(branch)?;
        pipeline.set_machine(cluster_id)?;
        pipeline.set_test_group(test_group)?;
        Ok(Self {
            branch: branch.to_string(),
            cluster_id: cluster_id.to_string(),
            test_group: test_group.to_string(),
            pipeline,
        })
    }

    #[instrument(skip_all, fields(branch = %self.branch, cluster_id = %self.cluster_id, test_group = %self.test_group, stage = %stage))]
    pub fn run_stage(&mut self, stage: Stage) -> Result<()> {
        info!("stage started");
        let started = Instant::now();
        run_stage(&mut self.pipeline, stage)?;
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "stage finished");
        Ok(())
    }

    pub fn is_last_commit(&mut self) -> Result<bool> {
        self.pipeline.is_last_commit()
    }
}

type CleanupLauncher = Box<dyn FnOnce() -> io::Result<JoinHandle<()>>>;

/// Drives the pipeline across the branch list until stopped or a failure ends the run.
pub struct Orchestrator<F> {
    ctx: CycleContext,
    factory: F,
    options: OrchestratorOptions,
    stop: StopSignal,
    state: OrchestratorState,
    cleanup: Option<CleanupLauncher>,
}

impl<F: PipelineFactory> Orchestrator<F> {
    pub fn new(ctx: CycleContext, factory: F, options: OrchestratorOptions) -> Self {
        Self {
            ctx,
            factory,
            options,
            stop: StopSignal::new(),
            state: OrchestratorState::Idle,
            cleanup: None,
        }
    }

    /// Launch `scheduler` on its own thread when the loop starts.
    pub fn with_cleanup<R, C>(self, scheduler: CleanupScheduler<R, C>) -> Self
    where
        R: CommandRunner + Send + 'static,
        C: Clock + Send + 'static,
    {
        self.with_cleanup_launcher(move || scheduler.start())
    }

    pub fn with_cleanup_launcher<L>(mut self, launcher: L) -> Self
    where
        L: FnOnce() -> io::Result<JoinHandle<()>> + 'static,
    {
        self.cleanup = Some(Box::new(launcher));
        self
    }

    /// Handle for requesting a stop from another thread.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Run cycles until a stop request is honored or a failure propagates.
    ///
    /// Without a stop request this never returns `Ok`.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.launch_cleanup();

        let mut summary = RunSummary::default();
        let mut cycle = 0u64;
        info!(
            branches = ?self.ctx.branches().as_slice(),
            cluster_id = %self.ctx.cluster_id(),
            test_group = %self.ctx.test_group(),
            "performance test loop started"
        );
        loop {
            cycle += 1;
            let progress = summary.progress();
            let finished = self.run_cycle(cycle, &mut summary)?;
            if !finished {
                break;
            }
            summary.cycles_completed += 1;
            if summary.progress() == progress {
                summary.idle_backoffs += 1;
                warn!(
                    cycle,
                    backoff_secs = self.options.idle_cycle_backoff.as_secs(),
                    "no branch turn got through this cycle, backing off"
                );
                thread::sleep(self.options.idle_cycle_backoff);
            }
            debug!(cycle, "cycle complete, restarting from first branch");
        }

        self.set_state(OrchestratorState::Stopped);
        info!(
            cycles_completed = summary.cycles_completed,
            turns_completed = summary.turns_completed,
            "performance test loop stopped"
        );
        Ok(summary)
    }

    /// Run one pass over the branch list. Returns `false` when a stop ended it early.
    #[instrument(skip_all, fields(cycle = cycle))]
    pub fn run_cycle(&mut self, cycle: u64, summary: &mut RunSummary) -> Result<bool> {
        let branches = self.ctx.branches().clone();
        for (index, branch) in branches.iter().enumerate() {
            if self.poll_stop().is_some() {
                self.set_state(OrchestratorState::Draining);
                info!(next_branch = %branch, "stop requested between branch turns");
                return Ok(false);
            }
            self.set_state(OrchestratorState::RunningBranch(index));
            let outcome = self.run_turn_with_policy(cycle, branch)?;
            summary.record(outcome);
            if outcome == TurnOutcome::Interrupted {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn run_turn_with_policy(&mut self, cycle: u64, branch: &str) -> Result<TurnOutcome> {
        let mut attempt = 1u32;
        loop {
            let started_at = Local::now();
            let started = Instant::now();
            match self.run_turn(cycle, branch, attempt) {
                Ok(outcome) => {
                    self.journal(cycle, branch, attempt, outcome, None, started_at, started);
                    return Ok(outcome);
                }
                Err(failure) => {
                    let retry_backoff = match self.options.failure_policy {
                        FailurePolicy::Retry {
                            max_attempts,
                            backoff_secs,
                        } if attempt < max_attempts => Some(Duration::from_secs(backoff_secs)),
                        _ => None,
                    };

                    if let Some(backoff) = retry_backoff {
                        warn!(
                            error = %failure.summary(),
                            backoff_secs = backoff.as_secs(),
                            "branch turn failed, retrying"
                        );
                        self.journal(
                            cycle,
                            branch,
                            attempt,
                            TurnOutcome::Failed,
                            Some(&failure),
                            started_at,
                            started,
                        );
                        thread::sleep(backoff);
                        if self.poll_stop().is_some() {
                            return Ok(TurnOutcome::Interrupted);
                        }
                        attempt += 1;
                        continue;
                    }

                    if self.options.failure_policy == FailurePolicy::SkipBranch {
                        error!(
                            error = %failure.summary(),
                            "branch turn failed, skipping to next branch"
                        );
                        self.journal(
                            cycle,
                            branch,
                            attempt,
                            TurnOutcome::Skipped,
                            Some(&failure),
                            started_at,
                            started,
                        );
                        return Ok(TurnOutcome::Skipped);
                    }

                    self.journal(
                        cycle,
                        branch,
                        attempt,
                        TurnOutcome::Failed,
                        Some(&failure),
                        started_at,
                        started,
                    );
                    return Err(failure.into());
                }
            }
        }
    }

    /// Run a single branch turn: open the pipeline, then the six stages.
    #[instrument(skip_all, fields(cycle = cycle, branch = %branch, attempt = attempt))]
    fn run_turn(
        &mut self,
        cycle: u64,
        branch: &str,
        attempt: u32,
    ) -> std::result::Result<TurnOutcome, StageFailure> {
        let fail = |stage: Option<Stage>, source: anyhow::Error| StageFailure {
            branch: branch.to_string(),
            cycle,
            attempt,
            stage,
            source,
        };

        info!("branch turn started");
        let mut run = PipelineRun::open(
            &self.factory,
            branch,
            self.ctx.cluster_id(),
            self.ctx.test_group(),
        )
        .map_err(|e| fail(None, e))?;

        for (idx, stage) in Stage::ALL.into_iter().enumerate() {
            run.run_stage(stage).map_err(|e| fail(Some(stage), e))?;

            if stage == Stage::DownloadSource && self.options.skip_unchanged_commits {
                let unchanged = run
                    .is_last_commit()
                    .map_err(|e| fail(Some(stage), e))?;
                if unchanged {
                    warn!(
                        backoff_secs = self.options.unchanged_commit_backoff.as_secs(),
                        "no new commit since last test, skipping remaining stages"
                    );
                    thread::sleep(self.options.unchanged_commit_backoff);
                    return Ok(TurnOutcome::Unchanged);
                }
            }

            let last = idx + 1 == Stage::ALL.len();
            if !last {
                match self.poll_stop() {
                    Some(StopMode::AfterStage) => {
                        self.set_state(OrchestratorState::Draining);
                        info!(completed_stage = %stage, "stop requested, abandoning remaining stages");
                        return Ok(TurnOutcome::Interrupted);
                    }
                    Some(StopMode::Drain) => {
                        self.set_state(OrchestratorState::Draining);
                    }
                    None => {}
                }
            }
        }

        info!("branch turn completed");
        Ok(TurnOutcome::Completed)
    }

    fn launch_cleanup(&mut self) {
        let Some(launcher) = self.cleanup.take() else {
            debug!("no cleanup scheduler configured");
            return;
        };
        match launcher() {
            Ok(_handle) => info!("started background cleanup of stale test cases"),
            Err(e) => warn!(error = %e, "failed to start cleanup scheduler, continuing without cleanup"),
        }
    }

    fn poll_stop(&self) -> Option<StopMode> {
        if let Some(path) = &self.options.stop_file {
            self.stop.check_stop_file(path);
        }
        self.stop.requested()
    }

    fn set_state(&mut self, state: OrchestratorState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "orchestrator state change");
            self.state = state;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn journal(
        &self,
        cycle: u64,
        branch: &str,
        attempt: u32,
        outcome: TurnOutcome,
        failure: Option<&StageFailure>,
        started_at: chrono::DateTime<Local>,
        started: Instant,
    ) {
        let Some(path) = &self.options.journal_path else {
            return;
        };
        let record = TurnRecord {
            cycle,
            branch: branch.to_string(),
            attempt,
            outcome,
            failed_stage: failure.and_then(|f| f.stage).map(|s| s.to_string()),
            error: failure.map(|f| format!("{:#}", f.source)),
            started_at: started_at.to_rfc3339(),
            finished_at: Local::now().to_rfc3339(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if let Err(e) = append_turn(path, &record, self.options.journal_max_bytes) {
            warn!(path = %path.display(), error = %e, "failed to append turn journal");
        }
    }
}
