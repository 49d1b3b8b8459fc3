//! Continuous performance-test runner.
//!
//! `start` cycles the test pipeline over a branch list until stopped and prunes
//! stale test-case directories daily; `stop` asks a running loop to finish.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, warn};

use perf_runner::cleanup::{CleanupJob, CleanupScheduler, SystemClock};
use perf_runner::core::types::{BranchList, CycleContext};
use perf_runner::exit_codes;
use perf_runner::io::config::{DEFAULT_CONFIG_PATH, load_config};
use perf_runner::io::pipeline::CommandPipelineFactory;
use perf_runner::io::process::ShellCommandRunner;
use perf_runner::io::stop::{StopMode, clear_stale_stop_file, write_stop_file};
use perf_runner::logging;
use perf_runner::orchestrator::{Orchestrator, OrchestratorOptions};

const ERROR_REPORT_HELP: &str = "\
Errors are reported with their full context chain. Set RUST_BACKTRACE=1 to
also print the stack trace captured where the error was created.

Set RUST_LOG (default `info`) to change the log level.";

#[derive(Parser, Debug)]
#[command(
    name = "perf-runner",
    version,
    about = "Continuous per-branch performance test runner",
    after_help = ERROR_REPORT_HELP
)]
struct Cli {
    /// Runner config file (TOML).
    #[arg(
        long,
        global = true,
        env = "PERF_RUNNER_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the branch cycle loop and the daily cleanup until stopped.
    Start {
        /// Comma-separated branch names, tested in order, repeated forever.
        #[arg(short, long)]
        branches: String,
        /// Test group passed to every stage.
        #[arg(short = 'g', long)]
        test_group: String,
        /// Cluster id of the machine under test.
        #[arg(short, long)]
        machine: String,
    },
    /// Ask a running loop to stop.
    Stop {
        /// Let the current branch finish all stages (`false`: stop after the current stage).
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        wait_for_finished: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            // The debug form carries the context chain, plus a backtrace
            // when RUST_BACKTRACE is set.
            eprintln!("{err:?}");
            eprintln!("\x1b[1;31merror: {err:#}\x1b[0m");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Start {
            branches,
            test_group,
            machine,
        } => cmd_start(&cli.config, &branches, &test_group, &machine),
        Command::Stop { wait_for_finished } => cmd_stop(&cli.config, wait_for_finished),
    }
}

fn cmd_start(config_path: &Path, branches: &str, test_group: &str, machine: &str) -> Result<()> {
    let cfg = load_config(config_path)?;
    let branches = BranchList::parse(branches).context("invalid --branches")?;
    let ctx = CycleContext::new(branches, machine, test_group)?;

    let root = &cfg.perf_test_path;
    fs::create_dir_all(root).with_context(|| format!("create work root {}", root.display()))?;
    logging::init(&cfg.log_path())?;
    info!(config = %config_path.display(), root = %root.display(), "perf-runner starting");

    if clear_stale_stop_file(&cfg.stop_file_path())? {
        warn!("removed STOP file left by a previous run");
    }

    let factory = CommandPipelineFactory::new(&cfg.pipeline, root, &cfg.stage_logs_dir());
    let mut orchestrator = Orchestrator::new(ctx, factory, OrchestratorOptions::from_config(&cfg));
    if cfg.cleanup.enabled {
        let scheduler = CleanupScheduler::new(
            CleanupJob::new(root.clone(), cfg.cleanup.retention_days),
            cfg.cleanup_schedule()?,
            ShellCommandRunner::default(),
            SystemClock,
            cfg.poll_interval(),
        );
        info!(next_run = %scheduler.next_run(), "cleanup scheduled");
        orchestrator = orchestrator.with_cleanup(scheduler);
    } else {
        info!("cleanup disabled by config");
    }

    let summary = orchestrator.run()?;
    info!(?summary, "perf-runner stopped");
    Ok(())
}

fn cmd_stop(config_path: &Path, wait_for_finished: bool) -> Result<()> {
    logging::init_stderr();
    let cfg = load_config(config_path)?;
    let mode = StopMode::from_wait_for_finished(wait_for_finished);
    let stop_path = cfg.stop_file_path();
    write_stop_file(&stop_path, mode)?;
    info!(path = %stop_path.display(), ?mode, "stop requested");
    println!("{}", stop_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn help_documents_backtrace_and_log_env_vars() {
        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("RUST_BACKTRACE=1"), "{help}");
        assert!(help.contains("RUST_LOG"), "{help}");
    }

    #[test]
    fn parse_start() {
        let cli = Cli::parse_from([
            "perf-runner",
            "start",
            "-b",
            "main,3.0",
            "-g",
            "g1",
            "-m",
            "c1",
        ]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        match cli.command {
            Command::Start {
                branches,
                test_group,
                machine,
            } => {
                assert_eq!(branches, "main,3.0");
                assert_eq!(test_group, "g1");
                assert_eq!(machine, "c1");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parse_start_requires_all_arguments() {
        assert!(Cli::try_parse_from(["perf-runner", "start", "-b", "main"]).is_err());
    }

    #[test]
    fn parse_stop_defaults_to_waiting() {
        let cli = Cli::parse_from(["perf-runner", "stop"]);
        assert!(matches!(
            cli.command,
            Command::Stop {
                wait_for_finished: true
            }
        ));
    }

    #[test]
    fn parse_stop_without_waiting() {
        let cli = Cli::parse_from([
            "perf-runner",
            "--config",
            "other.toml",
            "stop",
            "--wait-for-finished",
            "false",
        ]);
        assert_eq!(cli.config, PathBuf::from("other.toml"));
        assert!(matches!(
            cli.command,
            Command::Stop {
                wait_for_finished: false
            }
        ));
    }
}
