//! End-to-end loop tests running the real command pipeline against a shell
//! stage program in a temporary work root.

use std::fs;

use perf_runner::core::types::{BranchList, CycleContext, Stage, TurnOutcome};
use perf_runner::io::journal::read_turns;
use perf_runner::io::pipeline::CommandPipelineFactory;
use perf_runner::orchestrator::{Orchestrator, OrchestratorOptions, StageFailure};
use perf_runner::test_support::TestWorkspace;

/// Records `<stage> <branch>` and stops the loop once v2 is backed up.
const RECORDING_SCRIPT: &str = r#"echo "$1 $3" >> calls.txt
if [ "$1" = backup-test-case ] && [ "$3" = v2 ]; then echo drain > STOP; fi
"#;

fn context(branches: &str) -> CycleContext {
    CycleContext::new(BranchList::parse(branches).expect("branches"), "c1", "g1")
        .expect("context")
}

#[test]
fn one_cycle_runs_every_stage_for_every_branch() {
    let ws = TestWorkspace::new().expect("workspace");
    let cfg = ws
        .config_with_stage_script(RECORDING_SCRIPT)
        .expect("config");
    fs::create_dir_all(&cfg.perf_test_path).expect("root");

    let factory =
        CommandPipelineFactory::new(&cfg.pipeline, &cfg.perf_test_path, &cfg.stage_logs_dir());
    let mut orchestrator =
        Orchestrator::new(context("main,v2"), factory, OrchestratorOptions::from_config(&cfg));
    let summary = orchestrator.run().expect("run");

    assert_eq!(summary.cycles_completed, 1);
    assert_eq!(summary.turns_completed, 2);

    let calls = fs::read_to_string(cfg.perf_test_path.join("calls.txt")).expect("calls");
    let expected: Vec<String> = ["main", "v2"]
        .iter()
        .flat_map(|branch| {
            Stage::ALL
                .iter()
                .map(move |stage| format!("{} {branch}", stage.command_name()))
        })
        .collect();
    assert_eq!(calls.lines().collect::<Vec<_>>(), expected);

    assert!(!cfg.stop_file_path().exists(), "STOP file is consumed");
    assert!(cfg.stage_logs_dir().join("v2/run-test-case.log").exists());

    let turns = read_turns(&cfg.journal_path()).expect("journal");
    let branches: Vec<&str> = turns.iter().map(|t| t.branch.as_str()).collect();
    assert_eq!(branches, vec!["main", "v2"]);
    assert!(turns.iter().all(|t| t.outcome == TurnOutcome::Completed));
}

#[test]
fn failing_stage_stops_the_loop_with_a_stage_failure() {
    let ws = TestWorkspace::new().expect("workspace");
    let cfg = ws
        .config_with_stage_script(
            r#"echo "$1 $3" >> calls.txt
if [ "$1" = insert-data ] && [ "$3" = main ]; then exit 7; fi
"#,
        )
        .expect("config");
    fs::create_dir_all(&cfg.perf_test_path).expect("root");

    let factory =
        CommandPipelineFactory::new(&cfg.pipeline, &cfg.perf_test_path, &cfg.stage_logs_dir());
    let mut orchestrator =
        Orchestrator::new(context("main,v2"), factory, OrchestratorOptions::from_config(&cfg));
    let err = orchestrator.run().unwrap_err();

    let failure = err.downcast_ref::<StageFailure>().expect("stage failure");
    assert_eq!(failure.stage, Some(Stage::LoadData));
    assert!(format!("{:#}", failure.source).contains("status Some(7)"));

    let calls = fs::read_to_string(cfg.perf_test_path.join("calls.txt")).expect("calls");
    assert_eq!(calls.lines().last(), Some("insert-data main"));
    assert!(!calls.contains("v2"));

    let turns = read_turns(&cfg.journal_path()).expect("journal");
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].outcome, TurnOutcome::Failed);
    assert_eq!(turns[0].failed_stage.as_deref(), Some("insert-data"));
}
