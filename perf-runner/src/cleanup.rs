//! Background pruning of stale test-case directories.
//!
//! One job, fired once per calendar day at a fixed local time, runs the prune
//! command through a [`CommandRunner`]. The scheduler lives on its own thread,
//! polls for the due job at a fixed cadence and reports only through logs: a
//! failed firing is logged and the next day's firing still happens.

use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, error, info, instrument};

use crate::core::prune::{prune_command, removed_count};
use crate::core::schedule::{DailySchedule, ScheduleState};
use crate::io::process::CommandRunner;

/// Source of local wall-clock time.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// Local system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Result of one firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiringOutcome {
    Succeeded { removed: usize },
    Failed { reason: String },
}

/// The prune action bound to a work root.
#[derive(Debug, Clone)]
pub struct CleanupJob {
    root: PathBuf,
    retention_days: u32,
}

impl CleanupJob {
    pub fn new(root: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            root: root.into(),
            retention_days,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn command(&self) -> String {
        prune_command(&self.root, self.retention_days)
    }

    /// Run the prune command once. Never panics or propagates: failures come
    /// back as [`FiringOutcome::Failed`].
    #[instrument(skip_all, fields(root = %self.root.display(), retention_days = self.retention_days))]
    pub fn fire<R: CommandRunner + ?Sized>(&self, runner: &R) -> FiringOutcome {
        let command = self.command();
        info!(command = %command, "pruning stale test-case directories");

        let outcome = match runner.run_command(&self.root, &command) {
            Ok(output) if output.success() => FiringOutcome::Succeeded {
                removed: removed_count(&String::from_utf8_lossy(&output.stdout)),
            },
            Ok(output) => FiringOutcome::Failed {
                reason: format!(
                    "exit {:?}{}: {}",
                    output.exit_code,
                    if output.timed_out { " (timed out)" } else { "" },
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            },
            Err(err) => FiringOutcome::Failed {
                reason: format!("{err:#}"),
            },
        };

        match &outcome {
            FiringOutcome::Succeeded { removed } => info!(removed, "cleanup finished"),
            FiringOutcome::Failed { reason } => error!(reason = %reason, "cleanup failed"),
        }
        outcome
    }
}

/// Daily scheduler for a [`CleanupJob`].
pub struct CleanupScheduler<R, C> {
    job: CleanupJob,
    state: ScheduleState,
    runner: R,
    clock: C,
    poll_interval: Duration,
}

impl<R: CommandRunner, C: Clock> CleanupScheduler<R, C> {
    /// Register the job; the first firing is the next occurrence of `schedule`
    /// after the clock's current time.
    pub fn new(
        job: CleanupJob,
        schedule: DailySchedule,
        runner: R,
        clock: C,
        poll_interval: Duration,
    ) -> Self {
        let state = ScheduleState::new(schedule, clock.now());
        debug!(next_run = %state.next_run(), "cleanup job registered");
        Self {
            job,
            state,
            runner,
            clock,
            poll_interval,
        }
    }

    pub fn next_run(&self) -> NaiveDateTime {
        self.state.next_run()
    }

    /// Fire the job if it is due. Returns the outcome when it fired.
    pub fn run_pending(&mut self) -> Option<FiringOutcome> {
        let now = self.clock.now();
        if !self.state.poll(now) {
            return None;
        }
        let outcome = self.job.fire(&self.runner);
        debug!(next_run = %self.state.next_run(), "cleanup job rescheduled");
        Some(outcome)
    }

    /// Poll forever, sleeping `poll_interval` between checks.
    pub fn run_forever(mut self) {
        info!(
            root = %self.job.root().display(),
            next_run = %self.state.next_run(),
            "cleanup scheduler running"
        );
        loop {
            self.run_pending();
            thread::sleep(self.poll_interval);
        }
    }
}

impl<R, C> CleanupScheduler<R, C>
where
    R: CommandRunner + Send + 'static,
    C: Clock + Send + 'static,
{
    /// Spawn the scheduler on a detached, named thread.
    pub fn start(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("cleanup-scheduler".to_string())
            .spawn(move || self.run_forever())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::process::ShellCommandRunner;
    use crate::test_support::{ManualClock, RecordingRunner};
    use chrono::{NaiveDate, TimeDelta};
    use std::fs;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 1, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .expect("valid")
    }

    fn scheduler(
        runner: RecordingRunner,
        clock: ManualClock,
    ) -> CleanupScheduler<RecordingRunner, ManualClock> {
        CleanupScheduler::new(
            CleanupJob::new("/data/perf", 2),
            DailySchedule::parse("23:59").expect("schedule"),
            runner,
            clock,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn fires_once_per_simulated_day() {
        let clock = ManualClock::new(noon());
        let runner = RecordingRunner::succeeding();
        let mut scheduler = scheduler(runner.clone(), clock.clone());

        let mut fired_at = Vec::new();
        for _ in 0..(3 * 24 * 60) {
            clock.advance(TimeDelta::minutes(1));
            if scheduler.run_pending().is_some() {
                fired_at.push(clock.now());
            }
        }

        assert_eq!(fired_at.len(), 3);
        for ts in &fired_at {
            assert_eq!(ts.time(), chrono::NaiveTime::from_hms_opt(23, 59, 0).expect("time"));
        }
        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].0, PathBuf::from("/data/perf"));
        assert!(calls[0].1.contains("-name 'test_case_*'"));
        assert!(calls[0].1.contains("-mtime +2"));
    }

    #[test]
    fn failed_firing_does_not_stop_the_schedule() {
        let clock = ManualClock::new(noon());
        let runner = RecordingRunner::failing(1);
        let mut scheduler = scheduler(runner.clone(), clock.clone());

        clock.advance(TimeDelta::hours(12));
        assert!(matches!(
            scheduler.run_pending(),
            Some(FiringOutcome::Failed { .. })
        ));
        clock.advance(TimeDelta::days(1));
        assert!(scheduler.run_pending().is_some());
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn prunes_only_old_test_case_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let three_days = std::time::SystemTime::now() - Duration::from_secs(3 * 86_400 + 600);
        let one_day = std::time::SystemTime::now() - Duration::from_secs(86_400);

        let old = root.join("test_case_20230101");
        let fresh = root.join("test_case_20230103");
        let other = root.join("backup_20230101");
        for dir in [&old, &fresh, &other] {
            fs::create_dir_all(dir.join("data")).expect("mkdir");
        }
        for (dir, ts) in [(&old, three_days), (&fresh, one_day), (&other, three_days)] {
            filetime::set_file_mtime(dir, filetime::FileTime::from_system_time(ts))
                .expect("set mtime");
        }

        let outcome = CleanupJob::new(root, 2).fire(&ShellCommandRunner::default());

        assert_eq!(outcome, FiringOutcome::Succeeded { removed: 1 });
        assert!(!old.exists(), "3-day-old test case should be removed");
        assert!(fresh.exists(), "1-day-old test case should remain");
        assert!(other.exists(), "non test-case directory should remain");
    }

    #[test]
    fn bare_prefix_dir_is_removed_and_counted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bare = temp.path().join("test_case_");
        fs::create_dir_all(&bare).expect("mkdir");
        let old = std::time::SystemTime::now() - Duration::from_secs(3 * 86_400 + 600);
        filetime::set_file_mtime(&bare, filetime::FileTime::from_system_time(old))
            .expect("set mtime");

        let outcome = CleanupJob::new(temp.path(), 2).fire(&ShellCommandRunner::default());

        assert_eq!(outcome, FiringOutcome::Succeeded { removed: 1 });
        assert!(!bare.exists());
    }

    #[test]
    fn runner_error_is_reported_as_failure() {
        let outcome = CleanupJob::new("/definitely/missing/root", 2)
            .fire(&ShellCommandRunner::default());
        assert!(matches!(outcome, FiringOutcome::Failed { .. }));
    }
}
