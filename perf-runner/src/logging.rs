//! Tracing setup for the runner.
//!
//! Events go to stderr (compact, coloured) and to `<perf_test_path>/perf_test.log`
//! without ANSI codes. The log file rolls over at local midnight: the previous
//! day's file becomes `perf_test.log.YYYY-MM-DD` and only the newest
//! [`LOG_BACKUP_COUNT`] backups are kept. `RUST_LOG` overrides the default
//! `info` filter.
//!
//! ```bash
//! RUST_LOG=perf_runner=debug perf-runner start -b main -g g1 -m c1
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cleanup::{Clock, SystemClock};

const DEFAULT_FILTER: &str = "info";
const BACKUP_DATE_FORMAT: &str = "%Y-%m-%d";

/// Rotated log files kept next to the live one.
pub const LOG_BACKUP_COUNT: usize = 7;

/// Install the global subscriber writing to stderr and `log_path`.
pub fn init(log_path: &Path) -> Result<()> {
    let file = DailyLogFile::open(log_path, LOG_BACKUP_COUNT, SystemClock)?;

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_thread_names(true),
        )
        .try_init()
        .context("install tracing subscriber")
}

/// Stderr-only subscriber for commands that never touch the work root.
pub fn init_stderr() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Append-only log file that rolls over when the local date changes.
pub struct DailyLogFile<C> {
    path: PathBuf,
    backups: usize,
    clock: C,
    file: File,
    opened_on: NaiveDate,
}

impl<C: Clock> DailyLogFile<C> {
    /// Open `path` for appending; an existing file keeps growing until the
    /// next date change.
    pub fn open(path: &Path, backups: usize, clock: C) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log directory {}", parent.display()))?;
        }
        let file = open_append(path).with_context(|| format!("open log file {}", path.display()))?;
        let opened_on = clock.now().date();
        Ok(Self {
            path: path.to_path_buf(),
            backups,
            clock,
            file,
            opened_on,
        })
    }

    fn roll_over_if_due(&mut self) -> io::Result<()> {
        let today = self.clock.now().date();
        if today <= self.opened_on {
            return Ok(());
        }
        self.file.flush()?;
        match fs::rename(&self.path, backup_path(&self.path, self.opened_on)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.file = open_append(&self.path)?;
        self.opened_on = today;
        self.prune_backups()
    }

    /// Delete all but the newest `backups` dated copies.
    fn prune_backups(&self) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let prefix = match self.path.file_name() {
            Some(name) => format!("{}.", name.to_string_lossy()),
            None => return Ok(()),
        };

        let mut dated: Vec<(NaiveDate, PathBuf)> = fs::read_dir(dir)?
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let day = name.strip_prefix(&prefix)?;
                let day = NaiveDate::parse_from_str(day, BACKUP_DATE_FORMAT).ok()?;
                Some((day, entry.path()))
            })
            .collect();
        dated.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, stale) in dated.into_iter().skip(self.backups) {
            fs::remove_file(stale)?;
        }
        Ok(())
    }
}

impl<C: Clock> Write for DailyLogFile<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.roll_over_if_due()?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// `perf_test.log` -> `perf_test.log.2023-01-01`.
pub fn backup_path(path: &Path, day: NaiveDate) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", day.format(BACKUP_DATE_FORMAT)));
    PathBuf::from(name)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
