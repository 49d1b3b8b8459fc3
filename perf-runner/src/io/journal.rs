//! Append-only journal of branch turns (`<root>/cycles.jsonl`).
//!
//! The journal is size-capped: once appending would push it past the limit the
//! current file moves to `cycles.jsonl.1` (replacing the older backup) and a
//! fresh file is started.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::TurnOutcome;

/// One finished branch turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub cycle: u64,
    pub branch: String,
    pub attempt: u32,
    pub outcome: TurnOutcome,
    /// Stage name when the turn ended on a failure.
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
}

pub const DEFAULT_JOURNAL_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Location of the single rotated journal backup.
pub fn rotated_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".1");
    PathBuf::from(name)
}

/// Append `record` as a single JSON line, rotating first if the journal would
/// grow past `max_bytes`.
pub fn append_turn(path: &Path, record: &TurnRecord, max_bytes: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create journal dir {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record).context("serialize turn record")?;
    line.push('\n');

    if let Ok(meta) = fs::metadata(path)
        && meta.len() > 0
        && meta.len() + line.len() as u64 > max_bytes
    {
        let backup = rotated_path(path);
        fs::rename(path, &backup).with_context(|| {
            format!("rotate journal {} to {}", path.display(), backup.display())
        })?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open journal {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append journal {}", path.display()))?;
    Ok(())
}

/// Read every record in the journal. A missing file is an empty journal.
pub fn read_turns(path: &Path) -> Result<Vec<TurnRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read journal {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cycle: u64, branch: &str, outcome: TurnOutcome) -> TurnRecord {
        TurnRecord {
            cycle,
            branch: branch.to_string(),
            attempt: 1,
            outcome,
            failed_stage: None,
            error: None,
            started_at: "2023-01-01T00:00:00+00:00".to_string(),
            finished_at: "2023-01-01T01:00:00+00:00".to_string(),
            duration_ms: 3_600_000,
        }
    }

    #[test]
    fn appends_one_line_per_turn() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/cycles.jsonl");
        append_turn(&path, &record(1, "main", TurnOutcome::Completed), DEFAULT_JOURNAL_MAX_BYTES)
            .expect("append");
        append_turn(&path, &record(1, "v2", TurnOutcome::Skipped), DEFAULT_JOURNAL_MAX_BYTES)
            .expect("append");

        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().next().expect("line").contains("\"outcome\":\"completed\""));

        let turns = read_turns(&path).expect("read turns");
        assert_eq!(turns[1].branch, "v2");
        assert_eq!(turns[1].outcome, TurnOutcome::Skipped);
    }

    #[test]
    fn full_journal_rotates_to_a_single_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cycles.jsonl");
        let line_len = serde_json::to_string(&record(1, "main", TurnOutcome::Completed))
            .expect("serialize")
            .len() as u64
            + 1;
        // Room for two records per file.
        let max_bytes = 2 * line_len + 1;

        for cycle in 1..=5 {
            append_turn(&path, &record(cycle, "main", TurnOutcome::Completed), max_bytes)
                .expect("append");
        }

        let current = read_turns(&path).expect("current");
        let backup = read_turns(&rotated_path(&path)).expect("backup");
        assert_eq!(current.iter().map(|t| t.cycle).collect::<Vec<_>>(), vec![5]);
        assert_eq!(backup.iter().map(|t| t.cycle).collect::<Vec<_>>(), vec![3, 4]);
        assert!(fs::metadata(&path).expect("meta").len() <= max_bytes);
    }

    #[test]
    fn missing_journal_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(read_turns(&temp.path().join("none.jsonl")).expect("read").is_empty());
    }
}
