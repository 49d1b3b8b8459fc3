//! Shell command that prunes stale test-case directories.

use std::path::Path;

/// Directory name prefix used by pipeline runs for their artifacts.
pub const TEST_CASE_PREFIX: &str = "test_case_";

/// Build the `find` invocation that removes `test_case_*` directories directly
/// under `root` whose mtime is more than `retention_days` whole days old.
///
/// `find -mtime +N` rounds the age down to whole days, so with `N = 2` a
/// directory must be at least 72 hours old to be removed. Every removed path is
/// printed on its own line first.
pub fn prune_command(root: &Path, retention_days: u32) -> String {
    format!(
        "find {} -mindepth 1 -maxdepth 1 -type d -name '{TEST_CASE_PREFIX}*' -mtime +{retention_days} -print -exec rm -rf {{}} +",
        shell_quote(&root.to_string_lossy())
    )
}

/// Number of directories reported by the prune command's `-print` output.
pub fn removed_count(find_stdout: &str) -> usize {
    find_stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count()
}

/// Single-quote `raw` for POSIX `sh`.
fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}
