//! Log retention
//!
//! Rolling appenders never delete what they rolled. Files older than the
//! configured retention are removed when the logger starts.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::path::Path;

/// Delete files in `log_dir` whose name starts with `prefix` and that were
/// last modified more than `retention_days` ago.
///
/// The unrotated file named exactly `prefix` is the live log and is never
/// removed. A retention of `0` keeps everything. Returns the number of files
/// removed.
pub fn prune_expired_logs(log_dir: &Path, prefix: &str, retention_days: u32) -> Result<usize> {
    if retention_days == 0 || !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
    let mut removed = 0;

    for entry in fs::read_dir(log_dir).context("failed to read log directory")? {
        let entry = entry.context("failed to read directory entry")?;
        let path = entry.path();

        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(prefix) && name != prefix);
        if !is_log || !path.is_file() {
            continue;
        }

        let modified: DateTime<Utc> = entry
            .metadata()
            .and_then(|m| m.modified())
            .context("failed to get file modification time")?
            .into();
        if modified < cutoff {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            removed += 1;
        }
    }

    Ok(removed)
}
