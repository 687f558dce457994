// SPDX-License-Identifier: AGPL-3.0-or-later
//! Zip archive inspection and extraction
//!
//! Releases that ship a bundle instead of bare jars are unpacked with the
//! system `unzip` tool, one entry at a time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::artifact::{file_name, select_jar, AssetPattern};
use crate::command::{run_checked, CommandRunner, CommandSpec};
use crate::error::{InstallError, Result};

const UNZIP_TIMEOUT: Duration = Duration::from_secs(120);

/// List the file entries of `archive`
pub async fn list_entries(runner: &dyn CommandRunner, archive: &Path) -> Result<Vec<String>> {
    let spec = CommandSpec::new("unzip")
        .arg("-Z1")
        .path_arg(archive)
        .timeout(UNZIP_TIMEOUT);
    let output = run_checked(runner, &spec).await?;

    let entries: Vec<String> = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.ends_with('/'))
        .map(str::to_string)
        .collect();

    debug!(archive = %archive.display(), entries = entries.len(), "Listed archive");
    Ok(entries)
}

/// Escape `unzip` wildcard characters so `name` matches only itself
pub fn literal_member(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, '\\' | '*' | '?' | '[' | ']') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Extract the runtime jar matching `pattern` from `archive` into `dest_dir`
///
/// Returns `Ok(None)` when the archive holds no matching runtime jar.
pub async fn extract_matching(
    runner: &dyn CommandRunner,
    archive: &Path,
    pattern: &AssetPattern,
    dest_dir: &Path,
) -> Result<Option<PathBuf>> {
    let entries = list_entries(runner, archive).await?;

    let entry = match select_jar(&entries, pattern) {
        Some(entry) => entry,
        None => {
            debug!(archive = %archive.display(), pattern = %pattern, "No matching entry");
            return Ok(None);
        }
    };

    info!(archive = %archive.display(), entry = %entry, "Extracting artifact from archive");

    let spec = CommandSpec::new("unzip")
        .args(["-o", "-j", "-q"])
        .path_arg(archive)
        .arg(literal_member(entry))
        .arg("-d")
        .path_arg(dest_dir)
        .timeout(UNZIP_TIMEOUT);
    run_checked(runner, &spec).await?;

    let extracted = dest_dir.join(file_name(entry));
    if !extracted.is_file() {
        return Err(InstallError::CommandFailed {
            command: spec.to_string(),
            message: format!("expected {} after extraction", extracted.display()),
        });
    }

    Ok(Some(extracted))
}
