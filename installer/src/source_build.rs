// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source checkout and build
//!
//! Clones (or updates) the plugin repository, runs the configured build
//! command inside it and collects the jars it left in `target/` directories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::artifact::NamedArtifact;
use crate::command::{CommandRunner, CommandSpec};
use crate::config::SourceConfig;
use crate::error::{InstallError, Result};

const GIT_TIMEOUT: Duration = Duration::from_secs(600);

/// A jar produced by the build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArtifact {
    /// File name
    pub name: String,
    /// Location inside the checkout
    pub path: PathBuf,
}

impl NamedArtifact for BuiltArtifact {
    fn artifact_name(&self) -> &str {
        &self.name
    }
}

/// Commands that bring the checkout at `source.checkout_dir` up to date
pub fn checkout_commands(source: &SourceConfig, exists: bool) -> Vec<CommandSpec> {
    let dir = source.checkout_dir.display().to_string();

    if exists {
        let mut commands = vec![CommandSpec::new("git")
            .args(["-C", dir.as_str(), "fetch", "--tags", "--prune", "origin"])
            .timeout(GIT_TIMEOUT)];
        match &source.git_ref {
            Some(reference) => commands.push(
                CommandSpec::new("git")
                    .args(["-C", dir.as_str(), "checkout", "--force"])
                    .arg(reference.as_str())
                    .timeout(GIT_TIMEOUT),
            ),
            None => commands.push(
                CommandSpec::new("git")
                    .args(["-C", dir.as_str(), "pull", "--ff-only"])
                    .timeout(GIT_TIMEOUT),
            ),
        }
        commands
    } else {
        let mut clone = CommandSpec::new("git").arg("clone");
        if let Some(reference) = &source.git_ref {
            clone = clone.args(["--branch", reference.as_str()]);
        }
        vec![clone
            .arg(source.git_url.as_str())
            .arg(dir)
            .timeout(GIT_TIMEOUT)]
    }
}

/// Clone or update the checkout
pub async fn checkout(runner: &dyn CommandRunner, source: &SourceConfig) -> Result<PathBuf> {
    let dir = source.checkout_dir.clone();
    let exists = dir.join(".git").is_dir();

    if !exists {
        if let Some(parent) = dir.parent() {
            if !runner.is_dry_run() {
                std::fs::create_dir_all(parent).map_err(|e| InstallError::fs(parent, e))?;
            }
        }
    }

    info!(url = %source.git_url, dir = %dir.display(), update = exists, "Fetching plugin sources");

    for spec in checkout_commands(source, exists) {
        let output = runner.run(&spec).await.map_err(|e| InstallError::FetchError {
            url: source.git_url.clone(),
            message: e.to_string(),
        })?;
        if !output.success {
            return Err(InstallError::FetchError {
                url: source.git_url.clone(),
                message: format!("'{}' {}", spec, output.failure_summary()),
            });
        }
    }

    Ok(dir)
}

/// Run the build command inside `dir`
pub async fn build(runner: &dyn CommandRunner, source: &SourceConfig, dir: &Path) -> Result<()> {
    let spec = CommandSpec::from_command_line(&source.build_command)
        .ok_or_else(|| InstallError::InvalidConfig {
            message: "source.build_command is empty".to_string(),
        })?
        .current_dir(dir)
        .timeout(Duration::from_secs(source.build_timeout_secs));

    info!(command = %spec, dir = %dir.display(), "Building plugin");

    let output = runner.run(&spec).await?;
    if !output.success {
        return Err(InstallError::CommandFailed {
            command: spec.to_string(),
            message: output.failure_summary(),
        });
    }
    Ok(())
}

/// Jars under any `target/` directory of the checkout, sorted by path
pub fn collect_artifacts(dir: &Path) -> Result<Vec<BuiltArtifact>> {
    let mut artifacts = Vec::new();

    if !dir.exists() {
        return Ok(artifacts);
    }

    for entry in WalkDir::new(dir).max_depth(4).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            InstallError::fs(&path, e.into())
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let in_target = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .map_or(false, |parent| parent == "target");
        let name = entry.file_name().to_string_lossy().to_string();

        if in_target && name.ends_with(".jar") {
            artifacts.push(BuiltArtifact {
                name,
                path: entry.path().to_path_buf(),
            });
        }
    }

    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(dir = %dir.display(), count = artifacts.len(), "Collected build outputs");
    Ok(artifacts)
}
