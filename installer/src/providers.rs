// SPDX-License-Identifier: AGPL-3.0-or-later
//! Providers directory maintenance
//!
//! Artifacts are staged next to their destination and renamed into place, so
//! a service restarting concurrently sees either the old file or the new one.
//! Files displaced by a placement are kept as hidden `.bak` copies until the
//! run commits, which is what makes rollback possible.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::artifact::{AssetKind, AssetPattern};
use crate::error::{InstallError, Result};

const BACKUP_SUFFIX: &str = ".bak";

/// A file moved aside during placement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    /// Where the file lived
    pub original: PathBuf,
    /// Where it is now
    pub backup: PathBuf,
}

/// Outcome of placing one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Installed file
    pub target: PathBuf,
    /// Whether the directory was modified
    pub changed: bool,
    /// Whether `target` did not exist before
    pub created: bool,
    /// Previous same-named file, if it was replaced
    pub replaced: Option<Backup>,
    /// Other versions of the same plugin that were moved out
    pub superseded: Vec<Backup>,
}

/// Hex SHA-256 of a file's content
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| InstallError::fs(path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| InstallError::fs(path, e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Names of the regular files in `dir`, sorted; empty when `dir` is missing
pub fn list(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| InstallError::fs(dir, e))? {
        let entry = entry.map_err(|e| InstallError::fs(dir, e))?;
        if entry.file_type().map_err(|e| InstallError::fs(entry.path(), e))?.is_file() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Remove `sources`, `javadoc` and `tests` variants from `dir`
///
/// Returns the removed paths. Running it again removes nothing.
pub fn cleanup_stale(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    for name in list(dir)? {
        if AssetKind::classify(&name).is_non_runtime() {
            let path = dir.join(&name);
            fs::remove_file(&path).map_err(|e| InstallError::fs(&path, e))?;
            info!(path = %path.display(), "Removed non-runtime artifact");
            removed.push(path);
        }
    }

    Ok(removed)
}

/// Copy `source` into `dir` atomically
///
/// Runtime jars in `dir` that match `family` under another name are older
/// versions of the same plugin and are moved aside. Nothing changes when an
/// identical file is already installed and no other version is present.
pub fn place(source: &Path, dir: &Path, family: &AssetPattern) -> Result<Placement> {
    let name = source
        .file_name()
        .ok_or_else(|| InstallError::fs(source, io::Error::from(io::ErrorKind::InvalidInput)))?
        .to_string_lossy()
        .to_string();
    let target = dir.join(&name);

    fs::create_dir_all(dir).map_err(|e| InstallError::fs(dir, e))?;

    let others: Vec<String> = list(dir)?
        .into_iter()
        .filter(|other| *other != name)
        .filter(|other| AssetKind::classify(other) == AssetKind::Jar && family.matches(other))
        .collect();

    let identical = target.is_file() && sha256_file(&target)? == sha256_file(source)?;

    if identical {
        let superseded = move_aside_all(dir, &others)?;
        debug!(path = %target.display(), "Installed artifact is identical, skipping copy");
        return Ok(Placement {
            changed: !superseded.is_empty(),
            created: false,
            target,
            replaced: None,
            superseded,
        });
    }

    // Fully written before anything in `dir` is touched; dropped (and deleted) on error
    let staged = stage_copy(source, dir)?;

    let replaced = if target.is_file() {
        let backup = backup_path(&target);
        if let Err(e) = fs::copy(&target, &backup) {
            discard(&backup);
            return Err(InstallError::fs(&backup, e));
        }
        Some(Backup {
            original: target.clone(),
            backup,
        })
    } else {
        None
    };

    let superseded = match move_aside_all(dir, &others) {
        Ok(superseded) => superseded,
        Err(e) => {
            if let Some(replaced) = &replaced {
                discard(&replaced.backup);
            }
            return Err(e);
        }
    };

    if let Err(e) = staged.persist(&target) {
        restore_all(&superseded);
        if let Some(replaced) = &replaced {
            discard(&replaced.backup);
        }
        return Err(InstallError::fs(&target, e.error));
    }

    info!(path = %target.display(), replaced = replaced.is_some(), "Placed artifact");

    Ok(Placement {
        created: replaced.is_none(),
        target,
        changed: true,
        replaced,
        superseded,
    })
}

/// Copy `source` to a synced, world-readable temp file in `dir`
fn stage_copy(source: &Path, dir: &Path) -> Result<tempfile::NamedTempFile> {
    let mut staged = tempfile::Builder::new()
        .prefix(".stage-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| InstallError::fs(dir, e))?;
    let mut input = File::open(source).map_err(|e| InstallError::fs(source, e))?;
    io::copy(&mut input, staged.as_file_mut())
        .and_then(|_| staged.as_file().sync_all())
        .map_err(|e| InstallError::fs(staged.path(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))
            .map_err(|e| InstallError::fs(staged.path(), e))?;
    }

    Ok(staged)
}

/// Move every named file in `dir` aside, or none of them
fn move_aside_all(dir: &Path, names: &[String]) -> Result<Vec<Backup>> {
    let mut moved = Vec::new();
    for name in names {
        let original = dir.join(name);
        match move_aside(&original) {
            Ok(backup) => {
                info!(path = %original.display(), "Moved aside older plugin version");
                moved.push(Backup { original, backup });
            }
            Err(e) => {
                restore_all(&moved);
                return Err(e);
            }
        }
    }
    Ok(moved)
}

/// Best-effort return of moved files after a failed placement
fn restore_all(backups: &[Backup]) {
    for backup in backups {
        if let Err(e) = fs::rename(&backup.backup, &backup.original) {
            warn!(path = %backup.original.display(), error = %e, "Cannot restore moved artifact");
        }
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Cannot remove backup");
        }
    }
}

/// Undo a placement, restoring whatever it displaced
pub fn revert(placement: &Placement) -> Result<()> {
    if let Some(backup) = &placement.replaced {
        fs::rename(&backup.backup, &backup.original)
            .map_err(|e| InstallError::fs(&backup.original, e))?;
        info!(path = %backup.original.display(), "Restored previous artifact");
    } else if placement.created && placement.target.exists() {
        fs::remove_file(&placement.target).map_err(|e| InstallError::fs(&placement.target, e))?;
        info!(path = %placement.target.display(), "Removed newly placed artifact");
    }

    for backup in &placement.superseded {
        fs::rename(&backup.backup, &backup.original)
            .map_err(|e| InstallError::fs(&backup.original, e))?;
        info!(path = %backup.original.display(), "Restored superseded artifact");
    }

    Ok(())
}

/// Drop the backups of a successful placement
pub fn commit(placement: &Placement) {
    let backups = placement.replaced.iter().chain(placement.superseded.iter());
    for backup in backups {
        discard(&backup.backup);
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}{}", name, BACKUP_SUFFIX))
}

fn move_aside(path: &Path) -> Result<PathBuf> {
    let backup = backup_path(path);
    fs::rename(path, &backup).map_err(|e| InstallError::fs(path, e))?;
    Ok(backup)
}
