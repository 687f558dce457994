// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advisory run lock
//!
//! A whole reconciliation runs under an exclusive `flock` on a lock file, so
//! two installer runs never interleave writes to the providers directory or
//! the plugin configuration.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fd_lock::{RwLock, RwLockWriteGuard};
use tracing::debug;

use crate::error::{InstallError, Result};

/// Lock file handle
pub struct InstallLock {
    path: PathBuf,
    lock: RwLock<File>,
}

impl InstallLock {
    /// Open (creating if needed) the lock file at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| InstallError::fs(parent, e))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| InstallError::fs(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            lock: RwLock::new(file),
        })
    }

    /// Take the lock without waiting
    ///
    /// The lock is held until the returned guard is dropped.
    pub fn try_acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        let path = self.path.display().to_string();
        let mut guard = match self.lock.try_write() {
            Ok(guard) => guard,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(InstallError::LockHeld { path });
            }
            Err(e) => return Err(InstallError::fs(&self.path, e)),
        };

        // Record the holder for operators inspecting a stuck lock
        guard
            .set_len(0)
            .and_then(|_| writeln!(*guard, "{}", std::process::id()))
            .map_err(|e| InstallError::fs(&self.path, e))?;

        debug!(path = %path, "Acquired install lock");
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
