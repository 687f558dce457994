// SPDX-License-Identifier: AGPL-3.0-or-later
//! OS package installation

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{InstallError, Result};

/// Supported package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManagerKind {
    /// Debian / Ubuntu
    Apt,
    /// Fedora / RHEL 8+
    Dnf,
    /// RHEL 7 / CentOS 7
    Yum,
    /// openSUSE / SLES
    Zypper,
}

impl PackageManagerKind {
    /// Detection order when nothing is configured
    pub const ALL: [PackageManagerKind; 4] = [
        PackageManagerKind::Apt,
        PackageManagerKind::Dnf,
        PackageManagerKind::Yum,
        PackageManagerKind::Zypper,
    ];

    /// Executable name
    pub fn program(self) -> &'static str {
        match self {
            PackageManagerKind::Apt => "apt-get",
            PackageManagerKind::Dnf => "dnf",
            PackageManagerKind::Yum => "yum",
            PackageManagerKind::Zypper => "zypper",
        }
    }

    /// Find the first supported package manager on `PATH`
    pub fn detect() -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| which::which(kind.program()).is_ok())
    }

    /// Distribution-specific package name for a generic one
    pub fn package_name(self, generic: &str) -> String {
        match (self, generic) {
            (PackageManagerKind::Dnf | PackageManagerKind::Yum, "iproute2") => {
                "iproute".to_string()
            }
            _ => generic.to_string(),
        }
    }

    /// Commands that install `packages`, in order
    pub fn install_commands(self, packages: &[String]) -> Vec<CommandSpec> {
        let names: Vec<String> = packages.iter().map(|name| self.package_name(name)).collect();
        let timeout = Duration::from_secs(900);

        match self {
            PackageManagerKind::Apt => vec![
                CommandSpec::new("apt-get")
                    .arg("update")
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .timeout(timeout),
                CommandSpec::new("apt-get")
                    .args(["install", "-y", "--no-install-recommends"])
                    .args(names)
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .timeout(timeout),
            ],
            PackageManagerKind::Dnf | PackageManagerKind::Yum => vec![CommandSpec::new(self.program())
                .args(["install", "-y"])
                .args(names)
                .timeout(timeout)],
            PackageManagerKind::Zypper => vec![CommandSpec::new("zypper")
                .args(["--non-interactive", "install"])
                .args(names)
                .timeout(timeout)],
        }
    }
}

impl fmt::Display for PackageManagerKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.program())
    }
}

/// Install `packages` with `manager`, or with the detected manager
pub async fn install(
    runner: &dyn CommandRunner,
    manager: Option<PackageManagerKind>,
    packages: &[String],
) -> Result<()> {
    if packages.is_empty() {
        info!("No packages requested");
        return Ok(());
    }

    let manager = manager
        .or_else(PackageManagerKind::detect)
        .ok_or_else(|| InstallError::DependencyInstallError {
            manager: "auto".to_string(),
            message: "no supported package manager (apt-get, dnf, yum, zypper) found on PATH"
                .to_string(),
        })?;

    info!(manager = %manager, packages = ?packages, "Installing packages");

    for spec in manager.install_commands(packages) {
        let output = runner.run(&spec).await.map_err(|e| InstallError::DependencyInstallError {
            manager: manager.to_string(),
            message: e.to_string(),
        })?;

        if !output.success {
            warn!(command = %spec, "Package manager step failed");
            return Err(InstallError::DependencyInstallError {
                manager: manager.to_string(),
                message: format!("'{}' {}", spec, output.failure_summary()),
            });
        }
    }

    Ok(())
}
