// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host service control
//!
//! The Keycloak service is driven through `kc.sh build`, `systemctl` and
//! `journalctl`. Preflight checks for privilege and for an existing
//! installation live here too, since both concern the host rather than the
//! plugin.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::config::InstallerConfig;
use crate::error::{InstallError, Result};

/// State reported by the service manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Active,
    /// Any other state, as reported (`inactive`, `failed`, `activating`...)
    NotActive(String),
}

impl ServiceStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ServiceStatus::Active)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Active => formatter.write_str("active"),
            ServiceStatus::NotActive(state) => formatter.write_str(state),
        }
    }
}

/// Control interface of the service hosting the plugin
#[async_trait]
pub trait ServiceHost: Send + Sync {
    /// Recompile the service so it picks up new providers
    async fn build(&self) -> Result<()>;

    /// Restart the service
    async fn restart(&self) -> Result<()>;

    /// Current service state
    async fn status(&self) -> Result<ServiceStatus>;

    /// Up to `lines` recent log lines containing `filter`, case-insensitively
    async fn recent_logs(&self, filter: &str, lines: u32) -> Result<Vec<String>>;
}

/// Keycloak managed by systemd
pub struct SystemdKeycloak<'a> {
    runner: &'a dyn CommandRunner,
    kc_script: PathBuf,
    unit: String,
    build_timeout: Duration,
    restart_timeout: Duration,
}

impl<'a> SystemdKeycloak<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &InstallerConfig) -> Self {
        Self {
            runner,
            kc_script: config.kc_script(),
            unit: config.service.name.clone(),
            build_timeout: Duration::from_secs(config.service.build_timeout_secs),
            restart_timeout: Duration::from_secs(config.service.restart_timeout_secs),
        }
    }

    async fn run_step(&self, step: &str, spec: CommandSpec) -> Result<String> {
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| InstallError::ServiceConvergenceError {
                step: step.to_string(),
                message: e.to_string(),
            })?;

        if !output.success {
            return Err(InstallError::ServiceConvergenceError {
                step: step.to_string(),
                message: format!("'{}' {}", spec, output.failure_summary()),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ServiceHost for SystemdKeycloak<'_> {
    async fn build(&self) -> Result<()> {
        info!(script = %self.kc_script.display(), "Rebuilding Keycloak");
        let spec = CommandSpec::new(self.kc_script.display().to_string())
            .arg("build")
            .timeout(self.build_timeout);
        self.run_step("build", spec).await.map(|_| ())
    }

    async fn restart(&self) -> Result<()> {
        info!(unit = %self.unit, "Restarting service");
        let spec = CommandSpec::new("systemctl")
            .arg("restart")
            .arg(self.unit.as_str())
            .timeout(self.restart_timeout);
        self.run_step("restart", spec).await.map(|_| ())
    }

    async fn status(&self) -> Result<ServiceStatus> {
        let spec = CommandSpec::new("systemctl")
            .arg("is-active")
            .arg(self.unit.as_str());
        // is-active exits non-zero for every state but "active"
        let output = self.runner.run(&spec).await?;
        let state = output.stdout.trim();

        if output.success && (state == "active" || self.runner.is_dry_run()) {
            Ok(ServiceStatus::Active)
        } else if state.is_empty() {
            Ok(ServiceStatus::NotActive("unknown".to_string()))
        } else {
            Ok(ServiceStatus::NotActive(state.to_string()))
        }
    }

    async fn recent_logs(&self, filter: &str, lines: u32) -> Result<Vec<String>> {
        let spec = CommandSpec::new("journalctl")
            .args(["-u", self.unit.as_str(), "-n"])
            .arg(lines.to_string())
            .args(["--no-pager", "-o", "cat"]);
        let output = self.runner.run(&spec).await?;
        if !output.success {
            return Err(InstallError::CommandFailed {
                command: spec.to_string(),
                message: output.failure_summary(),
            });
        }
        Ok(filter_lines(&output.stdout, filter))
    }
}

/// Lines of `text` containing `filter`, ignoring case
pub fn filter_lines(text: &str, filter: &str) -> Vec<String> {
    let needle = filter.to_lowercase();
    text.lines()
        .filter(|line| needle.is_empty() || line.to_lowercase().contains(&needle))
        .map(str::to_string)
        .collect()
}

/// Fail unless running as root
pub fn ensure_privileged() -> Result<()> {
    if effective_uid() == 0 {
        return Ok(());
    }
    Err(InstallError::PrivilegeError {
        message: "writing the providers directory and restarting services requires root; re-run with sudo"
            .to_string(),
    })
}

#[cfg(unix)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
fn effective_uid() -> u32 {
    0
}

/// Fail unless a Keycloak distribution exists at the configured home
pub fn ensure_host_installation(config: &InstallerConfig) -> Result<()> {
    let script = config.kc_script();
    debug!(script = %script.display(), "Checking Keycloak installation");

    if is_executable(&script) {
        return Ok(());
    }

    warn!(home = %config.keycloak_home.display(), "Keycloak not found");
    Err(InstallError::MissingHostInstallation {
        path: config.keycloak_home.display().to_string(),
    })
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::command::CommandOutput;
    use std::fs;
    use tempfile::tempdir;

    fn config_at(home: &Path) -> InstallerConfig {
        InstallerConfig {
            keycloak_home: home.to_path_buf(),
            ..InstallerConfig::default()
        }
    }

    #[test]
    fn test_filter_lines() {
        let logs = "Started Keycloak\nRADIUS server listening on 1812\nradius accounting on 1813\n";
        assert_eq!(
            filter_lines(logs, "radius"),
            vec![
                "RADIUS server listening on 1812",
                "radius accounting on 1813"
            ]
        );
        assert_eq!(filter_lines(logs, "").len(), 3);
    }

    #[test]
    fn test_missing_installation() {
        let temp_dir = tempdir().unwrap();
        let error = ensure_host_installation(&config_at(temp_dir.path())).unwrap_err();
        assert!(matches!(error, InstallError::MissingHostInstallation { .. }));
        assert!(error.to_string().contains(&temp_dir.path().display().to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_present_installation() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempdir().unwrap();
        let bin = temp_dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("kc.sh"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(bin.join("kc.sh"), fs::Permissions::from_mode(0o755)).unwrap();

        ensure_host_installation(&config_at(temp_dir.path())).unwrap();
    }

    #[tokio::test]
    async fn test_build_and_restart_commands() {
        let runner = ScriptedRunner::new();
        let config = config_at(Path::new("/opt/keycloak"));
        let host = SystemdKeycloak::new(&runner, &config);

        host.build().await.unwrap();
        host.restart().await.unwrap();

        assert_eq!(
            runner.command_lines(),
            vec!["/opt/keycloak/bin/kc.sh build", "systemctl restart keycloak"]
        );
    }

    #[tokio::test]
    async fn test_restart_failure_is_convergence_error() {
        let runner = ScriptedRunner::new().respond(|spec| {
            (spec.program == "systemctl")
                .then(|| CommandOutput::failed(1, "Job for keycloak.service failed"))
        });
        let config = InstallerConfig::default();
        let host = SystemdKeycloak::new(&runner, &config);

        match host.restart().await.unwrap_err() {
            InstallError::ServiceConvergenceError { step, message } => {
                assert_eq!(step, "restart");
                assert!(message.contains("keycloak.service failed"));
            }
            other => panic!("Expected ServiceConvergenceError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status() {
        let runner = ScriptedRunner::new().respond(|_| {
            Some(CommandOutput {
                success: false,
                code: Some(3),
                stdout: "failed\n".to_string(),
                ..Default::default()
            })
        });
        let config = InstallerConfig::default();
        let host = SystemdKeycloak::new(&runner, &config);
        assert_eq!(
            host.status().await.unwrap(),
            ServiceStatus::NotActive("failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_recent_logs_filters() {
        let runner = ScriptedRunner::new().respond(|_| {
            Some(CommandOutput::ok("boot\nRadius listener bound\nother\n"))
        });
        let config = InstallerConfig::default();
        let host = SystemdKeycloak::new(&runner, &config);

        let lines = host.recent_logs("radius", 50).await.unwrap();
        assert_eq!(lines, vec!["Radius listener bound"]);
        assert_eq!(
            runner.command_lines(),
            vec!["journalctl -u keycloak -n 50 --no-pager -o cat"]
        );
    }
}
