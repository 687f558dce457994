// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listener probe
//!
//! After a restart the RADIUS listeners should be bound on their UDP ports.
//! Nothing here is fatal: a missing listener or a missing `ss` binary only
//! yields warnings.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::error::InstallError;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A listener the service is expected to bind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedListener {
    pub name: &'static str,
    pub port: u16,
}

/// Non-fatal verification finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationWarning {
    /// No socket was bound on the port within the grace period
    ListenerMissing { name: &'static str, port: u16 },
    /// The probe could not run at all
    ProbeUnavailable { reason: String },
}

impl fmt::Display for VerificationWarning {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationWarning::ListenerMissing { name, port } => {
                write!(formatter, "{name} listener not bound on UDP port {port}")
            }
            VerificationWarning::ProbeUnavailable { reason } => {
                write!(formatter, "listener probe unavailable: {reason}")
            }
        }
    }
}

/// Outcome of a probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    /// UDP ports seen bound on the last probe
    pub bound: BTreeSet<u16>,
    pub warnings: Vec<VerificationWarning>,
    /// Probe skipped because commands are not executed
    pub skipped: bool,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// The authentication and accounting listeners for the given ports
pub fn radius_listeners(auth_port: u16, account_port: u16) -> [ExpectedListener; 2] {
    [
        ExpectedListener {
            name: "authentication",
            port: auth_port,
        },
        ExpectedListener {
            name: "accounting",
            port: account_port,
        },
    ]
}

/// Local ports of the sockets listed in `ss -lun` output
pub fn parse_listening_ports(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .filter_map(|line| {
            // First address column is the local one
            let local = line.split_whitespace().find(|field| field.contains(':'))?;
            let (_, port) = local.rsplit_once(':')?;
            port.parse::<u16>().ok()
        })
        .collect()
}

/// Probe until every listener is bound or `grace` elapses
pub async fn probe(
    runner: &dyn CommandRunner,
    expected: &[ExpectedListener],
    grace: Duration,
) -> VerificationReport {
    if runner.is_dry_run() {
        info!("Skipping listener probe in dry-run mode");
        return VerificationReport {
            skipped: true,
            ..VerificationReport::default()
        };
    }

    let spec = CommandSpec::new("ss").arg("-lun");
    let deadline = Instant::now() + grace;

    loop {
        let bound = match runner.run(&spec).await {
            Ok(output) if output.success => parse_listening_ports(&output.stdout),
            Ok(output) => {
                return unavailable(output.failure_summary());
            }
            Err(InstallError::CommandNotFound { command }) => {
                return unavailable(format!("{command} is not installed"));
            }
            Err(e) => return unavailable(e.to_string()),
        };

        let missing: Vec<ExpectedListener> = expected
            .iter()
            .copied()
            .filter(|listener| !bound.contains(&listener.port))
            .collect();

        if missing.is_empty() {
            info!(ports = ?bound, "All listeners bound");
            return VerificationReport {
                bound,
                ..VerificationReport::default()
            };
        }

        if Instant::now() >= deadline {
            let warnings = missing
                .into_iter()
                .map(|listener| VerificationWarning::ListenerMissing {
                    name: listener.name,
                    port: listener.port,
                })
                .collect::<Vec<_>>();
            for warning in &warnings {
                warn!("{}", warning);
            }
            return VerificationReport {
                bound,
                warnings,
                skipped: false,
            };
        }

        debug!(missing = missing.len(), "Listeners not bound yet");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn unavailable(reason: String) -> VerificationReport {
    let warning = VerificationWarning::ProbeUnavailable { reason };
    warn!("{}", warning);
    VerificationReport {
        warnings: vec![warning],
        ..VerificationReport::default()
    }
}
