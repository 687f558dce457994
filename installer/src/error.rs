// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the installer

use std::fmt;

use thiserror::Error;

/// Result type alias for installer operations
pub type Result<T> = std::result::Result<T, InstallError>;

/// Reconciliation phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Installer configuration loading and operator input validation
    Setup,
    /// Privilege and host installation checks
    Preflight,
    /// Advisory lock acquisition
    Lock,
    /// OS package installation
    Dependencies,
    /// Source checkout, build, or release listing
    Fetch,
    /// Candidate selection and archive extraction
    Resolve,
    /// Removal of stale classifier variants from the providers directory
    Cleanup,
    /// Artifact placement into the providers directory
    Place,
    /// Plugin configuration merge and permission enforcement
    Configure,
    /// Host rebuild and restart
    Converge,
    /// Listener probe
    Verify,
}

impl Phase {
    /// Short lowercase label used in log fields and error messages
    pub fn label(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Preflight => "preflight",
            Phase::Lock => "lock",
            Phase::Dependencies => "dependencies",
            Phase::Fetch => "fetch",
            Phase::Resolve => "resolve",
            Phase::Cleanup => "cleanup",
            Phase::Place => "place",
            Phase::Configure => "configure",
            Phase::Converge => "converge",
            Phase::Verify => "verify",
        }
    }

    /// Process exit status for a run that failed in this phase (sysexits.h)
    pub fn exit_code(self) -> u8 {
        match self {
            Phase::Setup => 78,
            Phase::Preflight => 77,
            Phase::Lock => 75,
            Phase::Dependencies => 69,
            Phase::Fetch => 74,
            Phase::Resolve => 66,
            Phase::Cleanup | Phase::Place | Phase::Configure => 73,
            Phase::Converge => 70,
            Phase::Verify => 1,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.label())
    }
}

/// Errors that can occur while installing or reconciling the plugin
#[derive(Error, Debug)]
pub enum InstallError {
    /// Not running with enough privilege to modify system paths or services
    #[error("Insufficient privilege: {message}")]
    PrivilegeError { message: String },

    /// The host service installation is missing
    #[error("Keycloak installation not found at {path}")]
    MissingHostInstallation { path: String },

    /// The package manager step failed
    #[error("Package installation via {manager} failed: {message}")]
    DependencyInstallError { manager: String, message: String },

    /// A network or source-control fetch failed
    #[error("Fetch of {url} failed: {message}")]
    FetchError { url: String, message: String },

    /// Neither the build nor the release produced a usable runtime artifact
    #[error("No installable artifact found in {origin}")]
    NoArtifactFound { origin: String },

    /// An operator-supplied value failed validation
    #[error("Invalid value for {field}: {message}")]
    InvalidInput { field: String, message: String },

    /// The host rebuild or restart step failed
    #[error("Service {step} failed: {message}")]
    ServiceConvergenceError { step: String, message: String },

    /// Installer configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid installer configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Existing plugin configuration cannot be merged
    #[error("Cannot merge plugin configuration {path}: {message}")]
    PluginConfigError { path: String, message: String },

    /// An external command exited unsuccessfully
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    /// An external command is not installed
    #[error("Command not found: {command}")]
    CommandNotFound { command: String },

    /// Another installer run holds the lock
    #[error("Another installation is in progress (lock held on {path})")]
    LockHeld { path: String },

    /// The run was interrupted in the given phase
    #[error("Installation cancelled during {phase}")]
    Cancelled { phase: Phase },

    /// Filesystem error on a known path
    #[error("{path}: {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Error raised inside a phase that does not carry its own label
    #[error("{source}")]
    InPhase {
        phase: Phase,
        #[source]
        source: Box<InstallError>,
    },

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl InstallError {
    /// Wrap an IO error with the path it concerns
    pub fn fs(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        InstallError::Filesystem {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Build an [`InstallError::InvalidInput`]
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        InstallError::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The phase this error belongs to, if it is intrinsic to the variant
    pub fn phase(&self) -> Option<Phase> {
        match self {
            InstallError::PrivilegeError { .. } | InstallError::MissingHostInstallation { .. } => {
                Some(Phase::Preflight)
            }
            InstallError::DependencyInstallError { .. } => Some(Phase::Dependencies),
            InstallError::FetchError { .. } => Some(Phase::Fetch),
            InstallError::NoArtifactFound { .. } => Some(Phase::Resolve),
            InstallError::InvalidInput { .. }
            | InstallError::ConfigNotFound { .. }
            | InstallError::InvalidConfig { .. }
            | InstallError::TomlError(_) => Some(Phase::Setup),
            InstallError::PluginConfigError { .. } => Some(Phase::Configure),
            InstallError::ServiceConvergenceError { .. } => Some(Phase::Converge),
            InstallError::LockHeld { .. } => Some(Phase::Lock),
            InstallError::Cancelled { phase } => Some(*phase),
            InstallError::InPhase { phase, .. } => Some(*phase),
            InstallError::CommandFailed { .. }
            | InstallError::CommandNotFound { .. }
            | InstallError::Filesystem { .. }
            | InstallError::IoError(_)
            | InstallError::JsonError(_) => None,
        }
    }

    /// Attach `phase` unless the error already carries one
    pub fn in_phase(self, phase: Phase) -> Self {
        if self.phase().is_some() {
            self
        } else {
            InstallError::InPhase {
                phase,
                source: Box::new(self),
            }
        }
    }

    /// Whether this error is an operator cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InstallError::Cancelled { .. })
    }
}

/// Extension for tagging results with the phase they ran in
pub trait PhaseExt<T> {
    /// Attach `phase` to the error, if any
    fn phase(self, phase: Phase) -> Result<T>;
}

impl<T> PhaseExt<T> for Result<T> {
    fn phase(self, phase: Phase) -> Result<T> {
        self.map_err(|error| error.in_phase(phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsic_phase_is_kept() {
        let error = InstallError::NoArtifactFound {
            origin: "release v1".to_string(),
        }
        .in_phase(Phase::Place);
        assert_eq!(error.phase(), Some(Phase::Resolve));
    }

    #[test]
    fn test_untagged_error_takes_phase() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = InstallError::fs("/opt/keycloak/providers", io).in_phase(Phase::Place);
        assert_eq!(error.phase(), Some(Phase::Place));
        assert!(error.to_string().contains("/opt/keycloak/providers"));
    }

    #[test]
    fn test_phase_exit_codes_are_nonzero() {
        for phase in [
            Phase::Setup,
            Phase::Preflight,
            Phase::Lock,
            Phase::Dependencies,
            Phase::Fetch,
            Phase::Resolve,
            Phase::Cleanup,
            Phase::Place,
            Phase::Configure,
            Phase::Converge,
            Phase::Verify,
        ] {
            assert_ne!(phase.exit_code(), 0, "{phase}");
        }
    }
}
