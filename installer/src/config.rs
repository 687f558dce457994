// SPDX-License-Identifier: AGPL-3.0-or-later
//! Installer configuration
//!
//! Values come from three layers, later ones winning: the TOML file, a small
//! set of environment variables, and CLI flags (applied by the binary). The
//! result is handed to the reconciler once and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::{AssetPattern, SelectionRules};
use crate::error::{InstallError, Result};
use crate::packages::PackageManagerKind;

/// Overrides the Keycloak installation root
pub const ENV_KEYCLOAK_HOME: &str = "KEYCLOAK_HOME";
/// Pins a release tag instead of resolving the latest one
pub const ENV_PLUGIN_TAG: &str = "RADIUS_PLUGIN_TAG";
/// Overrides the plugin configuration file location
pub const ENV_CONFIG_PATH: &str = "RADIUS_CONFIG_PATH";

/// Main configuration structure for the installer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Keycloak installation root
    #[serde(default = "default_keycloak_home")]
    pub keycloak_home: PathBuf,

    /// Providers directory; `<keycloak_home>/providers` when unset
    #[serde(default)]
    pub providers_dir: Option<PathBuf>,

    /// Plugin configuration file
    #[serde(default = "default_plugin_config_path")]
    pub plugin_config_path: PathBuf,

    /// Advisory lock file guarding concurrent runs
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// Revert artifact placement when a later phase fails
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,

    /// Where the plugin comes from
    #[serde(default)]
    pub source: SourceConfig,

    /// Which artifacts to install
    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// OS packages
    #[serde(default)]
    pub packages: PackageConfig,

    /// Host service control
    #[serde(default)]
    pub service: ServiceConfig,

    /// Network fetch behaviour
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Kind of artifact source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Published release assets
    Release,
    /// Build from a git checkout
    Git,
    /// A jar or zip already on disk
    Local,
}

/// Artifact source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,

    /// `owner/name` of the release repository
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Release tag; latest when unset
    #[serde(default)]
    pub tag: Option<String>,

    /// Release API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Git clone URL for source builds
    #[serde(default = "default_git_url")]
    pub git_url: String,

    /// Branch, tag or commit to build
    #[serde(default)]
    pub git_ref: Option<String>,

    /// Where the source checkout lives between runs
    #[serde(default = "default_checkout_dir")]
    pub checkout_dir: PathBuf,

    /// Build command run inside the checkout
    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Build timeout in seconds
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Jar or zip for the `local` source kind
    #[serde(default)]
    pub local_artifact: Option<PathBuf>,
}

/// Artifact selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// File name pattern of the RADIUS plugin jar
    #[serde(default = "default_primary_pattern")]
    pub primary_pattern: String,

    /// File name pattern of the companion plugin jar
    #[serde(default = "default_secondary_pattern")]
    pub secondary_pattern: String,

    /// Install the companion plugin as well; fail if it cannot be found
    #[serde(default)]
    pub install_secondary: bool,
}

/// OS package configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Package manager; detected from `PATH` when unset
    #[serde(default)]
    pub manager: Option<PackageManagerKind>,

    /// Packages to install
    #[serde(default = "default_packages")]
    pub names: Vec<String>,
}

/// Host service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// systemd unit name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Timeout for `kc.sh build` in seconds
    #[serde(default = "default_service_build_timeout")]
    pub build_timeout_secs: u64,

    /// Timeout for the restart in seconds
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout_secs: u64,

    /// How long to keep probing for listeners after a restart
    #[serde(default = "default_listener_grace")]
    pub listener_grace_secs: u64,

    /// Number of journal lines to inspect
    #[serde(default = "default_log_lines")]
    pub log_lines: u32,
}

/// Fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Attempts after the first failure
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Initial backoff in milliseconds, doubled per attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path (optional)
    pub file: Option<PathBuf>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            keycloak_home: default_keycloak_home(),
            providers_dir: None,
            plugin_config_path: default_plugin_config_path(),
            lock_path: default_lock_path(),
            rollback_on_failure: true,
            source: SourceConfig::default(),
            artifacts: ArtifactConfig::default(),
            packages: PackageConfig::default(),
            service: ServiceConfig::default(),
            fetch: FetchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            repository: default_repository(),
            tag: None,
            api_base: default_api_base(),
            git_url: default_git_url(),
            git_ref: None,
            checkout_dir: default_checkout_dir(),
            build_command: default_build_command(),
            build_timeout_secs: default_build_timeout(),
            local_artifact: None,
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            primary_pattern: default_primary_pattern(),
            secondary_pattern: default_secondary_pattern(),
            install_secondary: false,
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            manager: None,
            names: default_packages(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            build_timeout_secs: default_service_build_timeout(),
            restart_timeout_secs: default_restart_timeout(),
            listener_grace_secs: default_listener_grace(),
            log_lines: default_log_lines(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            timeout_secs: default_fetch_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl InstallerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The parsed configuration or an error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(InstallError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path).map_err(|e| InstallError::fs(path, e))?;
        let config: InstallerConfig = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides using `lookup` to read variables
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(home) = non_empty(ENV_KEYCLOAK_HOME) {
            self.keycloak_home = PathBuf::from(home);
        }
        if let Some(tag) = non_empty(ENV_PLUGIN_TAG) {
            self.source.tag = Some(tag);
        }
        if let Some(path) = non_empty(ENV_CONFIG_PATH) {
            self.plugin_config_path = PathBuf::from(path);
        }
        self
    }

    /// Apply overrides from the process environment
    pub fn with_process_env(self) -> Self {
        self.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.keycloak_home.as_os_str().is_empty() {
            return Err(InstallError::InvalidConfig {
                message: "keycloak_home cannot be empty".to_string(),
            });
        }

        if self.plugin_config_path.as_os_str().is_empty() {
            return Err(InstallError::InvalidConfig {
                message: "plugin_config_path cannot be empty".to_string(),
            });
        }

        if self.source.kind == SourceKind::Release {
            let mut parts = self.source.repository.split('/');
            let valid = matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
            );
            if !valid {
                return Err(InstallError::InvalidConfig {
                    message: format!(
                        "source.repository must be 'owner/name', got '{}'",
                        self.source.repository
                    ),
                });
            }
        }

        if self.source.kind == SourceKind::Git && self.source.build_command.trim().is_empty() {
            return Err(InstallError::InvalidConfig {
                message: "source.build_command cannot be empty for git sources".to_string(),
            });
        }

        if self.fetch.retries > 10 {
            return Err(InstallError::InvalidConfig {
                message: format!("fetch.retries must be at most 10, got {}", self.fetch.retries),
            });
        }

        self.artifacts.rules()?;
        Ok(())
    }

    /// Effective providers directory
    pub fn providers_dir(&self) -> PathBuf {
        self.providers_dir
            .clone()
            .unwrap_or_else(|| self.keycloak_home.join("providers"))
    }

    /// Path of the Keycloak launcher script
    pub fn kc_script(&self) -> PathBuf {
        self.keycloak_home.join("bin").join("kc.sh")
    }
}

impl ArtifactConfig {
    /// Compile the configured patterns
    pub fn rules(&self) -> Result<SelectionRules> {
        let primary = AssetPattern::new(&self.primary_pattern)?;
        let secondary = if self.install_secondary {
            Some(AssetPattern::new(&self.secondary_pattern)?)
        } else {
            None
        };
        Ok(SelectionRules { primary, secondary })
    }
}

impl FetchConfig {
    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Initial backoff
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

// Default value functions

fn default_keycloak_home() -> PathBuf {
    PathBuf::from("/opt/keycloak")
}

fn default_plugin_config_path() -> PathBuf {
    PathBuf::from("/config/radius.config")
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("/run/kc-radius/install.lock")
}

fn default_true() -> bool {
    true
}

fn default_source_kind() -> SourceKind {
    SourceKind::Release
}

fn default_repository() -> String {
    "vzakharchenko/keycloak-radius-plugin".to_string()
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_git_url() -> String {
    "https://github.com/vzakharchenko/keycloak-radius-plugin.git".to_string()
}

fn default_checkout_dir() -> PathBuf {
    PathBuf::from("/var/cache/kc-radius/src")
}

fn default_build_command() -> String {
    "mvn -B -q -DskipTests package".to_string()
}

fn default_build_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_primary_pattern() -> String {
    r"^radius-plugin-.*\.jar$".to_string()
}

fn default_secondary_pattern() -> String {
    r"^rad-sec-plugin-.*\.jar$".to_string()
}

fn default_packages() -> Vec<String> {
    ["curl", "unzip", "git", "maven", "iproute2"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

fn default_service_name() -> String {
    "keycloak".to_string()
}

fn default_service_build_timeout() -> u64 {
    600 // 10 minutes
}

fn default_restart_timeout() -> u64 {
    120
}

fn default_listener_grace() -> u64 {
    10
}

fn default_log_lines() -> u32 {
    200
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_fetch_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
