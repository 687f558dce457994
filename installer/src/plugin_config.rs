// SPDX-License-Identifier: AGPL-3.0-or-later
//! RADIUS plugin configuration file
//!
//! The plugin reads a single JSON document. A fresh install writes the full
//! default document; later runs only touch the managed keys and merge them
//! structurally into whatever the operator has in place, so hand edits to
//! RadSec or CoA settings survive a secret rotation.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{InstallError, Result};
use crate::secret::SharedSecret;

/// Keys owned by the installer; every other key belongs to the operator
pub const MANAGED_KEYS: [&str; 4] = [
    "sharedSecret",
    "authPort",
    "accountPort",
    "externalDictionary",
];

/// Full plugin configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RadiusPluginConfig {
    /// Secret shared with every RADIUS client
    pub shared_secret: String,

    /// Authentication listener port
    #[serde(default = "default_auth_port")]
    pub auth_port: u16,

    /// Accounting listener port
    #[serde(default = "default_account_port")]
    pub account_port: u16,

    /// Plugin worker pool size
    #[serde(default = "default_threads")]
    pub number_threads: u32,

    /// Serve plain RADIUS over UDP
    #[serde(default = "default_true")]
    pub use_udp_radius: bool,

    /// Optional FreeRADIUS dictionary file
    #[serde(default)]
    pub external_dictionary: Option<String>,

    /// Client identifiers allowed to authenticate with an OTP only
    #[serde(default)]
    pub otp_without_password: Vec<String>,

    /// RADIUS over TLS
    #[serde(default)]
    pub radsec: RadSecConfig,

    /// Change-of-Authorization listener
    #[serde(default)]
    pub coa: CoaConfig,
}

/// RadSec (RADIUS over TLS) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadSecConfig {
    #[serde(rename = "useRadSec", default)]
    pub use_rad_sec: bool,

    #[serde(rename = "privateKey", default = "default_private_key")]
    pub private_key: String,

    #[serde(default = "default_certificate")]
    pub certificate: String,

    #[serde(rename = "numberThreads", default = "default_threads")]
    pub number_threads: u32,
}

/// Change-of-Authorization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoaConfig {
    #[serde(rename = "useCoA", default)]
    pub use_coa: bool,

    #[serde(default = "default_coa_port")]
    pub port: u16,
}

impl Default for RadSecConfig {
    fn default() -> Self {
        Self {
            use_rad_sec: false,
            private_key: default_private_key(),
            certificate: default_certificate(),
            number_threads: default_threads(),
        }
    }
}

impl Default for CoaConfig {
    fn default() -> Self {
        Self {
            use_coa: false,
            port: default_coa_port(),
        }
    }
}

impl RadiusPluginConfig {
    /// Default document carrying the given secret
    pub fn with_secret(shared_secret: impl Into<String>) -> Self {
        Self {
            shared_secret: shared_secret.into(),
            auth_port: default_auth_port(),
            account_port: default_account_port(),
            number_threads: default_threads(),
            use_udp_radius: true,
            external_dictionary: None,
            otp_without_password: Vec::new(),
            radsec: RadSecConfig::default(),
            coa: CoaConfig::default(),
        }
    }

    /// Load and type-check a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| InstallError::fs(path, e))?;
        serde_json::from_str(&contents).map_err(|e| InstallError::PluginConfigError {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// Desired state of the managed keys
#[derive(Debug, Clone)]
pub struct DesiredConfig {
    /// Secret to install; `None` keeps the existing one or generates a new one
    pub shared_secret: Option<SharedSecret>,
    pub auth_port: u16,
    pub account_port: u16,
    /// `None` leaves the existing value alone
    pub external_dictionary: Option<String>,
    /// Only used when the file is created
    pub number_threads: Option<u32>,
}

impl Default for DesiredConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            auth_port: default_auth_port(),
            account_port: default_account_port(),
            external_dictionary: None,
            number_threads: None,
        }
    }
}

/// Where the secret in a planned document came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretOrigin {
    /// Supplied by the operator
    Supplied,
    /// Kept from the existing file
    Existing,
    /// Freshly generated
    Generated,
}

/// What applying a plan will do to the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    Create,
    Update,
    Unchanged,
}

/// A computed configuration document, not yet written
#[derive(Debug, Clone)]
pub struct ConfigPlan {
    pub document: Value,
    pub rendered: String,
    pub change: ConfigChange,
    pub secret_origin: SecretOrigin,
}

/// Compute the document that should be at `path`
pub fn plan(path: &Path, desired: &DesiredConfig) -> Result<ConfigPlan> {
    let existing = read_existing(path)?;
    let existing_rendered = existing.as_ref().map(|(_, raw)| raw.clone());

    let (mut document, created) = match existing {
        Some((document, _)) => (document, false),
        None => {
            let mut fresh = RadiusPluginConfig::with_secret(String::new());
            if let Some(threads) = desired.number_threads {
                fresh.number_threads = threads;
            }
            (serde_json::to_value(fresh)?, true)
        }
    };

    let object = document
        .as_object_mut()
        .ok_or_else(|| InstallError::PluginConfigError {
            path: path.display().to_string(),
            message: "top-level value is not a JSON object".to_string(),
        })?;

    let (secret, secret_origin) = match (&desired.shared_secret, existing_secret(object)) {
        (Some(secret), _) => (secret.clone(), SecretOrigin::Supplied),
        (None, Some(current)) => (SharedSecret::new(current)?, SecretOrigin::Existing),
        (None, None) => (SharedSecret::generate(), SecretOrigin::Generated),
    };

    merge_managed(object, desired, &secret);

    let rendered = render(&document)?;
    let change = if created {
        ConfigChange::Create
    } else if existing_rendered.as_deref() == Some(rendered.as_str()) {
        ConfigChange::Unchanged
    } else {
        ConfigChange::Update
    };

    Ok(ConfigPlan {
        document,
        rendered,
        change,
        secret_origin,
    })
}

/// Overwrite the managed keys of `object`, leaving all other keys untouched
pub fn merge_managed(object: &mut Map<String, Value>, desired: &DesiredConfig, secret: &SharedSecret) {
    object.insert(
        "sharedSecret".to_string(),
        Value::String(secret.expose().to_string()),
    );
    object.insert("authPort".to_string(), Value::from(desired.auth_port));
    object.insert("accountPort".to_string(), Value::from(desired.account_port));

    match &desired.external_dictionary {
        Some(dictionary) => {
            object.insert(
                "externalDictionary".to_string(),
                Value::String(dictionary.clone()),
            );
        }
        None => {
            object
                .entry("externalDictionary".to_string())
                .or_insert(Value::Null);
        }
    }
}

/// Write a plan to disk atomically with owner-only permissions
pub fn apply(path: &Path, plan: &ConfigPlan) -> Result<()> {
    if plan.change == ConfigChange::Unchanged {
        debug!(path = %path.display(), "Plugin configuration already up to date");
        return restrict_permissions(path);
    }

    write_atomic(path, plan.rendered.as_bytes())?;
    info!(path = %path.display(), change = ?plan.change, "Wrote plugin configuration");
    Ok(())
}

/// Restrict `path` to owner read/write
pub fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| InstallError::fs(path, e))?;
    }
    Ok(())
}

/// Write `contents` through a temp file in the same directory, then rename
///
/// The temp file is created with mode 0600 before any byte is written, so the
/// secret is never readable by other users, even transiently.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| InstallError::fs(parent, e))?;

    let mut staged = tempfile::Builder::new()
        .prefix(".radius-config-")
        .tempfile_in(parent)
        .map_err(|e| InstallError::fs(parent, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|e| InstallError::fs(staged.path(), e))?;
    }

    staged
        .write_all(contents)
        .and_then(|_| staged.as_file().sync_all())
        .map_err(|e| InstallError::fs(staged.path(), e))?;

    staged
        .persist(path)
        .map_err(|e| InstallError::fs(path, e.error))?;
    Ok(())
}

fn read_existing(path: &Path) -> Result<Option<(Value, String)>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = std::fs::read_to_string(path).map_err(|e| InstallError::fs(path, e))?;
    let document = serde_json::from_str(&raw).map_err(|e| InstallError::PluginConfigError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(Some((document, raw)))
}

/// Ports currently configured in `path`, if the file has valid ones
///
/// Used so that a run without explicit ports keeps the operator's choice.
pub fn existing_ports(path: &Path) -> Option<(u16, u16)> {
    let (document, _) = read_existing(path).ok()??;
    let port = |key: &str| {
        document
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|value| u16::try_from(value).ok())
            .filter(|value| *value != 0)
    };
    Some((port("authPort")?, port("accountPort")?))
}

fn existing_secret(object: &Map<String, Value>) -> Option<String> {
    object
        .get("sharedSecret")
        .and_then(Value::as_str)
        .filter(|secret| !secret.is_empty())
        .map(str::to_string)
}

fn render(document: &Value) -> Result<String> {
    let mut rendered = serde_json::to_string_pretty(document)?;
    rendered.push('\n');
    Ok(rendered)
}

// Default value functions

fn default_auth_port() -> u16 {
    1812
}

fn default_account_port() -> u16 {
    1813
}

fn default_threads() -> u32 {
    8
}

fn default_true() -> bool {
    true
}

fn default_coa_port() -> u16 {
    3799
}

fn default_private_key() -> String {
    "config/private.key".to_string()
}

fn default_certificate() -> String {
    "config/public.crt".to_string()
}
