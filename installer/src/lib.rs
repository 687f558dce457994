// SPDX-License-Identifier: AGPL-3.0-or-later
//! keycloak-radius-installer: installs and reconciles the Keycloak RADIUS plugin
//!
//! Fetches the plugin (release download, source build or local file), places
//! it in Keycloak's providers directory, merges the plugin's JSON
//! configuration and restarts the service, in that order and idempotently.
//!
//! # Features
//!
//! * **Artifact Selection:** Anchored, case-sensitive name patterns; sources,
//!   javadoc and test jars are never installed
//! * **Atomic Placement:** Stage-then-rename with rollback on later failure
//! * **Structural Config Merge:** Only managed keys are touched; hand edits survive
//! * **Advisory Locking:** One reconciliation per host at a time

pub mod archive;
pub mod artifact;
pub mod command;
pub mod config;
pub mod error;
pub mod host;
pub mod input;
pub mod lock;
pub mod packages;
pub mod plugin_config;
pub mod providers;
pub mod reconcile;
pub mod release;
pub mod secret;
pub mod source_build;
pub mod verify;

pub use config::InstallerConfig;
pub use error::{InstallError, Phase, Result};
pub use reconcile::{ArtifactSource, ReconcileReport, Reconciler, RunOptions};
