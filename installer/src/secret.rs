// SPDX-License-Identifier: AGPL-3.0-or-later
//! RADIUS shared secret handling
//!
//! The secret is kept behind [`secrecy::Secret`] so it never ends up in
//! `Debug` output or tracing fields by accident.

use std::fmt;

use base64::Engine;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};

use crate::error::{InstallError, Result};

/// Number of random bytes behind a generated secret (32 base64 characters)
pub const GENERATED_SECRET_BYTES: usize = 24;

/// A validated RADIUS shared secret
pub struct SharedSecret(Secret<String>);

impl SharedSecret {
    /// Validate and wrap an operator-supplied secret
    ///
    /// The secret must be non-empty and free of control characters, so it
    /// survives being embedded in JSON and typed into a client's admin UI.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();

        if value.is_empty() {
            return Err(InstallError::invalid_input(
                "sharedSecret",
                "secret cannot be empty",
            ));
        }

        if value.chars().any(char::is_control) {
            return Err(InstallError::invalid_input(
                "sharedSecret",
                "secret contains control characters",
            ));
        }

        Ok(Self(Secret::new(value)))
    }

    /// Generate a fresh secret from the thread-local CSPRNG
    ///
    /// Standard base64 only produces `[A-Za-z0-9+/=]`, all of which are
    /// JSON-safe without escaping.
    pub fn generate() -> Self {
        let mut bytes = [0u8; GENERATED_SECRET_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self(Secret::new(encoded))
    }

    /// Access the plaintext value
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for SharedSecret {
    fn clone(&self) -> Self {
        Self(Secret::new(self.expose().to_string()))
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("SharedSecret(***)")
    }
}
