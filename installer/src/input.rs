// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validation of operator-supplied values
//!
//! Everything typed by the operator (CLI flags, prompts, environment) arrives
//! as text and goes through these parsers before it can reach a file.

use crate::error::{InstallError, Result};
use crate::secret::SharedSecret;

/// Upper bound for worker thread counts
pub const MAX_THREADS: u32 = 1024;

/// Parse a UDP port number
///
/// Rejects `0`, negative values, values above 65535 and anything that is not
/// a base-10 integer.
pub fn parse_port(field: &str, raw: &str) -> Result<u16> {
    let trimmed = raw.trim();
    let value: i64 = trimmed.parse().map_err(|_| {
        InstallError::invalid_input(field, format!("'{}' is not an integer", trimmed))
    })?;

    if value <= 0 {
        return Err(InstallError::invalid_input(
            field,
            format!("port must be positive, got {}", value),
        ));
    }

    u16::try_from(value).map_err(|_| {
        InstallError::invalid_input(field, format!("port {} is above 65535", value))
    })
}

/// Parse a worker thread count in `1..=MAX_THREADS`
pub fn parse_thread_count(field: &str, raw: &str) -> Result<u32> {
    let trimmed = raw.trim();
    let value: i64 = trimmed.parse().map_err(|_| {
        InstallError::invalid_input(field, format!("'{}' is not an integer", trimmed))
    })?;

    if value < 1 || value > i64::from(MAX_THREADS) {
        return Err(InstallError::invalid_input(
            field,
            format!("thread count must be between 1 and {}, got {}", MAX_THREADS, value),
        ));
    }

    Ok(value as u32)
}

/// Validate an authentication/accounting port pair
pub fn check_port_pair(auth_port: u16, account_port: u16) -> Result<()> {
    for (field, port) in [("authPort", auth_port), ("accountPort", account_port)] {
        if port == 0 {
            return Err(InstallError::invalid_input(field, "port must be positive, got 0"));
        }
    }
    if auth_port == account_port {
        return Err(InstallError::invalid_input(
            "accountPort",
            format!("must differ from authPort ({})", auth_port),
        ));
    }
    Ok(())
}

/// Read a secret interactively, prompting again on invalid input
pub fn prompt_secret(attempts: usize) -> Result<SharedSecret> {
    let mut last_error = None;

    for _ in 0..attempts.max(1) {
        let first = rpassword::prompt_password("RADIUS shared secret: ")?;
        let secret = match SharedSecret::new(first) {
            Ok(secret) => secret,
            Err(error) => {
                eprintln!("{}", error);
                last_error = Some(error);
                continue;
            }
        };

        let confirm = rpassword::prompt_password("Repeat shared secret: ")?;
        if confirm == secret.expose() {
            return Ok(secret);
        }

        let error = InstallError::invalid_input("sharedSecret", "entries do not match");
        eprintln!("{}", error);
        last_error = Some(error);
    }

    Err(last_error
        .unwrap_or_else(|| InstallError::invalid_input("sharedSecret", "no secret entered")))
}
