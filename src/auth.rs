/*
 * auth.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portalettere, a Microsoft 365 mail gateway.
 *
 * Portalettere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portalettere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portalettere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Allowlist authentication for the protocol engines.
//!
//! Stored hashes are PHC strings (`$pbkdf2-sha256$...`) produced by the
//! external hashing helper; verification is constant-time via the
//! password-hash machinery.

use pbkdf2::password_hash::{PasswordHash, PasswordVerifier};
use pbkdf2::Pbkdf2;
use tracing::warn;

use crate::config::{Config, MailboxConfig};

/// Consecutive AUTH failures tolerated before the connection is closed.
pub const MAX_AUTH_FAILURES: u8 = 3;

/// Verify a client password against a stored PHC hash string.
///
/// A hash that does not parse counts as a failed login rather than an error;
/// the operator sees a warning once per attempt.
pub fn verify_password(stored_hash: &str, password: &str) -> bool {
    let parsed = match PasswordHash::new(stored_hash) {
        Ok(h) => h,
        Err(err) => {
            warn!("unusable password hash in allowlist: {}", err);
            return false;
        }
    };
    Pbkdf2
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Authenticate a username/password pair against the allowlist. Returns the
/// matching mailbox record on success.
pub fn authenticate<'a>(
    config: &'a Config,
    username: &str,
    password: &str,
) -> Option<&'a MailboxConfig> {
    let mailbox = config.find_mailbox(username)?;
    if verify_password(&mailbox.password_hash, password) {
        Some(mailbox)
    } else {
        None
    }
}
