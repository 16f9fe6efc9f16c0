/*
 * sasl.rs
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

//! Server side of SASL PLAIN (RFC 4616) and the de-facto LOGIN mechanism,
//! shared by the SMTP and POP3 engines.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Base64 of `Username:` — the first LOGIN challenge.
pub const LOGIN_USERNAME_CHALLENGE: &str = "VXNlcm5hbWU6";
/// Base64 of `Password:` — the second LOGIN challenge.
pub const LOGIN_PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQ6";

#[derive(Debug, thiserror::Error)]
pub enum SaslError {
    #[error("invalid base64")]
    Base64,
    #[error("response is not UTF-8")]
    Utf8,
    #[error("malformed PLAIN response")]
    Plain,
    #[error("authentication exchange cancelled")]
    Cancelled,
}

/// Credentials carried by one PLAIN response.
#[derive(Debug, PartialEq, Eq)]
pub struct PlainCredentials {
    pub authzid: String,
    pub authcid: String,
    pub password: String,
}

/// Decode a base64 PLAIN response: `[authzid] NUL authcid NUL password`.
pub fn decode_plain(encoded: &str) -> Result<PlainCredentials, SaslError> {
    let raw = decode_line(encoded)?;
    let bytes = raw.into_bytes();
    let mut parts = bytes.split(|&b| b == 0);
    let authzid = parts.next().ok_or(SaslError::Plain)?;
    let authcid = parts.next().ok_or(SaslError::Plain)?;
    let password = parts.next().ok_or(SaslError::Plain)?;
    if parts.next().is_some() || authcid.is_empty() {
        return Err(SaslError::Plain);
    }
    Ok(PlainCredentials {
        authzid: String::from_utf8(authzid.to_vec()).map_err(|_| SaslError::Utf8)?,
        authcid: String::from_utf8(authcid.to_vec()).map_err(|_| SaslError::Utf8)?,
        password: String::from_utf8(password.to_vec()).map_err(|_| SaslError::Utf8)?,
    })
}

/// Decode one base64 client line. A lone `*` cancels the exchange (RFC 4954
/// and RFC 5034 both use it).
pub fn decode_line(encoded: &str) -> Result<String, SaslError> {
    let encoded = encoded.trim();
    if encoded == "*" {
        return Err(SaslError::Cancelled);
    }
    let raw = BASE64.decode(encoded).map_err(|_| SaslError::Base64)?;
    String::from_utf8(raw).map_err(|_| SaslError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_rfc4616_vector() {
        // RFC 4616 §4: authzid "", authcid "tim", password "tanstaaftanstaaf".
        let creds = decode_plain("AHRpbQB0YW5zdGFhZnRhbnN0YWFm").unwrap();
        assert_eq!(creds.authzid, "");
        assert_eq!(creds.authcid, "tim");
        assert_eq!(creds.password, "tanstaaftanstaaf");
    }

    #[test]
    fn plain_with_authzid() {
        let encoded = BASE64.encode(b"admin\0user@example.com\0hunter2");
        let creds = decode_plain(&encoded).unwrap();
        assert_eq!(creds.authzid, "admin");
        assert_eq!(creds.authcid, "user@example.com");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn plain_rejects_missing_separator() {
        let encoded = BASE64.encode(b"no separators here");
        assert!(matches!(decode_plain(&encoded), Err(SaslError::Plain)));
    }

    #[test]
    fn plain_rejects_empty_authcid() {
        let encoded = BASE64.encode(b"\0\0password");
        assert!(matches!(decode_plain(&encoded), Err(SaslError::Plain)));
    }

    #[test]
    fn cancel_marker() {
        assert!(matches!(decode_line("*"), Err(SaslError::Cancelled)));
    }

    #[test]
    fn login_challenges_decode_to_prompts() {
        assert_eq!(decode_line(LOGIN_USERNAME_CHALLENGE).unwrap(), "Username:");
        assert_eq!(decode_line(LOGIN_PASSWORD_CHALLENGE).unwrap(), "Password:");
    }

    #[test]
    fn bad_base64_is_rejected() {
        assert!(matches!(decode_line("!!!"), Err(SaslError::Base64)));
    }
}
