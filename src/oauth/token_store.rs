/*
 * token_store.rs
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

//! Encrypted at-rest storage for the OAuth2 token bundle.
//!
//! File format: `PLTK1` magic + 24-byte XChaCha20 nonce + ciphertext (AEAD
//! tag included). The key is derived with HKDF-SHA256 from a host-local
//! secret (`/etc/machine-id`, or a random seed persisted beside the token
//! file when no machine id exists) and the upstream user principal, so the
//! blob is useless when copied to another host or another account.
//!
//! A corrupt or undecryptable file is treated as absent; the caller then
//! requires a fresh device-code login.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Duration, Utc};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// Magic header for the encrypted token file (5 bytes).
const MAGIC: &[u8] = b"PLTK1";
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// HKDF salt; versioned with the file magic.
const HKDF_SALT: &[u8] = b"portalettere token store v1";

/// Refresh when the access token has this many seconds of life left or less.
pub const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("token encryption failed")]
    Encrypt,
    #[error("no host secret available for key derivation")]
    NoHostSecret,
}

/// The persisted token bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry of the access token.
    pub expires_at: DateTime<Utc>,
    /// Space-separated granted scopes.
    pub scopes: String,
    /// Account the bundle belongs to (the upstream user principal).
    pub account: String,
}

impl TokenBundle {
    /// True when the access token is within the refresh margin of expiry.
    pub fn needs_refresh(&self) -> bool {
        Utc::now() >= self.expires_at - Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

/// Encrypted persistence of one token bundle, bound to one account.
pub struct TokenStore {
    path: PathBuf,
    key: [u8; KEY_LEN],
}

impl TokenStore {
    /// Open a store for `account` at `path`, deriving the encryption key.
    pub fn open(path: &Path, account: &str) -> Result<Self, TokenStoreError> {
        let secret = host_secret(path)?;
        let mut key = [0u8; KEY_LEN];
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &secret);
        hk.expand(account.as_bytes(), &mut key)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        Ok(Self {
            path: path.to_path_buf(),
            key,
        })
    }

    /// Load the stored bundle. Missing, corrupt, undecryptable, or
    /// mismatched-account files all read as `None`.
    pub fn load(&self) -> Option<TokenBundle> {
        let raw = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("cannot read token file {}: {}", self.path.display(), e);
                return None;
            }
        };
        if raw.len() < MAGIC.len() + NONCE_LEN + 16 || !raw.starts_with(MAGIC) {
            warn!("token file {} is not in the expected format", self.path.display());
            return None;
        }
        let cipher = XChaCha20Poly1305::new_from_slice(&self.key).ok()?;
        let nonce = XNonce::from_slice(&raw[MAGIC.len()..MAGIC.len() + NONCE_LEN]);
        let plain = match cipher.decrypt(nonce, &raw[MAGIC.len() + NONCE_LEN..]) {
            Ok(plain) => plain,
            Err(_) => {
                warn!(
                    "token file {} does not decrypt on this host; a new login is required",
                    self.path.display()
                );
                return None;
            }
        };
        match serde_json::from_slice::<TokenBundle>(&plain) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!("token file {} holds invalid content: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Encrypt and persist a bundle atomically (write temp, then rename).
    pub fn save(&self, bundle: &TokenBundle) -> Result<(), TokenStoreError> {
        let plain = serde_json::to_vec(bundle).expect("token bundle serializes");
        let cipher =
            XChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| TokenStoreError::Encrypt)?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plain.as_slice())
            .map_err(|_| TokenStoreError::Encrypt)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| TokenStoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = self.path.with_extension("tmp");
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| TokenStoreError::Io { path, source }
        };
        let mut file = open_private(&tmp).map_err(io_err(&tmp))?;
        file.write_all(MAGIC).map_err(io_err(&tmp))?;
        file.write_all(nonce.as_slice()).map_err(io_err(&tmp))?;
        file.write_all(&ciphertext).map_err(io_err(&tmp))?;
        file.flush().map_err(io_err(&tmp))?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        Ok(())
    }

    /// Remove the token file. No-op when it does not exist.
    pub fn clear(&self) -> Result<(), TokenStoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TokenStoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// The host-local key material: `/etc/machine-id` when present, otherwise a
/// random seed persisted as `.seed` beside the token file (mode 0600).
fn host_secret(token_path: &Path) -> Result<Vec<u8>, TokenStoreError> {
    if let Ok(machine_id) = fs::read_to_string("/etc/machine-id") {
        let trimmed = machine_id.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.as_bytes().to_vec());
        }
    }
    let seed_path = token_path
        .parent()
        .ok_or(TokenStoreError::NoHostSecret)?
        .join(".seed");
    match fs::read(&seed_path) {
        Ok(seed) if seed.len() == KEY_LEN => return Ok(seed),
        Ok(_) | Err(_) => {}
    }
    let mut seed = [0u8; KEY_LEN];
    getrandom::getrandom(&mut seed).map_err(|_| TokenStoreError::NoHostSecret)?;
    if let Some(parent) = seed_path.parent() {
        fs::create_dir_all(parent).map_err(|source| TokenStoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let mut file = open_private(&seed_path).map_err(|source| TokenStoreError::Io {
        path: seed_path.clone(),
        source,
    })?;
    file.write_all(&seed).map_err(|source| TokenStoreError::Io {
        path: seed_path.clone(),
        source,
    })?;
    Ok(seed.to_vec())
}

/// Create a file readable by the owner only.
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path)
}
