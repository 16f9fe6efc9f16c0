/*
 * config.rs
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

//! Configuration snapshot: loaded once from `config.json`, validated, then
//! immutable for the process lifetime.
//!
//! The recognized option set is fully enumerated here; unknown keys are
//! rejected so that typos fail loudly at startup instead of being silently
//! ignored.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Environment variable pointing at the configuration file.
pub const CONFIG_FILE_ENV: &str = "M365_PROXY_CONFIG_FILE";

/// Default attachment limit in MiB.
const DEFAULT_ATTACHMENT_LIMIT_MB: u64 = 80;

/// Hard ceiling for the attachment limit in MiB.
const MAX_ATTACHMENT_LIMIT_MB: u64 = 150;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The immutable configuration snapshot handed to the core at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Upstream user principal name whose token performs all Graph calls.
    pub upstream_user: String,
    /// OAuth2 application (client) id registered for the device code flow.
    pub client_id: String,
    /// Microsoft 365 tenant id (GUID or domain form).
    pub tenant_id: String,
    /// Optional HTTPS proxy for all outbound Graph traffic.
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Address the listeners bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Listener ports; unset ports are not bound.
    #[serde(default)]
    pub ports: Ports,
    /// Server certificate and key for SMTPS/POP3S and STARTTLS.
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
    /// Client-facing mailbox allowlist.
    pub mailboxes: Vec<MailboxConfig>,
    /// Recipient domains accepted on submission. Empty means unrestricted.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Upper bound on a submitted message, attachments included.
    #[serde(default = "default_attachment_limit_mb")]
    pub attachment_limit_mb: u64,
    /// Directory holding the durable outbound queue.
    pub queue_dir: PathBuf,
    /// Path of the encrypted token bundle.
    pub token_file: PathBuf,
    /// Log level filter (`error`..`trace`). `RUST_LOG` overrides.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ports {
    #[serde(default)]
    pub smtp: Option<u16>,
    #[serde(default)]
    pub smtps: Option<u16>,
    #[serde(default)]
    pub pop3: Option<u16>,
    #[serde(default)]
    pub pop3s: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsMaterial {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// One allowlisted client mailbox: the credentials a legacy client presents
/// and the capability flags that drive per-mailbox behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailboxConfig {
    /// Client-visible login name; also the envelope identity and the Graph
    /// mailbox address (shared mailboxes ride on the upstream user's token).
    pub username: String,
    /// PHC-format PBKDF2 hash of the client password.
    pub password_hash: String,
    /// Folder POP3 exposes; well-known or display name.
    #[serde(default = "default_source_folder")]
    pub source_folder: String,
    /// Mark messages read in UPDATE after they were retrieved.
    #[serde(default)]
    pub mark_read_after_fetch: bool,
    /// Delete DELE-marked messages in UPDATE instead of only marking read.
    #[serde(default)]
    pub delete_after_fetch: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_attachment_limit_mb() -> u64 {
    DEFAULT_ATTACHMENT_LIMIT_MB
}

fn default_source_folder() -> String {
    "Inbox".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Attachment limit in bytes.
    pub fn attachment_limit_bytes(&self) -> u64 {
        self.attachment_limit_mb * 1024 * 1024
    }

    /// Look up an allowlisted mailbox by login name (ASCII case-insensitive).
    pub fn find_mailbox(&self, username: &str) -> Option<&MailboxConfig> {
        self.mailboxes
            .iter()
            .find(|m| m.username.eq_ignore_ascii_case(username))
    }

    /// True when the recipient domain passes the `allowed_domains` filter.
    pub fn domain_allowed(&self, domain: &str) -> bool {
        self.allowed_domains.is_empty()
            || self
                .allowed_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.upstream_user.is_empty() {
            return invalid("upstream_user must not be empty".into());
        }
        if self.client_id.is_empty() || self.tenant_id.is_empty() {
            return invalid("client_id and tenant_id must not be empty".into());
        }

        let enabled: Vec<(&str, u16)> = [
            ("smtp", self.ports.smtp),
            ("smtps", self.ports.smtps),
            ("pop3", self.ports.pop3),
            ("pop3s", self.ports.pop3s),
        ]
        .into_iter()
        .filter_map(|(name, port)| port.map(|p| (name, p)))
        .collect();

        if enabled.is_empty() {
            return invalid("no listener port is configured".into());
        }
        let mut seen = HashSet::new();
        for (name, port) in &enabled {
            if !seen.insert(*port) {
                return invalid(format!("port {} ({}) is configured twice", port, name));
            }
        }
        if self.ports.smtp.is_some() && self.ports.smtps.is_some() {
            return invalid("smtp and smtps are mutually exclusive".into());
        }
        if self.ports.pop3.is_some() && self.ports.pop3s.is_some() {
            return invalid("pop3 and pop3s are mutually exclusive".into());
        }
        if (self.ports.smtps.is_some() || self.ports.pop3s.is_some()) && self.tls.is_none() {
            return invalid("smtps/pop3s require tls cert and key".into());
        }

        if self.mailboxes.is_empty() {
            return invalid("at least one mailbox must be configured".into());
        }
        let mut names = HashSet::new();
        for mailbox in &self.mailboxes {
            if mailbox.username.is_empty() {
                return invalid("mailbox username must not be empty".into());
            }
            if !names.insert(mailbox.username.to_ascii_lowercase()) {
                return invalid(format!("duplicate mailbox '{}'", mailbox.username));
            }
            if mailbox.password_hash.is_empty() {
                return invalid(format!("mailbox '{}' has no password hash", mailbox.username));
            }
        }

        if self.attachment_limit_mb == 0 || self.attachment_limit_mb > MAX_ATTACHMENT_LIMIT_MB {
            return invalid(format!(
                "attachment_limit_mb must be between 1 and {}",
                MAX_ATTACHMENT_LIMIT_MB
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A minimal valid configuration used across the test suite.
    pub(crate) fn sample_json() -> String {
        r#"{
            "upstream_user": "admin@contoso.onmicrosoft.com",
            "client_id": "11111111-2222-3333-4444-555555555555",
            "tenant_id": "contoso.onmicrosoft.com",
            "ports": { "smtp": 2525, "pop3": 2110 },
            "mailboxes": [
                {
                    "username": "alerts@contoso.onmicrosoft.com",
                    "password_hash": "$pbkdf2-sha256$i=600000,l=32$c2FsdHNhbHQ$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
                }
            ],
            "allowed_domains": ["example.com"],
            "queue_dir": "/var/lib/portalettere/queue",
            "token_file": "/var/lib/portalettere/tokens.enc"
        }"#
        .to_string()
    }

    pub(crate) fn sample() -> Config {
        let config: Config = serde_json::from_str(&sample_json()).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn parses_sample() {
        let config = sample();
        assert_eq!(config.ports.smtp, Some(2525));
        assert_eq!(config.attachment_limit_mb, 80);
        assert_eq!(config.mailboxes[0].source_folder, "Inbox");
        assert!(!config.mailboxes[0].delete_after_fetch);
    }

    #[test]
    fn rejects_duplicate_ports() {
        let mut config = sample();
        config.ports.pop3 = Some(2525);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_smtp_and_smtps_together() {
        let mut config = sample();
        config.ports.smtps = Some(4465);
        assert!(config.validate().is_err());
    }

    #[test]
    fn requires_tls_material_for_implicit_tls() {
        let mut config = sample();
        config.ports.smtp = None;
        config.ports.smtps = Some(4465);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_limit() {
        let mut config = sample();
        config.attachment_limit_mb = 151;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mailbox_lookup_is_case_insensitive() {
        let config = sample();
        assert!(config.find_mailbox("ALERTS@CONTOSO.ONMICROSOFT.COM").is_some());
        assert!(config.find_mailbox("nobody@contoso.onmicrosoft.com").is_none());
    }

    #[test]
    fn domain_filter() {
        let mut config = sample();
        assert!(config.domain_allowed("EXAMPLE.COM"));
        assert!(!config.domain_allowed("evil.test"));
        config.allowed_domains.clear();
        assert!(config.domain_allowed("anything.test"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = sample_json().replace("\"allowed_domains\"", "\"alowed_domains\"");
        assert!(serde_json::from_str::<Config>(&raw).is_err());
    }
}
