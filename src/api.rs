/*
 * api.rs
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

//! The mailbox backend seam between the protocol engines, the queue flusher
//! and the Graph adapter, plus the shared error taxonomy.
//!
//! Sessions and the flusher only ever see `dyn MailBackend`; the production
//! implementation is `graph::GraphClient`, tests substitute a scripted fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a failed upstream operation should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: network, timeout, 429, 5xx. Submission falls back to the queue.
    Retryable,
    /// Credentials problem that survived a refresh attempt; interactive login needed.
    Auth,
    /// The upstream definitively rejected the request; retrying cannot succeed.
    Permanent,
}

/// Errors from upstream mailbox operations.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    /// 429 or 5xx from the service.
    #[error("upstream unavailable (status {0})")]
    Unavailable(u16),
    /// 401/403 that survived one token refresh.
    #[error("not authorized (status {0}): {1}")]
    Unauthorized(u16, String),
    /// No usable token and no way to mint one without the user.
    #[error("interactive login required: {0}")]
    LoginRequired(String),
    /// Non-retryable rejection. `code` carries the Graph error code when known.
    #[error("rejected (status {status}, {code}): {detail}")]
    Rejected {
        status: u16,
        code: String,
        detail: String,
    },
    #[error("malformed upstream response: {0}")]
    BadResponse(String),
}

impl MailError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MailError::Transport(_) | MailError::Timeout(_) | MailError::Unavailable(_) => {
                ErrorClass::Retryable
            }
            MailError::Unauthorized(..) | MailError::LoginRequired(_) => ErrorClass::Auth,
            MailError::Rejected { .. } => ErrorClass::Permanent,
            // A response we could not make sense of is not worth replaying.
            MailError::BadResponse(_) => ErrorClass::Permanent,
        }
    }

    /// Classify an HTTP status into a `MailError`. `detail` is the response
    /// body (or the Graph error code/message extracted from it).
    pub fn from_status(status: u16, code: String, detail: String) -> Self {
        match status {
            401 | 403 => MailError::Unauthorized(status, detail),
            429 => MailError::Unavailable(status),
            s if s >= 500 => MailError::Unavailable(s),
            s => MailError::Rejected {
                status: s,
                code,
                detail,
            },
        }
    }
}

/// Envelope identity of one outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
}

impl Envelope {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
        }
    }

    /// All recipients across to/cc/bcc.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }
}

/// One message as listed from the source folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    /// Stable upstream id; doubles as the POP3 UIDL.
    pub id: String,
    /// Message size in octets as reported upstream (0 when unknown).
    pub size: u64,
}

/// Upstream mailbox operations used by the session engines and the flusher.
#[async_trait]
pub trait MailBackend: Send + Sync {
    /// Submit a finished RFC 5322 message under the given envelope. The
    /// envelope sender is the identity the message is sent as.
    async fn send_mail(&self, envelope: &Envelope, raw_mime: &[u8]) -> Result<(), MailError>;

    /// List messages in `folder` of `mailbox`, oldest first. `since` narrows
    /// the listing to messages received at or after the given instant.
    async fn list_messages(
        &self,
        mailbox: &str,
        folder: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageMeta>, MailError>;

    /// Fetch the full raw MIME of one message.
    async fn fetch_mime(&self, mailbox: &str, message_id: &str) -> Result<Vec<u8>, MailError>;

    /// Set the read flag on one message.
    async fn mark_read(&self, mailbox: &str, message_id: &str) -> Result<(), MailError>;

    /// Permanently delete one message.
    async fn delete(&self, mailbox: &str, message_id: &str) -> Result<(), MailError>;

    /// Cheap reachability probe. Any HTTP response counts as reachable,
    /// including 401/403/405; only a transport-level failure does not.
    async fn probe(&self) -> bool;
}
