/*
 * lib.rs
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

//! Portalettere: a local-network mail gateway that terminates SMTP and POP3
//! (plus their TLS-from-start variants) and translates the sessions into
//! Microsoft Graph API calls, so printers, scanners and legacy applications
//! can keep using username/password mail against a Microsoft 365 tenant.
//!
//! The moving parts:
//! - [`oauth`]: device code sign-in and the encrypted token store.
//! - [`graph`]: the Graph adapter (send, list, fetch, flag, delete), with
//!   chunked upload for large messages.
//! - [`queue`]: a durable outbound queue with at-most-once resend semantics.
//! - [`reach`]: the reachability watcher driving the queue and the SMTP
//!   acceptance policy.
//! - [`protocol`]: the SMTP and POP3 session engines.
//! - [`listener`]: the socket supervisor tying it all together.

pub mod api;
pub mod auth;
pub mod config;
pub mod graph;
pub mod listener;
pub mod mime;
pub mod net;
pub mod oauth;
pub mod protocol;
pub mod queue;
pub mod reach;
pub mod sasl;

#[cfg(test)]
pub(crate) mod testutil {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::api::{Envelope, MailBackend, MailError, MessageMeta};

    /// A backend that accepts everything and holds nothing.
    pub(crate) struct NullBackend;

    #[async_trait]
    impl MailBackend for NullBackend {
        async fn send_mail(&self, _envelope: &Envelope, _raw_mime: &[u8]) -> Result<(), MailError> {
            Ok(())
        }
        async fn list_messages(
            &self,
            _mailbox: &str,
            _folder: &str,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<MessageMeta>, MailError> {
            Ok(Vec::new())
        }
        async fn fetch_mime(&self, _mailbox: &str, _message_id: &str) -> Result<Vec<u8>, MailError> {
            Ok(Vec::new())
        }
        async fn mark_read(&self, _mailbox: &str, _message_id: &str) -> Result<(), MailError> {
            Ok(())
        }
        async fn delete(&self, _mailbox: &str, _message_id: &str) -> Result<(), MailError> {
            Ok(())
        }
        async fn probe(&self) -> bool {
            true
        }
    }
}
