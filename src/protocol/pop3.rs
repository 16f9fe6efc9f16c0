/*
 * pop3.rs
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

//! The POP3 retrieval engine: RFC 1939 with STLS (RFC 2595), USER/PASS and
//! SASL AUTH PLAIN/LOGIN (RFC 5034), UIDL and TOP.
//!
//! A session exposes a flat, frozen view of the mailbox's source folder:
//! the listing is fetched once when the client authenticates and indices
//! stay stable until QUIT. DELE only marks; all effects (mark-read, delete)
//! apply in UPDATE, so a dropped connection leaves the mailbox unchanged.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::wire::{read_line, split_headers, stuff_and_terminate, write_line, LineRead};
use crate::auth::{authenticate, MAX_AUTH_FAILURES};
use crate::config::MailboxConfig;
use crate::listener::Gateway;
use crate::sasl::{
    decode_line, decode_plain, SaslError, LOGIN_PASSWORD_CHALLENGE, LOGIN_USERNAME_CHALLENGE,
};

/// Idle timeout between commands.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

enum LoopEnd<S> {
    Closed,
    StartTls(S),
}

/// One message in the frozen session listing.
struct ListEntry {
    id: String,
    size: u64,
    deleted: bool,
    retrieved: bool,
}

/// Entry point for one accepted POP3 connection.
pub async fn serve(
    stream: TcpStream,
    gateway: Arc<Gateway>,
    peer: SocketAddr,
    implicit_tls: bool,
    cancel: CancellationToken,
) {
    let mut session = Session::new(gateway.clone(), peer, cancel, implicit_tls);
    if implicit_tls {
        let Some(acceptor) = gateway.tls.clone() else {
            return;
        };
        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let _ = session.run(tls_stream, true).await;
            }
            Err(e) => debug!("pop3 tls handshake with {} failed: {}", peer, e),
        }
        return;
    }
    match session.run(stream, true).await {
        Ok(LoopEnd::StartTls(stream)) => {
            let Some(acceptor) = gateway.tls.clone() else {
                return;
            };
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    session.tls_active = true;
                    let _ = session.run(tls_stream, false).await;
                }
                Err(e) => debug!("stls handshake with {} failed: {}", peer, e),
            }
        }
        Ok(LoopEnd::Closed) => {}
        Err(e) => debug!("pop3 session with {} ended: {}", peer, e),
    }
}

struct Session {
    gateway: Arc<Gateway>,
    peer: SocketAddr,
    cancel: CancellationToken,
    tls_active: bool,
    auth_failures: u8,
    pending_user: Option<String>,
    mailbox: Option<MailboxConfig>,
    entries: Vec<ListEntry>,
    /// RETR/TOP fetch cache, index → raw MIME.
    fetched: HashMap<usize, Arc<Vec<u8>>>,
}

impl Session {
    fn new(
        gateway: Arc<Gateway>,
        peer: SocketAddr,
        cancel: CancellationToken,
        tls_active: bool,
    ) -> Self {
        Self {
            gateway,
            peer,
            cancel,
            tls_active,
            auth_failures: 0,
            pending_user: None,
            mailbox: None,
            entries: Vec::new(),
            fetched: HashMap::new(),
        }
    }

    fn in_transaction(&self) -> bool {
        self.mailbox.is_some()
    }

    async fn run<S>(&mut self, stream: S, greet: bool) -> std::io::Result<LoopEnd<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        if greet {
            write_line(&mut stream, "+OK portalettere POP3 service ready").await?;
        }
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => {
                    write_line(&mut stream, "-ERR [SYS/TEMP] service shutting down").await?;
                    return Ok(LoopEnd::Closed);
                }
                read = tokio::time::timeout(IDLE_TIMEOUT, read_line(&mut stream)) => match read {
                    Err(_) => {
                        write_line(&mut stream, "-ERR idle timeout").await?;
                        return Ok(LoopEnd::Closed);
                    }
                    Ok(result) => result?,
                },
            };
            let text = match line {
                LineRead::Eof => return Ok(LoopEnd::Closed),
                LineRead::TooLong => {
                    write_line(&mut stream, "-ERR line too long").await?;
                    continue;
                }
                LineRead::Line(text) => text,
            };
            let (verb, args) = split_command(&text);

            match verb.as_str() {
                "QUIT" => {
                    if self.in_transaction() {
                        self.update_phase().await;
                    }
                    write_line(&mut stream, "+OK portalettere signing off").await?;
                    return Ok(LoopEnd::Closed);
                }
                "CAPA" => self.cmd_capa(&mut stream).await?,
                "NOOP" if self.in_transaction() => write_line(&mut stream, "+OK").await?,
                "STLS" => {
                    if self.in_transaction() {
                        write_line(&mut stream, "-ERR STLS only in authorization state").await?;
                    } else if self.tls_active {
                        write_line(&mut stream, "-ERR already using TLS").await?;
                    } else if self.gateway.tls.is_none() {
                        write_line(&mut stream, "-ERR TLS not available").await?;
                    } else {
                        write_line(&mut stream, "+OK begin TLS negotiation").await?;
                        return Ok(LoopEnd::StartTls(stream.into_inner()));
                    }
                }
                "USER" if !self.in_transaction() => {
                    if args.is_empty() {
                        write_line(&mut stream, "-ERR USER needs a name").await?;
                    } else {
                        self.pending_user = Some(args.to_string());
                        write_line(&mut stream, "+OK name accepted, send PASS").await?;
                    }
                }
                "PASS" if !self.in_transaction() => {
                    let Some(username) = self.pending_user.take() else {
                        write_line(&mut stream, "-ERR send USER first").await?;
                        continue;
                    };
                    if self.try_login(&mut stream, &username, args).await? {
                        return Ok(LoopEnd::Closed);
                    }
                }
                "AUTH" if !self.in_transaction() => {
                    if self.cmd_auth(&mut stream, args).await? {
                        return Ok(LoopEnd::Closed);
                    }
                }
                "STAT" if self.in_transaction() => {
                    let (count, octets) = self.stat();
                    write_line(&mut stream, &format!("+OK {} {}", count, octets)).await?;
                }
                "LIST" if self.in_transaction() => self.cmd_list(&mut stream, args, false).await?,
                "UIDL" if self.in_transaction() => self.cmd_list(&mut stream, args, true).await?,
                "RETR" if self.in_transaction() => self.cmd_retr(&mut stream, args).await?,
                "TOP" if self.in_transaction() => self.cmd_top(&mut stream, args).await?,
                "DELE" if self.in_transaction() => {
                    match self.lookup(args) {
                        Ok(index) => {
                            self.entries[index].deleted = true;
                            write_line(&mut stream, &format!("+OK message {} deleted", index + 1))
                                .await?;
                        }
                        Err(reason) => write_line(&mut stream, reason).await?,
                    }
                }
                "RSET" if self.in_transaction() => {
                    for entry in &mut self.entries {
                        entry.deleted = false;
                    }
                    let (count, octets) = self.stat();
                    write_line(&mut stream, &format!("+OK {} {}", count, octets)).await?;
                }
                _ => write_line(&mut stream, "-ERR command not valid here").await?,
            }
        }
    }

    async fn cmd_capa<S>(&self, stream: &mut BufReader<S>) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_line(stream, "+OK capability list follows").await?;
        write_line(stream, "TOP").await?;
        write_line(stream, "UIDL").await?;
        write_line(stream, "USER").await?;
        write_line(stream, "SASL PLAIN LOGIN").await?;
        write_line(stream, "RESP-CODES").await?;
        if !self.tls_active && !self.in_transaction() && self.gateway.tls.is_some() {
            write_line(stream, "STLS").await?;
        }
        write_line(stream, "IMPLEMENTATION portalettere").await?;
        write_line(stream, ".").await
    }

    /// Shared tail of USER/PASS and SASL auth. Returns `true` when the
    /// connection must close (too many failures).
    async fn try_login<S>(
        &mut self,
        stream: &mut BufReader<S>,
        username: &str,
        password: &str,
    ) -> std::io::Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(mailbox) = authenticate(&self.gateway.config, username, password).cloned() else {
            warn!("pop3 {} failed authentication for {}", self.peer, username);
            self.auth_failures += 1;
            write_line(stream, "-ERR [AUTH] invalid credentials").await?;
            if self.auth_failures >= MAX_AUTH_FAILURES {
                write_line(stream, "-ERR too many failures, closing").await?;
                return Ok(true);
            }
            return Ok(false);
        };

        match self.load_listing(&mailbox).await {
            Ok(()) => {
                info!("pop3 {} authenticated as {}", self.peer, mailbox.username);
                self.mailbox = Some(mailbox);
                self.auth_failures = 0;
                let (count, octets) = self.stat();
                write_line(
                    stream,
                    &format!("+OK maildrop has {} message(s) ({} octets)", count, octets),
                )
                .await?;
                Ok(false)
            }
            Err(e) => {
                warn!("pop3 {} cannot open mailbox {}: {}", self.peer, mailbox.username, e);
                write_line(stream, "-ERR [SYS/TEMP] mailbox temporarily unavailable").await?;
                Ok(false)
            }
        }
    }

    /// Fetch the session listing once; indices are frozen until QUIT.
    async fn load_listing(&mut self, mailbox: &MailboxConfig) -> Result<(), crate::api::MailError> {
        let listing = self
            .gateway
            .backend
            .list_messages(&mailbox.username, &mailbox.source_folder, None)
            .await?;
        self.entries = listing
            .into_iter()
            .map(|meta| ListEntry {
                id: meta.id,
                size: meta.size,
                deleted: false,
                retrieved: false,
            })
            .collect();
        self.fetched.clear();
        Ok(())
    }

    async fn cmd_auth<S>(&mut self, stream: &mut BufReader<S>, args: &str) -> std::io::Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut parts = args.split_whitespace();
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        let initial = parts.next();

        let credentials = match mechanism.as_str() {
            "PLAIN" => {
                let response = match initial {
                    Some(initial) => initial.to_string(),
                    None => {
                        write_line(stream, "+ ").await?;
                        match self.read_auth_line(stream).await? {
                            Some(line) => line,
                            None => return Ok(false),
                        }
                    }
                };
                match decode_plain(&response) {
                    Ok(plain) => Some((plain.authcid, plain.password)),
                    Err(e) => {
                        self.reply_sasl_error(stream, &e).await?;
                        None
                    }
                }
            }
            "LOGIN" => {
                let username_b64 = match initial {
                    Some(initial) => initial.to_string(),
                    None => {
                        write_line(stream, &format!("+ {}", LOGIN_USERNAME_CHALLENGE)).await?;
                        match self.read_auth_line(stream).await? {
                            Some(line) => line,
                            None => return Ok(false),
                        }
                    }
                };
                write_line(stream, &format!("+ {}", LOGIN_PASSWORD_CHALLENGE)).await?;
                let password_b64 = match self.read_auth_line(stream).await? {
                    Some(line) => line,
                    None => return Ok(false),
                };
                let decoded = decode_line(&username_b64)
                    .and_then(|user| decode_line(&password_b64).map(|pass| (user, pass)));
                match decoded {
                    Ok(pair) => Some(pair),
                    Err(e) => {
                        self.reply_sasl_error(stream, &e).await?;
                        None
                    }
                }
            }
            "" => {
                write_line(stream, "-ERR AUTH needs a mechanism").await?;
                return Ok(false);
            }
            _ => {
                write_line(stream, "-ERR mechanism not supported").await?;
                return Ok(false);
            }
        };

        let Some((username, password)) = credentials else {
            return Ok(false);
        };
        self.try_login(stream, &username, &password).await
    }

    async fn read_auth_line<S>(
        &mut self,
        stream: &mut BufReader<S>,
    ) -> std::io::Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(IDLE_TIMEOUT, read_line(stream)).await {
            Err(_) | Ok(Ok(LineRead::Eof)) => Ok(None),
            Ok(Ok(LineRead::TooLong)) => {
                write_line(stream, "-ERR line too long").await?;
                Ok(None)
            }
            Ok(Ok(LineRead::Line(text))) => Ok(Some(text)),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn reply_sasl_error<S>(
        &self,
        stream: &mut BufReader<S>,
        error: &SaslError,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let reply = match error {
            SaslError::Cancelled => "-ERR authentication cancelled",
            _ => "-ERR malformed authentication response",
        };
        write_line(stream, reply).await
    }

    /// STAT over non-deleted messages.
    fn stat(&self) -> (usize, u64) {
        let live = self.entries.iter().filter(|entry| !entry.deleted);
        let count = live.clone().count();
        let octets = live.map(|entry| entry.size).sum();
        (count, octets)
    }

    /// Resolve a 1-based message argument to a live entry index.
    fn lookup(&self, args: &str) -> Result<usize, &'static str> {
        let number: usize = args
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or("-ERR message number required")?;
        if number == 0 || number > self.entries.len() {
            return Err("-ERR no such message");
        }
        let index = number - 1;
        if self.entries[index].deleted {
            return Err("-ERR message is deleted");
        }
        Ok(index)
    }

    async fn cmd_list<S>(
        &mut self,
        stream: &mut BufReader<S>,
        args: &str,
        uidl: bool,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !args.is_empty() {
            return match self.lookup(args) {
                Ok(index) => {
                    let entry = &self.entries[index];
                    let detail = if uidl {
                        entry.id.clone()
                    } else {
                        entry.size.to_string()
                    };
                    write_line(stream, &format!("+OK {} {}", index + 1, detail)).await
                }
                Err(reason) => write_line(stream, reason).await,
            };
        }
        let (count, octets) = self.stat();
        if uidl {
            write_line(stream, "+OK unique-id listing follows").await?;
        } else {
            write_line(stream, &format!("+OK {} messages ({} octets)", count, octets)).await?;
        }
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.deleted {
                continue;
            }
            let detail = if uidl {
                entry.id.clone()
            } else {
                entry.size.to_string()
            };
            write_line(stream, &format!("{} {}", index + 1, detail)).await?;
        }
        write_line(stream, ".").await
    }

    async fn cmd_retr<S>(&mut self, stream: &mut BufReader<S>, args: &str) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let index = match self.lookup(args) {
            Ok(index) => index,
            Err(reason) => return write_line(stream, reason).await,
        };
        let raw = match self.fetch_cached(index).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("pop3 {} RETR {} failed: {}", self.peer, index + 1, e);
                return write_line(stream, "-ERR [SYS/TEMP] cannot fetch message").await;
            }
        };
        self.entries[index].retrieved = true;
        write_line(stream, &format!("+OK {} octets", raw.len())).await?;
        let stuffed = stuff_and_terminate(&raw);
        stream.write_all(&stuffed).await?;
        stream.flush().await
    }

    async fn cmd_top<S>(&mut self, stream: &mut BufReader<S>, args: &str) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut parts = args.split_whitespace();
        let message_arg = parts.next().unwrap_or("");
        let line_count: Option<usize> = parts.next().and_then(|n| n.parse().ok());
        let Some(line_count) = line_count else {
            return write_line(stream, "-ERR syntax: TOP msg n").await;
        };
        let index = match self.lookup(message_arg) {
            Ok(index) => index,
            Err(reason) => return write_line(stream, reason).await,
        };
        let raw = match self.fetch_cached(index).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("pop3 {} TOP {} failed: {}", self.peer, index + 1, e);
                return write_line(stream, "-ERR [SYS/TEMP] cannot fetch message").await;
            }
        };
        let (headers, body) = split_headers(&raw);
        let mut preview = headers.to_vec();
        preview.extend_from_slice(b"\r\n");
        for line in body.split_inclusive(|&b| b == b'\n').take(line_count) {
            preview.extend_from_slice(line);
        }
        write_line(stream, "+OK top of message follows").await?;
        let stuffed = stuff_and_terminate(&preview);
        stream.write_all(&stuffed).await?;
        stream.flush().await
    }

    async fn fetch_cached(&mut self, index: usize) -> Result<Arc<Vec<u8>>, crate::api::MailError> {
        if let Some(cached) = self.fetched.get(&index) {
            return Ok(cached.clone());
        }
        let mailbox = self.mailbox.as_ref().expect("transaction state");
        let raw = self
            .gateway
            .backend
            .fetch_mime(&mailbox.username, &self.entries[index].id)
            .await?;
        let raw = Arc::new(raw);
        self.fetched.insert(index, raw.clone());
        Ok(raw)
    }

    /// UPDATE: apply mark-read and delete effects for this session. Errors
    /// are logged and do not block the close; the client has committed.
    async fn update_phase(&mut self) {
        let Some(mailbox) = self.mailbox.clone() else {
            return;
        };
        for entry in &self.entries {
            let affected = entry.deleted || (entry.retrieved && mailbox.mark_read_after_fetch);
            if !affected {
                continue;
            }
            if let Err(e) = self
                .gateway
                .backend
                .mark_read(&mailbox.username, &entry.id)
                .await
            {
                warn!("update: cannot mark {} read: {}", entry.id, e);
            }
            if entry.deleted && mailbox.delete_after_fetch {
                if let Err(e) = self.gateway.backend.delete(&mailbox.username, &entry.id).await {
                    warn!("update: cannot delete {}: {}", entry.id, e);
                }
            }
        }
    }
}

/// Split a command into its uppercased verb and argument remainder.
fn split_command(line: &str) -> (String, &str) {
    let trimmed = line.trim_start();
    match trimmed.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim()),
        None => (trimmed.to_ascii_uppercase(), ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_entries(sizes: &[u64]) -> Session {
        let config = crate::config::tests::sample();
        let gateway = Gateway::for_tests(config);
        let mut session = Session::new(
            Arc::new(gateway),
            "127.0.0.1:9".parse().unwrap(),
            CancellationToken::new(),
            false,
        );
        session.entries = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| ListEntry {
                id: format!("id-{}", i + 1),
                size,
                deleted: false,
                retrieved: false,
            })
            .collect();
        session
    }

    #[test]
    fn stat_skips_deleted() {
        let mut session = session_with_entries(&[100, 200, 300]);
        assert_eq!(session.stat(), (3, 600));
        session.entries[1].deleted = true;
        assert_eq!(session.stat(), (2, 400));
    }

    #[test]
    fn lookup_validates_range_and_state() {
        let mut session = session_with_entries(&[100, 200]);
        assert_eq!(session.lookup("1").unwrap(), 0);
        assert_eq!(session.lookup("2").unwrap(), 1);
        assert!(session.lookup("0").is_err());
        assert!(session.lookup("3").is_err());
        assert!(session.lookup("x").is_err());
        session.entries[0].deleted = true;
        assert!(session.lookup("1").is_err());
    }

    #[test]
    fn command_split_uppercases_verb() {
        assert_eq!(split_command("retr 1"), ("RETR".into(), "1"));
        assert_eq!(split_command("TOP 2 10"), ("TOP".into(), "2 10"));
    }
}
