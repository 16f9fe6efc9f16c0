/*
 * smtp.rs
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

//! The SMTP submission engine: ESMTP with EHLO, AUTH PLAIN/LOGIN, STARTTLS,
//! MAIL/RCPT/DATA, RSET, NOOP, VRFY, QUIT.
//!
//! Accepted messages are sent through Graph inline while it is reachable;
//! a retryable upstream failure (or unreachability) moves the message into
//! the durable queue, and the client still gets its 250 — from that point
//! the delivery contract is ours.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::wire::{read_line, unstuff_line, write_line, LineRead};
use crate::api::{Envelope, ErrorClass, MailError};
use crate::auth::{authenticate, MAX_AUTH_FAILURES};
use crate::config::MailboxConfig;
use crate::listener::Gateway;
use crate::sasl::{
    decode_line, decode_plain, SaslError, LOGIN_PASSWORD_CHALLENGE, LOGIN_USERNAME_CHALLENGE,
};

/// Idle timeout between commands.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Inactivity timeout while receiving DATA.
const DATA_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How a command loop ended: either the connection is done, or the client
/// negotiated STARTTLS and the caller owns the handshake.
enum LoopEnd<S> {
    Closed,
    StartTls(S),
}

/// Entry point for one accepted SMTP connection.
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
        // Handshake first, greeting after: TLS-from-start semantics.
        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let _ = session.run(tls_stream, true).await;
            }
            Err(e) => debug!("smtp tls handshake with {} failed: {}", peer, e),
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
                    // Post-upgrade the session collapses to the greeting
                    // state: EHLO and AUTH have to happen again.
                    session.reset_after_tls();
                    let _ = session.run(tls_stream, false).await;
                }
                Err(e) => debug!("starttls handshake with {} failed: {}", peer, e),
            }
        }
        Ok(LoopEnd::Closed) => {}
        Err(e) => debug!("smtp session with {} ended: {}", peer, e),
    }
}

struct Session {
    gateway: Arc<Gateway>,
    peer: SocketAddr,
    cancel: CancellationToken,
    tls_active: bool,
    helo: Option<String>,
    authed: Option<MailboxConfig>,
    auth_failures: u8,
    envelope: Option<Envelope>,
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
            helo: None,
            authed: None,
            auth_failures: 0,
            envelope: None,
        }
    }

    /// All authentication and transaction state dies with the upgrade.
    fn reset_after_tls(&mut self) {
        self.tls_active = true;
        self.helo = None;
        self.authed = None;
        self.auth_failures = 0;
        self.envelope = None;
    }

    fn starttls_available(&self) -> bool {
        !self.tls_active && self.gateway.tls.is_some()
    }

    async fn run<S>(&mut self, stream: S, greet: bool) -> std::io::Result<LoopEnd<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        if greet {
            write_line(&mut stream, "220 portalettere ESMTP service ready").await?;
        }
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => {
                    write_line(&mut stream, "421 4.3.2 service shutting down").await?;
                    return Ok(LoopEnd::Closed);
                }
                read = tokio::time::timeout(IDLE_TIMEOUT, read_line(&mut stream)) => match read {
                    Err(_) => {
                        write_line(&mut stream, "421 4.4.2 idle timeout, closing").await?;
                        return Ok(LoopEnd::Closed);
                    }
                    Ok(result) => result?,
                },
            };
            let text = match line {
                LineRead::Eof => return Ok(LoopEnd::Closed),
                LineRead::TooLong => {
                    write_line(&mut stream, "500 5.5.2 line too long").await?;
                    continue;
                }
                LineRead::Line(text) => text,
            };
            let (verb, args) = split_command(&text);

            match verb.as_str() {
                "QUIT" => {
                    write_line(&mut stream, "221 2.0.0 bye").await?;
                    return Ok(LoopEnd::Closed);
                }
                "NOOP" => write_line(&mut stream, "250 2.0.0 ok").await?,
                "RSET" => {
                    self.envelope = None;
                    write_line(&mut stream, "250 2.0.0 ok").await?;
                }
                "VRFY" => {
                    // Never confirm or deny addresses.
                    write_line(&mut stream, "252 2.5.2 cannot verify; accept and try").await?;
                }
                "HELO" => {
                    self.helo = Some(args.to_string());
                    self.envelope = None;
                    write_line(&mut stream, "250 portalettere").await?;
                }
                "EHLO" => {
                    self.helo = Some(args.to_string());
                    self.envelope = None;
                    self.write_ehlo(&mut stream, args).await?;
                }
                "STARTTLS" => {
                    if self.tls_active {
                        write_line(&mut stream, "503 5.5.1 already using TLS").await?;
                    } else if self.gateway.tls.is_none() {
                        write_line(&mut stream, "454 4.7.0 TLS not available").await?;
                    } else {
                        write_line(&mut stream, "220 2.0.0 ready to start TLS").await?;
                        return Ok(LoopEnd::StartTls(stream.into_inner()));
                    }
                }
                "AUTH" => {
                    if self.cmd_auth(&mut stream, args).await? {
                        return Ok(LoopEnd::Closed);
                    }
                }
                "MAIL" => self.cmd_mail(&mut stream, args).await?,
                "RCPT" => self.cmd_rcpt(&mut stream, args).await?,
                "DATA" => self.cmd_data(&mut stream, args).await?,
                "EXPN" | "HELP" => {
                    write_line(&mut stream, "502 5.5.1 command not implemented").await?;
                }
                _ => write_line(&mut stream, "500 5.5.2 command unrecognized").await?,
            }
        }
    }

    async fn write_ehlo<S>(&self, stream: &mut BufReader<S>, client_name: &str) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = if client_name.is_empty() {
            "client"
        } else {
            client_name
        };
        let mut capabilities = vec![
            format!("portalettere greets {}", name),
            format!("SIZE {}", self.gateway.config.attachment_limit_bytes()),
            "PIPELINING".to_string(),
            "AUTH PLAIN LOGIN".to_string(),
        ];
        if self.starttls_available() {
            capabilities.push("STARTTLS".to_string());
        }
        let last = capabilities.len() - 1;
        for (index, capability) in capabilities.iter().enumerate() {
            let separator = if index == last { ' ' } else { '-' };
            write_line(stream, &format!("250{}{}", separator, capability)).await?;
        }
        Ok(())
    }

    /// Returns `true` when the connection must close (too many failures).
    async fn cmd_auth<S>(&mut self, stream: &mut BufReader<S>, args: &str) -> std::io::Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.authed.is_some() {
            write_line(stream, "503 5.5.1 already authenticated").await?;
            return Ok(false);
        }
        if self.helo.is_none() {
            write_line(stream, "503 5.5.1 send EHLO first").await?;
            return Ok(false);
        }
        let mut parts = args.split_whitespace();
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        let initial = parts.next();

        let credentials = match mechanism.as_str() {
            "PLAIN" => {
                let response = match initial {
                    Some(initial) => initial.to_string(),
                    None => {
                        write_line(stream, "334 ").await?;
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
                        write_line(stream, &format!("334 {}", LOGIN_USERNAME_CHALLENGE)).await?;
                        match self.read_auth_line(stream).await? {
                            Some(line) => line,
                            None => return Ok(false),
                        }
                    }
                };
                write_line(stream, &format!("334 {}", LOGIN_PASSWORD_CHALLENGE)).await?;
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
            _ => {
                write_line(stream, "504 5.5.4 mechanism not supported").await?;
                return Ok(false);
            }
        };

        let Some((username, password)) = credentials else {
            return Ok(false);
        };
        match authenticate(&self.gateway.config, &username, &password) {
            Some(mailbox) => {
                info!("smtp {} authenticated as {}", self.peer, mailbox.username);
                self.authed = Some(mailbox.clone());
                self.auth_failures = 0;
                write_line(stream, "235 2.7.0 authentication successful").await?;
                Ok(false)
            }
            None => {
                warn!("smtp {} failed authentication for {}", self.peer, username);
                self.auth_failures += 1;
                write_line(stream, "535 5.7.8 authentication credentials invalid").await?;
                if self.auth_failures >= MAX_AUTH_FAILURES {
                    write_line(stream, "421 4.7.0 too many failures, closing").await?;
                    return Ok(true);
                }
                Ok(false)
            }
        }
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
                write_line(stream, "500 5.5.2 line too long").await?;
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
            SaslError::Cancelled => "501 5.7.0 authentication cancelled",
            _ => "501 5.5.2 malformed authentication response",
        };
        write_line(stream, reply).await
    }

    async fn cmd_mail<S>(&mut self, stream: &mut BufReader<S>, args: &str) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(mailbox) = self.authed.clone() else {
            return write_line(stream, "530 5.7.0 authentication required").await;
        };
        if self.envelope.is_some() {
            return write_line(stream, "503 5.5.1 nested MAIL command").await;
        }
        let Some((address, parameters)) = parse_path(args, "FROM:") else {
            return write_line(stream, "501 5.5.4 syntax: MAIL FROM:<address>").await;
        };
        if let Some(declared_size) = parse_size_parameter(&parameters) {
            if declared_size > self.gateway.config.attachment_limit_bytes() {
                return write_line(stream, "552 5.3.4 message size exceeds limit").await;
            }
        }
        if !address.eq_ignore_ascii_case(&mailbox.username) {
            warn!(
                "smtp {} tried MAIL FROM {} while authenticated as {}",
                self.peer, address, mailbox.username
            );
            return write_line(stream, "553 5.7.1 sender must match authenticated mailbox").await;
        }
        self.envelope = Some(Envelope::new(mailbox.username.clone()));
        write_line(stream, "250 2.1.0 sender ok").await
    }

    async fn cmd_rcpt<S>(&mut self, stream: &mut BufReader<S>, args: &str) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.envelope.is_none() {
            return write_line(stream, "503 5.5.1 need MAIL before RCPT").await;
        }
        let Some((address, _)) = parse_path(args, "TO:") else {
            return write_line(stream, "501 5.5.4 syntax: RCPT TO:<address>").await;
        };
        let Some((_, domain)) = address.rsplit_once('@') else {
            return write_line(stream, "501 5.1.3 recipient address needs a domain").await;
        };
        if !self.gateway.config.domain_allowed(domain) {
            info!("smtp {} recipient {} refused by domain policy", self.peer, address);
            return write_line(stream, "550 5.7.1 recipient domain not permitted").await;
        }
        self.envelope
            .as_mut()
            .expect("envelope checked above")
            .to
            .push(address);
        write_line(stream, "250 2.1.5 recipient ok").await
    }

    async fn cmd_data<S>(&mut self, stream: &mut BufReader<S>, args: &str) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !args.is_empty() {
            return write_line(stream, "501 5.5.4 DATA takes no parameters").await;
        }
        let ready = self
            .envelope
            .as_ref()
            .map(|envelope| !envelope.to.is_empty())
            .unwrap_or(false);
        if !ready {
            return write_line(stream, "503 5.5.1 need MAIL and RCPT first").await;
        }
        write_line(stream, "354 end data with <CRLF>.<CRLF>").await?;

        let limit = self.gateway.config.attachment_limit_bytes() as usize;
        let mut body: Vec<u8> = Vec::with_capacity(4096);
        let mut oversized = false;
        let mut line_violation = false;
        loop {
            let line = match tokio::time::timeout(DATA_TIMEOUT, read_line(stream)).await {
                Err(_) => {
                    write_line(stream, "421 4.4.2 data timeout, closing").await?;
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "DATA inactivity timeout",
                    ));
                }
                Ok(result) => result?,
            };
            let text = match line {
                LineRead::Eof => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed inside DATA",
                    ))
                }
                LineRead::TooLong => {
                    line_violation = true;
                    continue;
                }
                LineRead::Line(text) => text,
            };
            if text == "." {
                break;
            }
            if oversized || line_violation {
                // Keep draining to the terminator; content is already doomed.
                continue;
            }
            let line_bytes = unstuff_line(&text).as_bytes();
            if body.len() + line_bytes.len() + 2 > limit {
                oversized = true;
                continue;
            }
            body.extend_from_slice(line_bytes);
            body.extend_from_slice(b"\r\n");
        }

        let envelope = self.envelope.take().expect("checked above");
        if oversized {
            return write_line(stream, "552 5.3.4 message size exceeds limit").await;
        }
        if line_violation {
            return write_line(stream, "500 5.6.0 line too long in message content").await;
        }
        let reply = self.dispatch(envelope, body).await;
        write_line(stream, &reply).await
    }

    /// Submission policy: inline when reachable, queue on retryable failure
    /// or unreachability, conservative 5xx on a permanent rejection.
    async fn dispatch(&self, envelope: Envelope, body: Vec<u8>) -> String {
        let gateway = &self.gateway;
        if !gateway.reach.is_reachable() {
            return match gateway.queue.enqueue(&envelope, &body) {
                Ok(_) => "250 2.6.0 message queued for delivery".to_string(),
                Err(e) => {
                    warn!("cannot queue message while offline: {}", e);
                    "450 4.3.0 temporary local error, try again".to_string()
                }
            };
        }
        match gateway.backend.send_mail(&envelope, &body).await {
            Ok(()) => {
                info!(
                    "smtp {} message from {} delivered inline",
                    self.peer, envelope.sender
                );
                "250 2.6.0 message accepted for delivery".to_string()
            }
            Err(mail_error) => match mail_error.class() {
                ErrorClass::Retryable => {
                    debug!("inline send failed ({}); queueing", mail_error);
                    match gateway.queue.enqueue(&envelope, &body) {
                        Ok(_) => "250 2.6.0 message queued for delivery".to_string(),
                        Err(e) => {
                            warn!("cannot queue message after upstream failure: {}", e);
                            "450 4.3.0 temporary local error, try again".to_string()
                        }
                    }
                }
                ErrorClass::Auth => {
                    warn!("upstream authorization failure: {}", mail_error);
                    "450 4.7.0 upstream authentication required, try again later".to_string()
                }
                ErrorClass::Permanent => permanent_reply(&mail_error),
            },
        }
    }
}

/// Map a permanent Graph rejection onto a conservative SMTP code.
fn permanent_reply(error: &MailError) -> String {
    if let MailError::Rejected { status, code, .. } = error {
        if *status == 413 || code.eq_ignore_ascii_case("ErrorMessageSizeExceeded") {
            return "552 5.3.4 message size exceeds limit".to_string();
        }
        if code.to_ascii_lowercase().contains("recipient") {
            return "550 5.1.1 recipient rejected by upstream".to_string();
        }
    }
    "554 5.0.0 message rejected by upstream".to_string()
}

/// Split a command line into its uppercased verb and the argument remainder.
fn split_command(line: &str) -> (String, &str) {
    let trimmed = line.trim_start();
    match trimmed.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim()),
        None => (trimmed.to_ascii_uppercase(), ""),
    }
}

/// Parse `FROM:<addr> params…` / `TO:<addr>`; tolerates a missing angle pair
/// because embedded senders get this wrong all the time.
fn parse_path<'a>(args: &'a str, prefix: &str) -> Option<(String, &'a str)> {
    if args.len() < prefix.len() || !args[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = args[prefix.len()..].trim_start();
    if let Some(stripped) = rest.strip_prefix('<') {
        let end = stripped.find('>')?;
        let address = stripped[..end].to_string();
        Some((address, stripped[end + 1..].trim()))
    } else {
        let (address, parameters) = match rest.split_once(char::is_whitespace) {
            Some((address, parameters)) => (address, parameters.trim()),
            None => (rest, ""),
        };
        if address.is_empty() {
            return None;
        }
        Some((address.to_string(), parameters))
    }
}

/// Extract `SIZE=n` from MAIL parameters, case-insensitively.
fn parse_size_parameter(parameters: &str) -> Option<u64> {
    parameters.split_whitespace().find_map(|parameter| {
        let (key, value) = parameter.split_once('=')?;
        if key.eq_ignore_ascii_case("SIZE") {
            value.parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_split() {
        assert_eq!(split_command("ehlo printer"), ("EHLO".into(), "printer"));
        assert_eq!(split_command("QUIT"), ("QUIT".into(), ""));
        assert_eq!(
            split_command("mail FROM:<a@b.example>"),
            ("MAIL".into(), "FROM:<a@b.example>")
        );
    }

    #[test]
    fn path_with_angle_brackets() {
        let (address, parameters) =
            parse_path("FROM:<alerts@contoso.onmicrosoft.com> SIZE=1024", "FROM:").unwrap();
        assert_eq!(address, "alerts@contoso.onmicrosoft.com");
        assert_eq!(parameters, "SIZE=1024");
    }

    #[test]
    fn path_without_angle_brackets() {
        let (address, parameters) = parse_path("TO:ops@example.com", "TO:").unwrap();
        assert_eq!(address, "ops@example.com");
        assert_eq!(parameters, "");
    }

    #[test]
    fn empty_reverse_path_parses_as_empty_address() {
        let (address, _) = parse_path("FROM:<>", "FROM:").unwrap();
        assert_eq!(address, "");
    }

    #[test]
    fn path_prefix_is_case_insensitive() {
        assert!(parse_path("from:<a@b.c>", "FROM:").is_some());
        assert!(parse_path("RCPT:<a@b.c>", "FROM:").is_none());
    }

    #[test]
    fn size_parameter() {
        assert_eq!(parse_size_parameter("SIZE=2048 BODY=8BITMIME"), Some(2048));
        assert_eq!(parse_size_parameter("size=17"), Some(17));
        assert_eq!(parse_size_parameter("BODY=7BIT"), None);
        assert_eq!(parse_size_parameter(""), None);
    }

    #[test]
    fn permanent_reply_mapping() {
        let size = MailError::Rejected {
            status: 413,
            code: String::new(),
            detail: String::new(),
        };
        assert!(permanent_reply(&size).starts_with("552"));

        let recipient = MailError::Rejected {
            status: 422,
            code: "ErrorInvalidRecipients".into(),
            detail: String::new(),
        };
        assert!(permanent_reply(&recipient).starts_with("550"));

        let other = MailError::Rejected {
            status: 400,
            code: "ErrorInvalidRequest".into(),
            detail: String::new(),
        };
        assert!(permanent_reply(&other).starts_with("554"));
    }
}
