//! Shared scaffolding for the protocol integration tests: a scripted
//! in-memory backend, a line-oriented test client, and helpers to stand up
//! a session listener on an ephemeral port.

// Each test binary uses a different slice of these helpers.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pbkdf2::password_hash::{PasswordHasher, SaltString};
use pbkdf2::Pbkdf2;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use portalettere::api::{Envelope, MailBackend, MailError, MessageMeta};
use portalettere::config::Config;
use portalettere::listener::Gateway;
use portalettere::queue::OutboundQueue;
use portalettere::reach::Reachability;

/// One message the mock backend serves to POP3 sessions.
#[derive(Clone)]
pub struct StoredMessage {
    pub id: String,
    pub mime: Vec<u8>,
}

/// Scripted backend recording every upstream call.
#[derive(Default)]
pub struct MockBackend {
    pub sent: Mutex<Vec<(Envelope, Vec<u8>)>>,
    /// Results popped per send; `Ok(())` once the script runs out.
    pub send_script: Mutex<VecDeque<Result<(), MailError>>>,
    pub messages: Mutex<Vec<StoredMessage>>,
    pub marked_read: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_messages(messages: Vec<StoredMessage>) -> Arc<Self> {
        let backend = Self::default();
        *backend.messages.lock().unwrap() = messages;
        Arc::new(backend)
    }

    pub fn push_send_result(&self, result: Result<(), MailError>) {
        self.send_script.lock().unwrap().push_back(result);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MailBackend for MockBackend {
    async fn send_mail(&self, envelope: &Envelope, raw_mime: &[u8]) -> Result<(), MailError> {
        let scripted = self.send_script.lock().unwrap().pop_front();
        match scripted {
            Some(Err(e)) => Err(e),
            _ => {
                self.sent
                    .lock()
                    .unwrap()
                    .push((envelope.clone(), raw_mime.to_vec()));
                Ok(())
            }
        }
    }

    async fn list_messages(
        &self,
        _mailbox: &str,
        _folder: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageMeta>, MailError> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| MessageMeta {
                id: m.id.clone(),
                size: m.mime.len() as u64,
            })
            .collect())
    }

    async fn fetch_mime(&self, _mailbox: &str, message_id: &str) -> Result<Vec<u8>, MailError> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.mime.clone())
            .ok_or_else(|| MailError::Rejected {
                status: 404,
                code: "ErrorItemNotFound".into(),
                detail: message_id.to_string(),
            })
    }

    async fn mark_read(&self, _mailbox: &str, message_id: &str) -> Result<(), MailError> {
        self.marked_read.lock().unwrap().push(message_id.to_string());
        Ok(())
    }

    async fn delete(&self, _mailbox: &str, message_id: &str) -> Result<(), MailError> {
        self.deleted.lock().unwrap().push(message_id.to_string());
        Ok(())
    }

    async fn probe(&self) -> bool {
        true
    }
}

pub const USERNAME: &str = "alerts@contoso.onmicrosoft.com";
pub const PASSWORD: &str = "printer-secret";

pub fn password_hash(password: &str) -> String {
    let salt = SaltString::encode_b64(b"portalettere-it").unwrap();
    Pbkdf2
        .hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

/// Build a config pointing at a throwaway queue/token location.
pub fn test_config(state_dir: &std::path::Path, delete_after_fetch: bool) -> Config {
    let raw = serde_json::json!({
        "upstream_user": "admin@contoso.onmicrosoft.com",
        "client_id": "11111111-2222-3333-4444-555555555555",
        "tenant_id": "contoso.onmicrosoft.com",
        "ports": { "smtp": 2525, "pop3": 2110 },
        "mailboxes": [{
            "username": USERNAME,
            "password_hash": password_hash(PASSWORD),
            "mark_read_after_fetch": false,
            "delete_after_fetch": delete_after_fetch,
        }],
        "allowed_domains": ["example.com"],
        "attachment_limit_mb": 1,
        "queue_dir": state_dir.join("queue"),
        "token_file": state_dir.join("tokens.enc"),
    });
    serde_json::from_value(raw).unwrap()
}

pub fn make_gateway(
    config: Config,
    backend: Arc<MockBackend>,
    reachable: bool,
) -> Arc<Gateway> {
    let queue = Arc::new(OutboundQueue::open(&config.queue_dir.clone()).unwrap());
    Arc::new(Gateway {
        config,
        backend,
        queue,
        reach: Reachability::fixed(reachable),
        tls: None,
    })
}

pub enum Proto {
    Smtp,
    Pop3,
}

/// Bind an ephemeral port and serve sessions of the given protocol on it.
pub async fn start_server(gateway: Arc<Gateway>, proto: Proto) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let accept_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            let gateway = gateway.clone();
            let session_cancel = accept_cancel.clone();
            match proto {
                Proto::Smtp => {
                    tokio::spawn(portalettere::protocol::smtp::serve(
                        stream,
                        gateway,
                        peer,
                        false,
                        session_cancel,
                    ));
                }
                Proto::Pop3 => {
                    tokio::spawn(portalettere::protocol::pop3::serve(
                        stream,
                        gateway,
                        peer,
                        false,
                        session_cancel,
                    ));
                }
            }
        }
    });
    (addr, cancel)
}

/// Minimal line client for driving the protocol engines.
pub struct LineClient<S> {
    stream: BufReader<S>,
}

impl LineClient<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream: BufReader::new(stream),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await.unwrap();
        assert!(n > 0, "server closed the connection unexpectedly");
        line.trim_end().to_string()
    }

    /// Read until the server closes the connection; None on clean EOF.
    pub async fn read_line_or_eof(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await.unwrap();
        if n == 0 {
            None
        } else {
            Some(line.trim_end().to_string())
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.stream
            .get_mut()
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    /// Send a command and read a single reply line.
    pub async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.read_line().await
    }

    /// Read an SMTP reply that may span multiple `250-` style lines;
    /// returns all lines.
    pub async fn read_smtp_reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.len() < 4 || line.as_bytes()[3] == b' ';
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    /// Read a POP3 multi-line payload terminated by a lone dot, after the
    /// initial +OK line has been consumed. Returns the un-stuffed lines.
    pub async fn read_multiline(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            if line == "." {
                return lines;
            }
            let line = line.strip_prefix('.').map(str::to_string).unwrap_or(line);
            lines.push(line);
        }
    }
}

/// AUTH PLAIN initial response for the test credentials.
pub fn plain_credentials(username: &str, password: &str) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    STANDARD.encode(format!("\0{}\0{}", username, password))
}
