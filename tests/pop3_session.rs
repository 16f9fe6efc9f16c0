//! End-to-end POP3 session tests over real sockets, with a scripted backend
//! standing in for Graph.

mod common;

use common::{
    make_gateway, plain_credentials, start_server, test_config, LineClient, MockBackend, Proto,
    StoredMessage, PASSWORD, USERNAME,
};
use tempfile::tempdir;

fn two_messages() -> Vec<StoredMessage> {
    vec![
        StoredMessage {
            id: "AAMkAD-first".into(),
            mime: b"Subject: one\r\n\r\nfirst body\r\n.\r\nafter the dot\r\n".to_vec(),
        },
        StoredMessage {
            id: "AAMkAD-second".into(),
            mime: b"Subject: two\r\n\r\nsecond body\r\n".to_vec(),
        },
    ]
}

async fn authed_client(addr: std::net::SocketAddr) -> LineClient<tokio::net::TcpStream> {
    let mut client = LineClient::connect(addr).await;
    assert!(client.read_line().await.starts_with("+OK"));
    assert!(client.cmd(&format!("USER {}", USERNAME)).await.starts_with("+OK"));
    let reply = client.cmd(&format!("PASS {}", PASSWORD)).await;
    assert!(reply.starts_with("+OK"), "unexpected PASS reply: {}", reply);
    client
}

#[tokio::test]
async fn stat_list_and_uidl_are_session_stable() {
    let dir = tempdir().unwrap();
    let backend = MockBackend::with_messages(two_messages());
    let gateway = make_gateway(test_config(dir.path(), false), backend, true);
    let (addr, _cancel) = start_server(gateway, Proto::Pop3).await;

    let mut client = authed_client(addr).await;
    let stat = client.cmd("STAT").await;
    let sizes: u64 = two_messages().iter().map(|m| m.mime.len() as u64).sum();
    assert_eq!(stat, format!("+OK 2 {}", sizes));

    assert!(client.cmd("LIST").await.starts_with("+OK"));
    let listing = client.read_multiline().await;
    assert_eq!(listing.len(), 2);
    assert!(listing[0].starts_with("1 "));
    assert!(listing[1].starts_with("2 "));

    assert!(client.cmd("UIDL").await.starts_with("+OK"));
    let uidl = client.read_multiline().await;
    assert_eq!(uidl[0], "1 AAMkAD-first");
    assert_eq!(uidl[1], "2 AAMkAD-second");

    let single = client.cmd("UIDL 2").await;
    assert_eq!(single, "+OK 2 AAMkAD-second");
}

#[tokio::test]
async fn retr_streams_with_dot_stuffing() {
    let dir = tempdir().unwrap();
    let backend = MockBackend::with_messages(two_messages());
    let gateway = make_gateway(test_config(dir.path(), false), backend, true);
    let (addr, _cancel) = start_server(gateway, Proto::Pop3).await;

    let mut client = authed_client(addr).await;
    let reply = client.cmd("RETR 1").await;
    assert!(reply.starts_with("+OK"), "unexpected RETR reply: {}", reply);
    // read_multiline un-stuffs; the dot-only line survives the round trip.
    let body = client.read_multiline().await;
    assert_eq!(
        body,
        vec![
            "Subject: one".to_string(),
            String::new(),
            "first body".to_string(),
            ".".to_string(),
            "after the dot".to_string(),
        ]
    );
}

#[tokio::test]
async fn top_returns_headers_and_n_body_lines() {
    let dir = tempdir().unwrap();
    let backend = MockBackend::with_messages(vec![StoredMessage {
        id: "m1".into(),
        mime: b"Subject: t\r\nFrom: a@b.c\r\n\r\nline1\r\nline2\r\nline3\r\n".to_vec(),
    }]);
    let gateway = make_gateway(test_config(dir.path(), false), backend, true);
    let (addr, _cancel) = start_server(gateway, Proto::Pop3).await;

    let mut client = authed_client(addr).await;
    assert!(client.cmd("TOP 1 2").await.starts_with("+OK"));
    let preview = client.read_multiline().await;
    assert_eq!(
        preview,
        vec![
            "Subject: t".to_string(),
            "From: a@b.c".to_string(),
            String::new(),
            "line1".to_string(),
            "line2".to_string(),
        ]
    );
    assert!(client.cmd("TOP 1").await.starts_with("-ERR"));
}

#[tokio::test]
async fn dele_applies_only_on_quit() {
    let dir = tempdir().unwrap();
    let backend = MockBackend::with_messages(two_messages());
    let gateway = make_gateway(test_config(dir.path(), true), backend.clone(), true);
    let (addr, _cancel) = start_server(gateway, Proto::Pop3).await;

    let mut client = authed_client(addr).await;
    assert!(client.cmd("DELE 1").await.starts_with("+OK"));
    // Marked messages disappear from STAT and further access.
    assert!(client.cmd("STAT").await.starts_with("+OK 1 "));
    assert!(client.cmd("RETR 1").await.starts_with("-ERR"));
    // Nothing upstream yet.
    assert!(backend.marked_read.lock().unwrap().is_empty());
    assert!(backend.deleted.lock().unwrap().is_empty());

    assert!(client.cmd("QUIT").await.starts_with("+OK"));
    // Give the server a beat to run UPDATE after the reply.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(*backend.marked_read.lock().unwrap(), vec!["AAMkAD-first".to_string()]);
    assert_eq!(*backend.deleted.lock().unwrap(), vec!["AAMkAD-first".to_string()]);
}

#[tokio::test]
async fn dropped_connection_leaves_mailbox_unchanged() {
    let dir = tempdir().unwrap();
    let backend = MockBackend::with_messages(two_messages());
    let gateway = make_gateway(test_config(dir.path(), true), backend.clone(), true);
    let (addr, _cancel) = start_server(gateway, Proto::Pop3).await;

    let mut client = authed_client(addr).await;
    assert!(client.cmd("DELE 1").await.starts_with("+OK"));
    drop(client);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(backend.marked_read.lock().unwrap().is_empty());
    assert!(backend.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rset_clears_deletion_marks() {
    let dir = tempdir().unwrap();
    let backend = MockBackend::with_messages(two_messages());
    let gateway = make_gateway(test_config(dir.path(), true), backend.clone(), true);
    let (addr, _cancel) = start_server(gateway, Proto::Pop3).await;

    let mut client = authed_client(addr).await;
    client.cmd("DELE 1").await;
    client.cmd("DELE 2").await;
    assert!(client.cmd("RSET").await.starts_with("+OK 2 "));
    assert!(client.cmd("QUIT").await.starts_with("+OK"));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(backend.marked_read.lock().unwrap().is_empty());
    assert!(backend.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn auth_plain_binds_the_mailbox() {
    let dir = tempdir().unwrap();
    let backend = MockBackend::with_messages(two_messages());
    let gateway = make_gateway(test_config(dir.path(), false), backend, true);
    let (addr, _cancel) = start_server(gateway, Proto::Pop3).await;

    let mut client = LineClient::connect(addr).await;
    client.read_line().await;
    let reply = client
        .cmd(&format!("AUTH PLAIN {}", plain_credentials(USERNAME, PASSWORD)))
        .await;
    assert!(reply.starts_with("+OK"), "unexpected AUTH reply: {}", reply);
    assert!(client.cmd("STAT").await.starts_with("+OK 2 "));
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let dir = tempdir().unwrap();
    let backend = MockBackend::with_messages(two_messages());
    let gateway = make_gateway(test_config(dir.path(), false), backend, true);
    let (addr, _cancel) = start_server(gateway, Proto::Pop3).await;

    let mut client = LineClient::connect(addr).await;
    client.read_line().await;
    client.cmd(&format!("USER {}", USERNAME)).await;
    let reply = client.cmd("PASS not-the-password").await;
    assert!(reply.starts_with("-ERR"), "unexpected reply: {}", reply);
    // Transaction commands stay unavailable.
    assert!(client.cmd("STAT").await.starts_with("-ERR"));
}

#[tokio::test]
async fn capa_lists_capabilities() {
    let dir = tempdir().unwrap();
    let backend = MockBackend::with_messages(Vec::new());
    let gateway = make_gateway(test_config(dir.path(), false), backend, true);
    let (addr, _cancel) = start_server(gateway, Proto::Pop3).await;

    let mut client = LineClient::connect(addr).await;
    client.read_line().await;
    assert!(client.cmd("CAPA").await.starts_with("+OK"));
    let capabilities = client.read_multiline().await;
    assert!(capabilities.iter().any(|c| c == "UIDL"));
    assert!(capabilities.iter().any(|c| c == "TOP"));
    assert!(capabilities.iter().any(|c| c.starts_with("SASL")));
}
