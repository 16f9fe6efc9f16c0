/*
 * listener.rs
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

//! The listener supervisor: binds the enabled ports, hands each accepted
//! connection to a session task, and drains everything on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::MailBackend;
use crate::config::Config;
use crate::protocol::{pop3, smtp};
use crate::queue::OutboundQueue;
use crate::reach::Reachability;

/// How long in-flight sessions get to finish after shutdown is requested.
const DRAIN_WINDOW: Duration = Duration::from_secs(30);

/// Everything a session needs, shared across all connections.
pub struct Gateway {
    pub config: Config,
    pub backend: Arc<dyn MailBackend>,
    pub queue: Arc<OutboundQueue>,
    pub reach: Reachability,
    /// Present when TLS material is configured; enables SMTPS/POP3S and
    /// STARTTLS/STLS upgrades.
    pub tls: Option<TlsAcceptor>,
}

#[cfg(test)]
impl Gateway {
    /// A gateway over a null backend and throwaway queue, for unit tests
    /// that only exercise session logic.
    pub(crate) fn for_tests(config: Config) -> Self {
        let dir = tempfile::tempdir().unwrap().into_path();
        Gateway {
            config,
            backend: Arc::new(crate::testutil::NullBackend),
            queue: Arc::new(OutboundQueue::open(&dir).unwrap()),
            reach: Reachability::fixed(true),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Service {
    Smtp { implicit_tls: bool },
    Pop3 { implicit_tls: bool },
}

impl Service {
    fn name(self) -> &'static str {
        match self {
            Service::Smtp { implicit_tls: false } => "smtp",
            Service::Smtp { implicit_tls: true } => "smtps",
            Service::Pop3 { implicit_tls: false } => "pop3",
            Service::Pop3 { implicit_tls: true } => "pop3s",
        }
    }
}

/// Bind all configured listeners and serve until the token is cancelled.
pub async fn run(gateway: Arc<Gateway>, cancel: CancellationToken) -> std::io::Result<()> {
    let ports = &gateway.config.ports;
    let services: Vec<(Service, u16)> = [
        (Service::Smtp { implicit_tls: false }, ports.smtp),
        (Service::Smtp { implicit_tls: true }, ports.smtps),
        (Service::Pop3 { implicit_tls: false }, ports.pop3),
        (Service::Pop3 { implicit_tls: true }, ports.pop3s),
    ]
    .into_iter()
    .filter_map(|(service, port)| port.map(|p| (service, p)))
    .collect();

    let tracker = TaskTracker::new();
    for (service, port) in services {
        let address = format!("{}:{}", gateway.config.bind_address, port);
        let listener = TcpListener::bind(&address).await?;
        info!("{} listening on {}", service.name(), address);
        tracker.spawn(accept_loop(
            listener,
            service,
            gateway.clone(),
            cancel.clone(),
            tracker.clone(),
        ));
    }

    cancel.cancelled().await;
    info!("shutting down; draining sessions");
    tracker.close();
    if tokio::time::timeout(DRAIN_WINDOW, tracker.wait()).await.is_err() {
        warn!("sessions did not drain within {:?}", DRAIN_WINDOW);
    }
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    service: Service,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("{} accept failed: {}", service.name(), e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                debug!("{} connection from {}", service.name(), peer);
                let gateway = gateway.clone();
                let session_cancel = cancel.clone();
                // The inner spawn isolates session panics; the outer task
                // stays on the tracker and reports them.
                tracker.spawn(async move {
                    let handle = tokio::spawn(async move {
                        match service {
                            Service::Smtp { implicit_tls } => {
                                smtp::serve(stream, gateway, peer, implicit_tls, session_cancel).await;
                            }
                            Service::Pop3 { implicit_tls } => {
                                pop3::serve(stream, gateway, peer, implicit_tls, session_cancel).await;
                            }
                        }
                    });
                    if let Err(join_error) = handle.await {
                        warn!("{} session from {} panicked: {}", service.name(), peer, join_error);
                    }
                });
            }
        }
    }
}
