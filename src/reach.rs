/*
 * reach.rs
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

//! Graph reachability: a periodic probe publishing a single boolean through
//! a watch channel. Subscribers (the flusher, the SMTP dispatch policy) read
//! the current value cheaply; edges wake anyone parked on `changed`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::MailBackend;

/// Probe interval while running.
const PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Read handle on the reachability state. Cloneable; each clone tracks
/// edges independently.
#[derive(Clone)]
pub struct Reachability {
    rx: watch::Receiver<bool>,
    /// Keeps the channel alive for handles created without a watcher task.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl Reachability {
    /// Current state.
    pub fn is_reachable(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the next transition. Never returns spuriously: the watcher
    /// only writes on edges. If the watcher is gone the wait parks forever;
    /// shutdown is signalled through the cancellation token instead.
    pub async fn changed(&mut self) {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// A handle pinned to a fixed state; used by tests and by setups that
    /// have no watcher.
    pub fn fixed(reachable: bool) -> Self {
        Self::manual(reachable).1
    }

    /// A handle whose state is driven by the returned sender instead of a
    /// watcher task.
    pub fn manual(reachable: bool) -> (Arc<watch::Sender<bool>>, Self) {
        let (tx, rx) = watch::channel(reachable);
        let tx = Arc::new(tx);
        (
            tx.clone(),
            Self {
                rx,
                _keepalive: Some(tx),
            },
        )
    }
}

/// Start the watcher task. The first probe fires immediately, so the state
/// is meaningful shortly after startup.
pub fn spawn_watcher(
    backend: Arc<dyn MailBackend>,
    cancel: CancellationToken,
) -> (Reachability, JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        loop {
            let reachable = backend.probe().await;
            let flipped = tx.send_if_modified(|state| {
                if *state != reachable {
                    *state = reachable;
                    true
                } else {
                    false
                }
            });
            if flipped {
                if reachable {
                    info!("Graph endpoint is reachable");
                } else {
                    info!("Graph endpoint is unreachable; queueing submissions");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            }
        }
    });
    (
        Reachability {
            rx,
            _keepalive: None,
        },
        handle,
    )
}
