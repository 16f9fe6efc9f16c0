/*
 * flusher.rs
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

//! The background flusher: drains the queue strictly in order, one entry in
//! flight at a time, only while Graph is reachable.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{fingerprint, OutboundQueue, RecentSent};
use crate::api::{ErrorClass, MailBackend};
use crate::reach::Reachability;

/// Recently delivered fingerprints kept for duplicate suppression.
const RECENT_SENT_WINDOW: usize = 1024;

/// Retry backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(900);

/// Restart backoff ceiling after a flusher crash.
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(60);

/// Spawn the flusher with crash supervision: a panicking pass is restarted
/// with exponential backoff instead of taking the gateway down.
pub fn spawn(
    queue: Arc<OutboundQueue>,
    backend: Arc<dyn MailBackend>,
    reach: Reachability,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut restart_delay = Duration::from_secs(1);
        loop {
            let task = tokio::spawn(run(
                queue.clone(),
                backend.clone(),
                reach.clone(),
                cancel.clone(),
            ));
            match task.await {
                Ok(()) => return,
                Err(join_error) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    error!("queue flusher crashed: {}; restarting in {:?}", join_error, restart_delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(restart_delay) => {}
                    }
                    restart_delay = (restart_delay * 2).min(MAX_RESTART_BACKOFF);
                }
            }
        }
    })
}

async fn run(
    queue: Arc<OutboundQueue>,
    backend: Arc<dyn MailBackend>,
    mut reach: Reachability,
    cancel: CancellationToken,
) {
    let mut recent = RecentSent::new(RECENT_SENT_WINDOW);
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if !reach.is_reachable() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = reach.changed() => {}
            }
            continue;
        }

        let next = match queue.pending() {
            Ok(paths) => paths.into_iter().next(),
            Err(e) => {
                warn!("cannot scan queue directory: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
                continue;
            }
        };
        let Some(path) = next else {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = queue.wait_for_entry() => {}
                _ = reach.changed() => {}
            }
            continue;
        };

        let entry = match queue.begin_send(&path) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("cannot pick up {}: {}", path.display(), e);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
                continue;
            }
        };

        let entry_fingerprint = fingerprint(&entry.header.envelope, &entry.mime);
        if recent.contains(&entry_fingerprint) {
            info!(
                "dropping already-delivered entry {} (fingerprint match)",
                path.display()
            );
            if let Err(e) = queue.complete(&entry) {
                warn!("cannot remove duplicate entry: {}", e);
            }
            continue;
        }

        match backend.send_mail(&entry.header.envelope, &entry.mime).await {
            Ok(()) => {
                recent.insert(entry_fingerprint);
                info!(
                    "delivered queued message from {} ({} attempt(s))",
                    entry.header.envelope.sender,
                    entry.header.attempts + 1
                );
                if let Err(e) = queue.complete(&entry) {
                    warn!("delivered but could not remove entry: {}", e);
                }
            }
            Err(mail_error) => match mail_error.class() {
                ErrorClass::Permanent => {
                    if let Err(e) = queue.fail(entry, &mail_error.to_string()) {
                        warn!("cannot move entry to failed/: {}", e);
                    }
                }
                ErrorClass::Retryable | ErrorClass::Auth => {
                    let attempts = match queue.retry_later(entry, &mail_error.to_string()) {
                        Ok(attempts) => attempts,
                        Err(e) => {
                            warn!("cannot return entry to pending: {}", e);
                            continue;
                        }
                    };
                    let delay = backoff_for(attempts);
                    warn!(
                        "queued send failed ({}); next attempt in {:?}",
                        mail_error, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
        }
    }
}

/// Exponential backoff: 2ⁿ seconds, capped at 15 minutes.
fn backoff_for(attempts: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempts.min(16));
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_for(1), Duration::from_secs(2));
        assert_eq!(backoff_for(3), Duration::from_secs(8));
        assert_eq!(backoff_for(9), Duration::from_secs(512));
        assert_eq!(backoff_for(10), MAX_BACKOFF);
        assert_eq!(backoff_for(60), MAX_BACKOFF);
    }
}
