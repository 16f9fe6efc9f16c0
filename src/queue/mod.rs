/*
 * mod.rs
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

//! The durable outbound queue: one file per pending message.
//!
//! File layout: a JSON header line (envelope, enqueue time, attempt count,
//! last error) followed by the raw MIME bytes. Filenames are
//! `<zero-padded nanoseconds>-<random>.msg`, so lexicographic order is
//! enqueue order. All state transitions are renames:
//!
//!   *.tmp → *.msg        enqueue (atomic appearance)
//!   *.msg → *.sending    picked up by the flusher (in-flight marker)
//!   *.sending → gone     delivered
//!   *.sending → *.msg    retryable failure (header rewritten first)
//!   *.sending → failed/  permanent failure

pub mod flusher;

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::api::Envelope;

/// Subdirectory collecting permanently failed entries.
const FAILED_DIR: &str = "failed";

/// Header line preceding the raw MIME in every queue file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryHeader {
    pub envelope: Envelope,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// A queue entry picked up for sending (the on-disk file is `*.sending`).
#[derive(Debug)]
pub struct QueueEntry {
    /// The pending-state path the entry returns to on a retryable failure.
    msg_path: PathBuf,
    sending_path: PathBuf,
    pub header: EntryHeader,
    pub mime: Vec<u8>,
}

pub struct OutboundQueue {
    dir: PathBuf,
    /// Woken on enqueue so the flusher need not poll.
    notify: Notify,
}

impl OutboundQueue {
    /// Open (creating if needed) the queue directory and recover any entries
    /// left in-flight by a previous process.
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        fs::create_dir_all(dir.join(FAILED_DIR))?;
        let queue = Self {
            dir: dir.to_path_buf(),
            notify: Notify::new(),
        };
        queue.recover()?;
        Ok(queue)
    }

    /// Reset `*.sending` markers to pending. The fingerprint check on the
    /// next flush pass catches the "sent but not cleared" case.
    fn recover(&self) -> io::Result<()> {
        for path in self.files_with_extension("sending")? {
            let msg_path = path.with_extension("msg");
            if msg_path.exists() {
                // Both states present means the retry rewrite finished but
                // the marker removal did not; the marker is stale.
                fs::remove_file(&path)?;
            } else {
                info!("recovering in-flight entry {}", path.display());
                fs::rename(&path, &msg_path)?;
            }
        }
        Ok(())
    }

    /// Persist a message. Write to `*.tmp`, then rename: the entry either
    /// exists completely or not at all.
    pub fn enqueue(&self, envelope: &Envelope, mime: &[u8]) -> io::Result<PathBuf> {
        let header = EntryHeader {
            envelope: envelope.clone(),
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        };
        let base = self.fresh_basename()?;
        let msg_path = self.dir.join(format!("{}.msg", base));
        let tmp_path = self.dir.join(format!("{}.tmp", base));
        write_entry(&tmp_path, &header, mime)?;
        fs::rename(&tmp_path, &msg_path)?;
        info!(
            "queued message from {} for {} recipient(s) as {}",
            envelope.sender,
            envelope.recipients().count(),
            msg_path.file_name().unwrap_or_default().to_string_lossy()
        );
        self.notify.notify_one();
        Ok(msg_path)
    }

    /// Pending entries in enqueue order.
    pub fn pending(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = self.files_with_extension("msg")?;
        entries.sort();
        Ok(entries)
    }

    /// Wait until something is enqueued.
    pub async fn wait_for_entry(&self) {
        self.notify.notified().await;
    }

    /// Move one pending entry to in-flight and load it.
    pub fn begin_send(&self, msg_path: &Path) -> io::Result<QueueEntry> {
        let sending_path = msg_path.with_extension("sending");
        fs::rename(msg_path, &sending_path)?;
        let (header, mime) = read_entry(&sending_path)?;
        Ok(QueueEntry {
            msg_path: msg_path.to_path_buf(),
            sending_path,
            header,
            mime,
        })
    }

    /// The entry was delivered; drop it.
    pub fn complete(&self, entry: &QueueEntry) -> io::Result<()> {
        fs::remove_file(&entry.sending_path)
    }

    /// Return an entry to pending with an incremented attempt count. The
    /// original filename is reused so queue order is preserved.
    pub fn retry_later(&self, mut entry: QueueEntry, error: &str) -> io::Result<u32> {
        entry.header.attempts += 1;
        entry.header.last_error = Some(error.to_string());
        let tmp_path = entry.msg_path.with_extension("tmp");
        write_entry(&tmp_path, &entry.header, &entry.mime)?;
        fs::rename(&tmp_path, &entry.msg_path)?;
        fs::remove_file(&entry.sending_path)?;
        Ok(entry.header.attempts)
    }

    /// Move an entry to `failed/` with the error recorded in its header.
    pub fn fail(&self, mut entry: QueueEntry, error: &str) -> io::Result<()> {
        entry.header.attempts += 1;
        entry.header.last_error = Some(error.to_string());
        let file_name = entry
            .msg_path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "entry has no file name"))?;
        let failed_path = self.dir.join(FAILED_DIR).join(file_name);
        write_entry(&failed_path, &entry.header, &entry.mime)?;
        fs::remove_file(&entry.sending_path)?;
        warn!(
            "message from {} moved to failed/: {}",
            entry.header.envelope.sender, error
        );
        Ok(())
    }

    /// Number of pending entries, for startup logging.
    pub fn depth(&self) -> io::Result<usize> {
        Ok(self.pending()?.len())
    }

    fn files_with_extension(&self, extension: &str) -> io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map(|e| e == extension).unwrap_or(false) {
                out.push(path);
            }
        }
        Ok(out)
    }

    /// A sortable, collision-free basename: nanosecond timestamp + random.
    fn fresh_basename(&self) -> io::Result<String> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .as_nanos();
        let mut random = [0u8; 4];
        getrandom::getrandom(&mut random)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(format!("{:020}-{:08x}", nanos, u32::from_be_bytes(random)))
    }
}

fn write_entry(path: &Path, header: &EntryHeader, mime: &[u8]) -> io::Result<()> {
    let header_line = serde_json::to_string(header)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut file = fs::File::create(path)?;
    file.write_all(header_line.as_bytes())?;
    file.write_all(b"\n")?;
    file.write_all(mime)?;
    file.flush()
}

fn read_entry(path: &Path) -> io::Result<(EntryHeader, Vec<u8>)> {
    let raw = fs::read(path)?;
    let split = raw
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "queue entry has no header"))?;
    let header: EntryHeader = serde_json::from_slice(&raw[..split])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((header, raw[split + 1..].to_vec()))
}

/// Content fingerprint over (sender, sorted recipients, raw MIME), used to
/// suppress double-sends after a crash between delivery and cleanup.
pub fn fingerprint(envelope: &Envelope, mime: &[u8]) -> [u8; 32] {
    let mut recipients: Vec<String> = envelope
        .recipients()
        .map(|r| r.to_ascii_lowercase())
        .collect();
    recipients.sort();
    let mut hasher = Sha256::new();
    hasher.update(envelope.sender.to_ascii_lowercase().as_bytes());
    hasher.update([0u8]);
    for recipient in &recipients {
        hasher.update(recipient.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(mime);
    hasher.finalize().into()
}

/// Bounded set of recently delivered fingerprints.
pub struct RecentSent {
    capacity: usize,
    set: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
}

impl RecentSent {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn contains(&self, fingerprint: &[u8; 32]) -> bool {
        self.set.contains(fingerprint)
    }

    pub fn insert(&mut self, fingerprint: [u8; 32]) {
        if !self.set.insert(fingerprint) {
            return;
        }
        self.order.push_back(fingerprint);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn envelope() -> Envelope {
        let mut envelope = Envelope::new("alerts@contoso.onmicrosoft.com");
        envelope.to.push("ops@example.com".into());
        envelope
    }

    #[test]
    fn enqueue_and_read_back() {
        let dir = tempdir().unwrap();
        let queue = OutboundQueue::open(dir.path()).unwrap();
        let path = queue.enqueue(&envelope(), b"Subject: x\r\n\r\nbody").unwrap();
        assert!(path.exists());
        let entry = queue.begin_send(&path).unwrap();
        assert_eq!(entry.header.envelope.sender, "alerts@contoso.onmicrosoft.com");
        assert_eq!(entry.header.attempts, 0);
        assert_eq!(entry.mime, b"Subject: x\r\n\r\nbody");
        assert!(!path.exists());
    }

    #[test]
    fn pending_is_fifo() {
        let dir = tempdir().unwrap();
        let queue = OutboundQueue::open(dir.path()).unwrap();
        let first = queue.enqueue(&envelope(), b"first").unwrap();
        let second = queue.enqueue(&envelope(), b"second").unwrap();
        assert_eq!(queue.pending().unwrap(), vec![first, second]);
    }

    #[test]
    fn retry_preserves_order_and_counts_attempts() {
        let dir = tempdir().unwrap();
        let queue = OutboundQueue::open(dir.path()).unwrap();
        let first = queue.enqueue(&envelope(), b"first").unwrap();
        let _second = queue.enqueue(&envelope(), b"second").unwrap();

        let entry = queue.begin_send(&first).unwrap();
        let attempts = queue.retry_later(entry, "503 from upstream").unwrap();
        assert_eq!(attempts, 1);

        // Still first in line, with the error recorded.
        let pending = queue.pending().unwrap();
        assert_eq!(pending[0], first);
        let entry = queue.begin_send(&pending[0]).unwrap();
        assert_eq!(entry.header.attempts, 1);
        assert_eq!(entry.header.last_error.as_deref(), Some("503 from upstream"));
        assert_eq!(entry.mime, b"first");
    }

    #[test]
    fn complete_removes_entry() {
        let dir = tempdir().unwrap();
        let queue = OutboundQueue::open(dir.path()).unwrap();
        let path = queue.enqueue(&envelope(), b"x").unwrap();
        let entry = queue.begin_send(&path).unwrap();
        queue.complete(&entry).unwrap();
        assert!(queue.pending().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join(FAILED_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn fail_moves_to_failed_dir() {
        let dir = tempdir().unwrap();
        let queue = OutboundQueue::open(dir.path()).unwrap();
        let path = queue.enqueue(&envelope(), b"x").unwrap();
        let entry = queue.begin_send(&path).unwrap();
        queue.fail(entry, "550 rejected").unwrap();
        assert!(queue.pending().unwrap().is_empty());
        let failed: Vec<_> = std::fs::read_dir(dir.path().join(FAILED_DIR))
            .unwrap()
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn reopen_recovers_in_flight_entries() {
        let dir = tempdir().unwrap();
        let path;
        {
            let queue = OutboundQueue::open(dir.path()).unwrap();
            path = queue.enqueue(&envelope(), b"x").unwrap();
            let _entry = queue.begin_send(&path).unwrap();
            // Simulated crash: the .sending marker is left behind.
        }
        let queue = OutboundQueue::open(dir.path()).unwrap();
        assert_eq!(queue.pending().unwrap(), vec![path]);
    }

    #[test]
    fn fingerprint_ignores_recipient_order() {
        let mut a = envelope();
        a.to.push("second@example.com".into());
        let mut b = Envelope::new("alerts@contoso.onmicrosoft.com");
        b.to.push("second@example.com".into());
        b.to.push("ops@example.com".into());
        assert_eq!(fingerprint(&a, b"mime"), fingerprint(&b, b"mime"));
        assert_ne!(fingerprint(&a, b"mime"), fingerprint(&a, b"other"));
    }

    #[test]
    fn recent_sent_evicts_oldest() {
        let mut recent = RecentSent::new(2);
        let fp = |n: u8| {
            let mut f = [0u8; 32];
            f[0] = n;
            f
        };
        recent.insert(fp(1));
        recent.insert(fp(2));
        recent.insert(fp(3));
        assert!(!recent.contains(&fp(1)));
        assert!(recent.contains(&fp(2)));
        assert!(recent.contains(&fp(3)));
    }
}
