/*
 * wire.rs
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

//! Line-oriented wire helpers shared by both engines: bounded command-line
//! reading and dot transparency (RFC 5321 §4.5.2 / RFC 1939 §3).

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// RFC 5321 §4.5.3.1.6: maximum command/text line length excluding CRLF.
pub const MAX_LINE_LEN: usize = 998;

/// Outcome of reading one protocol line.
#[derive(Debug, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line, CRLF (or bare LF) stripped.
    Line(String),
    /// The line exceeded the cap; the rest of it has been drained.
    TooLong,
    /// Peer closed the connection.
    Eof,
}

/// Read one CRLF-terminated line, enforcing `MAX_LINE_LEN`. Oversized lines
/// are consumed to their end so the session can reply and keep its framing.
pub async fn read_line<R>(reader: &mut R) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    // read_until returns on the delimiter or at EOF, never in between.
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 && buf.is_empty() {
        return Ok(LineRead::Eof);
    }
    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if buf.len() > MAX_LINE_LEN {
        return Ok(LineRead::TooLong);
    }
    Ok(LineRead::Line(String::from_utf8_lossy(&buf).into_owned()))
}

/// Write one line followed by CRLF and flush.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

/// Dot-stuff a message body for multi-line transmission and append the
/// `CRLF.CRLF` terminator. The output always ends the body with CRLF before
/// the terminating dot, even if the input did not.
pub fn stuff_and_terminate(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    let mut at_line_start = true;
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        if at_line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        at_line_start = b == b'\n';
        i += 1;
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Remove the transparency dot from one received DATA line, if present.
pub fn unstuff_line(line: &str) -> &str {
    line.strip_prefix('.').unwrap_or(line)
}

/// Split a raw message into its header block and body at the first empty
/// line. The header block keeps its trailing CRLF; the separator is dropped.
pub fn split_headers(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find_subslice(raw, b"\r\n\r\n") {
        (&raw[..pos + 2], &raw[pos + 4..])
    } else if let Some(pos) = find_subslice(raw, b"\n\n") {
        (&raw[..pos + 1], &raw[pos + 2..])
    } else {
        (raw, &[])
    }
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn read_all(input: &[u8]) -> Vec<LineRead> {
        let mut reader = BufReader::new(input);
        let mut out = Vec::new();
        loop {
            let line = read_line(&mut reader).await.unwrap();
            let eof = line == LineRead::Eof;
            out.push(line);
            if eof {
                return out;
            }
        }
    }

    #[tokio::test]
    async fn reads_crlf_lines() {
        let lines = read_all(b"EHLO printer\r\nQUIT\r\n").await;
        assert_eq!(
            lines,
            vec![
                LineRead::Line("EHLO printer".into()),
                LineRead::Line("QUIT".into()),
                LineRead::Eof,
            ]
        );
    }

    #[tokio::test]
    async fn tolerates_bare_lf() {
        let lines = read_all(b"NOOP\n").await;
        assert_eq!(lines[0], LineRead::Line("NOOP".into()));
    }

    #[tokio::test]
    async fn caps_line_length() {
        let mut input = vec![b'A'; 2000];
        input.extend_from_slice(b"\r\nNOOP\r\n");
        let lines = read_all(&input).await;
        assert_eq!(lines[0], LineRead::TooLong);
        // Framing survives: the next command parses normally.
        assert_eq!(lines[1], LineRead::Line("NOOP".into()));
    }

    #[test]
    fn stuffing_doubles_leading_dots() {
        let out = stuff_and_terminate(b"Hi\r\n.\r\nBye\r\n");
        assert_eq!(out, b"Hi\r\n..\r\nBye\r\n.\r\n");
    }

    #[test]
    fn stuffing_terminates_unterminated_body() {
        let out = stuff_and_terminate(b"no trailing newline");
        assert_eq!(out, b"no trailing newline\r\n.\r\n");
    }

    #[test]
    fn stuffing_leaves_interior_dots_alone() {
        let out = stuff_and_terminate(b"a.b\r\nc.d\r\n");
        assert_eq!(out, b"a.b\r\nc.d\r\n.\r\n");
    }

    #[test]
    fn unstuff_strips_one_dot() {
        assert_eq!(unstuff_line("..leading"), ".leading");
        assert_eq!(unstuff_line("plain"), "plain");
    }

    #[test]
    fn header_body_split() {
        let (headers, body) = split_headers(b"Subject: x\r\nTo: y\r\n\r\nbody");
        assert_eq!(headers, b"Subject: x\r\nTo: y\r\n");
        assert_eq!(body, b"body");
        let (headers, body) = split_headers(b"Subject: only headers\r\n");
        assert_eq!(headers, b"Subject: only headers\r\n");
        assert!(body.is_empty());
    }
}
