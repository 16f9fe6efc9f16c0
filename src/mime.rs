/*
 * mime.rs
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

//! A deliberately small MIME reader for the large-message upload path: it
//! splits a submitted message into body text and file attachments so the
//! attachments can be re-uploaded through Graph upload sessions.
//!
//! This is not a general MIME parser. Unrecognized structures degrade to
//! "one text body, no attachments", which makes the caller fall back to a
//! draft without separate attachment uploads.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::protocol::wire::{find_subslice, split_headers};

/// One decoded file attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// The pieces of a message relevant to draft creation.
#[derive(Debug, Default)]
pub struct ParsedMessage {
    pub subject: String,
    /// Plain-text body, if any part carried one.
    pub body_text: Option<String>,
    /// HTML body; preferred over text when building the draft.
    pub body_html: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Parse a raw RFC 5322 message far enough to rebuild it as a Graph draft.
pub fn parse_message(raw: &[u8]) -> ParsedMessage {
    let (header_block, body) = split_headers(raw);
    let headers = parse_headers(header_block);
    let mut parsed = ParsedMessage {
        subject: header_value(&headers, "Subject").unwrap_or_default(),
        ..ParsedMessage::default()
    };
    let content_type = header_value(&headers, "Content-Type")
        .unwrap_or_else(|| "text/plain".to_string());
    walk_part(&headers, &content_type, body, &mut parsed, 0);
    parsed
}

/// Recurse through multipart structure, collecting bodies and attachments.
fn walk_part(
    headers: &[(String, String)],
    content_type: &str,
    body: &[u8],
    out: &mut ParsedMessage,
    depth: usize,
) {
    // Bound recursion; real submissions nest alternative inside mixed.
    if depth > 4 {
        return;
    }
    let (media_type, params) = parse_content_type(content_type);
    if media_type.starts_with("multipart/") {
        let Some(boundary) = params
            .iter()
            .find(|(k, _)| k == "boundary")
            .map(|(_, v)| v.clone())
        else {
            return;
        };
        for part in split_multipart(body, &boundary) {
            let (part_header_block, part_body) = split_headers(part);
            let part_headers = parse_headers(part_header_block);
            let part_type = header_value(&part_headers, "Content-Type")
                .unwrap_or_else(|| "text/plain".to_string());
            walk_part(&part_headers, &part_type, part_body, out, depth + 1);
        }
        return;
    }

    let decoded = decode_body(headers, body);
    let disposition = header_value(headers, "Content-Disposition").unwrap_or_default();
    let is_attachment = disposition.to_ascii_lowercase().starts_with("attachment")
        || filename_from(&disposition, &params).is_some() && !media_type.starts_with("text/");
    if is_attachment {
        let name = filename_from(&disposition, &params).unwrap_or_else(|| "attachment".into());
        out.attachments.push(Attachment {
            name,
            content_type: media_type,
            data: decoded,
        });
    } else if media_type == "text/html" && out.body_html.is_none() {
        out.body_html = Some(String::from_utf8_lossy(&decoded).into_owned());
    } else if media_type.starts_with("text/") && out.body_text.is_none() {
        out.body_text = Some(String::from_utf8_lossy(&decoded).into_owned());
    } else if out.body_text.is_none() && out.body_html.is_none() && depth == 0 {
        // Unstructured single-part message of a non-text type.
        out.body_text = Some(String::from_utf8_lossy(&decoded).into_owned());
    }
}

/// Parse a header block into (name, value) pairs with RFC 5322 unfolding.
fn parse_headers(block: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(block);
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && !headers.is_empty() {
            let last = headers.last_mut().unwrap();
            last.1.push(' ');
            last.1.push_str(line.trim());
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    headers
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// Split `Content-Type` into the media type and its parameters.
fn parse_content_type(value: &str) -> (String, Vec<(String, String)>) {
    let mut parts = value.split(';');
    let media_type = parts
        .next()
        .unwrap_or("text/plain")
        .trim()
        .to_ascii_lowercase();
    let mut params = Vec::new();
    for param in parts {
        if let Some((key, val)) = param.split_once('=') {
            params.push((
                key.trim().to_ascii_lowercase(),
                val.trim().trim_matches('"').to_string(),
            ));
        }
    }
    (media_type, params)
}

/// Pull a filename from Content-Disposition or a Content-Type `name` param.
fn filename_from(disposition: &str, type_params: &[(String, String)]) -> Option<String> {
    let (_, disposition_params) = parse_content_type(disposition);
    disposition_params
        .iter()
        .find(|(k, _)| k == "filename")
        .or_else(|| type_params.iter().find(|(k, _)| k == "name"))
        .map(|(_, v)| v.clone())
}

/// Split a multipart body at its boundary markers, yielding inner parts.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{}", boundary);
    let mut parts = Vec::new();
    let mut cursor = 0usize;
    let mut current_start: Option<usize> = None;
    while let Some(pos) = find_subslice(&body[cursor..], delimiter.as_bytes()) {
        let marker = cursor + pos;
        if let Some(start) = current_start.take() {
            let mut end = marker;
            // Drop the CRLF that precedes the boundary line.
            if end >= 2 && &body[end - 2..end] == b"\r\n" {
                end -= 2;
            } else if end >= 1 && body[end - 1] == b'\n' {
                end -= 1;
            }
            if end > start {
                parts.push(&body[start..end]);
            }
        }
        let after = marker + delimiter.len();
        if body[after..].starts_with(b"--") {
            break;
        }
        // Skip to the end of the boundary line.
        let line_end = find_subslice(&body[after..], b"\n")
            .map(|p| after + p + 1)
            .unwrap_or(body.len());
        current_start = Some(line_end);
        cursor = line_end;
    }
    parts
}

/// Decode a part body per its Content-Transfer-Encoding.
fn decode_body(headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let encoding = header_value(headers, "Content-Transfer-Encoding")
        .unwrap_or_default()
        .to_ascii_lowercase();
    match encoding.as_str() {
        "base64" => {
            let compact: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b" \t\r\n".contains(b))
                .collect();
            BASE64.decode(&compact).unwrap_or_else(|_| body.to_vec())
        }
        "quoted-printable" => decode_quoted_printable(body),
        _ => body.to_vec(),
    }
}

/// Quoted-printable decoding (RFC 2045 §6.7), including soft line breaks.
fn decode_quoted_printable(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        if b == b'=' {
            if body[i + 1..].starts_with(b"\r\n") {
                i += 3;
                continue;
            }
            if body[i + 1..].starts_with(b"\n") {
                i += 2;
                continue;
            }
            if i + 2 < body.len() {
                let hex = std::str::from_utf8(&body[i + 1..i + 3]).ok();
                if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(value);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(b);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multipart_fixture() -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(
            b"From: alerts@contoso.onmicrosoft.com\r\n\
              To: ops@example.com\r\n\
              Subject: scan result\r\n\
              MIME-Version: 1.0\r\n\
              Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
              \r\n\
              --XYZ\r\n\
              Content-Type: text/plain; charset=utf-8\r\n\
              \r\n\
              See attachment.\r\n\
              --XYZ\r\n\
              Content-Type: application/pdf; name=\"scan.pdf\"\r\n\
              Content-Disposition: attachment; filename=\"scan.pdf\"\r\n\
              Content-Transfer-Encoding: base64\r\n\
              \r\n\
              JVBERi0xLjQ=\r\n\
              --XYZ--\r\n",
        );
        raw
    }

    #[test]
    fn splits_body_and_attachment() {
        let parsed = parse_message(&multipart_fixture());
        assert_eq!(parsed.subject, "scan result");
        assert_eq!(parsed.body_text.as_deref(), Some("See attachment."));
        assert_eq!(parsed.attachments.len(), 1);
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.name, "scan.pdf");
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.data, b"%PDF-1.4");
    }

    #[test]
    fn plain_message_has_no_attachments() {
        let parsed = parse_message(b"Subject: hi\r\nContent-Type: text/plain\r\n\r\nhello\r\n");
        assert_eq!(parsed.subject, "hi");
        assert_eq!(parsed.body_text.as_deref(), Some("hello\r\n"));
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn folded_headers_unfold() {
        let parsed = parse_message(b"Subject: a very\r\n long subject\r\n\r\nbody");
        assert_eq!(parsed.subject, "a very long subject");
    }

    #[test]
    fn quoted_printable_roundtrip() {
        assert_eq!(decode_quoted_printable(b"caf=C3=A9"), "caf\u{e9}".as_bytes());
        assert_eq!(decode_quoted_printable(b"soft=\r\nbreak"), b"softbreak");
    }

    #[test]
    fn html_alternative_preferred() {
        let raw = b"Subject: alt\r\n\
            Content-Type: multipart/alternative; boundary=AB\r\n\
            \r\n\
            --AB\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            plain\r\n\
            --AB\r\n\
            Content-Type: text/html\r\n\
            \r\n\
            <b>html</b>\r\n\
            --AB--\r\n";
        let parsed = parse_message(raw);
        assert_eq!(parsed.body_text.as_deref(), Some("plain"));
        assert_eq!(parsed.body_html.as_deref(), Some("<b>html</b>"));
    }
}
