/*
 * requests.rs
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

//! JSON request body builders for Microsoft Graph API calls.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::api::Envelope;
use crate::mime::{Attachment, ParsedMessage};

/// Body for `PATCH …/messages/{id}` setting the read flag.
pub fn mark_read_body(is_read: bool) -> Value {
    json!({ "isRead": is_read })
}

/// Body for `POST /users/{user}/messages` creating a draft for the
/// large-message path. Recipients come from the envelope (the headers inside
/// the MIME stay authoritative for display; bcc only exists here).
pub fn draft_body(envelope: &Envelope, parsed: &ParsedMessage) -> Value {
    let (content_type, content) = match (&parsed.body_html, &parsed.body_text) {
        (Some(html), _) => ("HTML", html.as_str()),
        (None, Some(text)) => ("Text", text.as_str()),
        (None, None) => ("Text", ""),
    };
    json!({
        "subject": parsed.subject,
        "body": { "contentType": content_type, "content": content },
        "from": recipient(&envelope.sender),
        "toRecipients": recipient_array(&envelope.to),
        "ccRecipients": recipient_array(&envelope.cc),
        "bccRecipients": recipient_array(&envelope.bcc),
    })
}

/// Body for `POST …/attachments`: one inline file attachment.
pub fn file_attachment_body(attachment: &Attachment) -> Value {
    json!({
        "@odata.type": "#microsoft.graph.fileAttachment",
        "name": attachment.name,
        "contentType": attachment.content_type,
        "contentBytes": BASE64.encode(&attachment.data),
    })
}

/// Body for `POST …/attachments/createUploadSession`.
pub fn upload_session_body(attachment: &Attachment) -> Value {
    json!({
        "AttachmentItem": {
            "attachmentType": "file",
            "name": attachment.name,
            "contentType": attachment.content_type,
            "size": attachment.data.len(),
        }
    })
}

fn recipient_array(addresses: &[String]) -> Value {
    Value::Array(addresses.iter().map(|a| recipient(a)).collect())
}

fn recipient(address: &str) -> Value {
    json!({ "emailAddress": { "address": address } })
}
