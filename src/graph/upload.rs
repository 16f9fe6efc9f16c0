/*
 * upload.rs
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

//! Large-message submission: create a draft, upload each attachment (chunked
//! through an upload session when it is itself large), then send the draft.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{expect_success, requests, transport_error, GraphClient};
use crate::api::{Envelope, MailError};
use crate::mime::{self, Attachment};

/// Attachments up to this size go inline as `contentBytes`.
const INLINE_ATTACHMENT_MAX: usize = 3 * 1024 * 1024;

/// Upload-session range size.
const UPLOAD_CHUNK: usize = 4 * 1024 * 1024;

/// Budget for one uploaded range.
const RANGE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct DraftCreated {
    id: String,
}

#[derive(Deserialize)]
struct UploadSession {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
}

impl GraphClient {
    pub(crate) async fn send_large(
        &self,
        envelope: &Envelope,
        raw_mime: &[u8],
    ) -> Result<(), MailError> {
        let parsed = mime::parse_message(raw_mime);
        debug!(
            "large message from {}: {} attachment(s), {} bytes total",
            envelope.sender,
            parsed.attachments.len(),
            raw_mime.len()
        );

        let draft_url = self.user_url(&self.upstream_user, "messages");
        let draft_body = requests::draft_body(envelope, &parsed);
        let response = self
            .authorized(|http, token| http.post(&draft_url).bearer_auth(token).json(&draft_body))
            .await?;
        let draft: DraftCreated = expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| MailError::BadResponse(e.to_string()))?;

        for attachment in &parsed.attachments {
            if attachment.data.len() <= INLINE_ATTACHMENT_MAX {
                self.attach_inline(&draft.id, attachment).await?;
            } else {
                self.attach_chunked(&draft.id, attachment).await?;
            }
        }

        let send_url = self.message_url(&self.upstream_user, &draft.id, "/send");
        let response = self
            .authorized(|http, token| {
                http.post(&send_url)
                    .bearer_auth(token)
                    .header(reqwest::header::CONTENT_LENGTH, 0)
            })
            .await?;
        expect_success(response).await?;
        debug!("draft {} sent", draft.id);
        Ok(())
    }

    async fn attach_inline(&self, draft_id: &str, attachment: &Attachment) -> Result<(), MailError> {
        let url = self.message_url(&self.upstream_user, draft_id, "/attachments");
        let body = requests::file_attachment_body(attachment);
        let response = self
            .authorized(|http, token| http.post(&url).bearer_auth(token).json(&body))
            .await?;
        expect_success(response).await.map(|_| ())
    }

    async fn attach_chunked(
        &self,
        draft_id: &str,
        attachment: &Attachment,
    ) -> Result<(), MailError> {
        let url = self.message_url(
            &self.upstream_user,
            draft_id,
            "/attachments/createUploadSession",
        );
        let body = requests::upload_session_body(attachment);
        let response = self
            .authorized(|http, token| http.post(&url).bearer_auth(token).json(&body))
            .await?;
        let session: UploadSession = expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| MailError::BadResponse(e.to_string()))?;

        let total = attachment.data.len();
        let mut offset = 0usize;
        while offset < total {
            let end = (offset + UPLOAD_CHUNK).min(total);
            let chunk = attachment.data[offset..end].to_vec();
            // The upload URL is pre-authenticated; a bearer header here makes
            // the storage endpoint reject the request.
            let response = self
                .http
                .put(&session.upload_url)
                .header(
                    reqwest::header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", offset, end - 1, total),
                )
                .header(reqwest::header::CONTENT_LENGTH, chunk.len())
                .timeout(RANGE_TIMEOUT)
                .body(chunk)
                .send()
                .await
                .map_err(transport_error)?;
            expect_success(response).await?;
            debug!(
                "uploaded range {}-{} of {} for '{}'",
                offset,
                end - 1,
                total,
                attachment.name
            );
            offset = end;
        }
        Ok(())
    }
}
