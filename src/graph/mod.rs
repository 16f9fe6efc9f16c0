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

//! The Microsoft Graph mail adapter.
//!
//! All calls go to `https://graph.microsoft.com/v1.0` with a bearer token
//! from the token store. Refresh is proactive near expiry and reactive on a
//! 401, and always single-flight: callers serialize on the token mutex, and
//! a caller that arrives after a refresh has happened reuses its result
//! instead of issuing another one.

pub mod requests;
mod upload;

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::{Envelope, MailBackend, MailError, MessageMeta};
use crate::config::Config;
use crate::oauth::flow::{DeviceFlow, FlowError, TokenResponse};
use crate::oauth::token_store::{TokenBundle, TokenStore};

/// Graph REST endpoint root.
pub const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Messages above this serialized size take the draft + upload-session path.
pub(crate) const LARGE_MESSAGE_THRESHOLD: usize = 3 * 1024 * 1024;

/// Total budget for one Graph HTTP call.
const CALL_TIMEOUT: StdDuration = StdDuration::from_secs(60);

/// Budget for the reachability probe.
const PROBE_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// MAPI `PR_MESSAGE_SIZE` exposed as a single-value extended property;
/// Graph messages have no first-class size field.
const MESSAGE_SIZE_PROPERTY: &str = "Integer 0x0E08";

/// Characters escaped when an address or message id is spliced into a path.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// Callback surfacing the device-code verification URL and user code.
pub type DevicePrompt = Box<dyn Fn(&str, &str) + Send + Sync>;

pub struct GraphClient {
    http: reqwest::Client,
    upstream_user: String,
    flow: DeviceFlow,
    store: TokenStore,
    /// In-memory token state. Holding this mutex across a refresh is what
    /// coalesces concurrent refresh attempts into a single request.
    token: Mutex<Option<TokenBundle>>,
    /// displayName → folder id, per mailbox.
    folder_ids: Mutex<HashMap<String, String>>,
    device_prompt: DevicePrompt,
}

impl GraphClient {
    pub fn new(config: &Config) -> Result<Self, MailError> {
        let http = build_http_client(config)?;
        let flow = DeviceFlow::new(http.clone(), &config.tenant_id, &config.client_id);
        let store = TokenStore::open(&config.token_file, &config.upstream_user)
            .map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            upstream_user: config.upstream_user.clone(),
            flow,
            store,
            token: Mutex::new(None),
            folder_ids: Mutex::new(HashMap::new()),
            device_prompt: Box::new(|url, code| {
                info!("to sign in, open {} and enter the code {}", url, code);
            }),
        })
    }

    /// Replace the device-code prompt (the CLI prints to the console).
    pub fn with_device_prompt(mut self, prompt: DevicePrompt) -> Self {
        self.device_prompt = prompt;
        self
    }

    /// Make sure a usable token exists, refreshing if necessary. Does not
    /// start an interactive login.
    pub async fn ensure_token(&self) -> Result<(), MailError> {
        self.access_token().await.map(|_| ())
    }

    /// Run the full device-code login and persist the resulting bundle.
    /// Blocks until the user completes authentication or the flow times out.
    pub async fn login_interactive(&self) -> Result<(), MailError> {
        let device = self.flow.request_device_code().await.map_err(flow_error)?;
        (self.device_prompt)(&device.verification_uri, &device.user_code);
        let tokens = self.flow.poll_for_token(&device).await.map_err(flow_error)?;
        let bundle = bundle_from(tokens, &self.upstream_user);
        if bundle.refresh_token.is_empty() {
            warn!("identity platform returned no refresh token; logins will not survive expiry");
        }
        if let Err(e) = self.store.save(&bundle) {
            warn!("could not persist tokens: {}", e);
        }
        *self.token.lock().await = Some(bundle);
        Ok(())
    }

    /// Drop all token state, in memory and on disk.
    pub async fn forget_tokens(&self) -> Result<(), MailError> {
        *self.token.lock().await = None;
        self.store
            .clear()
            .map_err(|e| MailError::Transport(e.to_string()))
    }

    async fn access_token(&self) -> Result<String, MailError> {
        let mut guard = self.token.lock().await;
        if guard.is_none() {
            *guard = self.store.load();
        }
        let Some(bundle) = guard.as_mut() else {
            return Err(MailError::LoginRequired(
                "no stored token; interactive sign-in needed".into(),
            ));
        };
        if !bundle.needs_refresh() {
            return Ok(bundle.access_token.clone());
        }
        self.refresh_locked(bundle).await
    }

    /// Reactive refresh after a 401. `stale` is the token the service just
    /// rejected; if the in-memory token already differs, another caller has
    /// refreshed in the meantime and that result is reused.
    async fn refresh_after_rejection(&self, stale: &str) -> Result<String, MailError> {
        let mut guard = self.token.lock().await;
        let Some(bundle) = guard.as_mut() else {
            return Err(MailError::LoginRequired(
                "token state lost; interactive sign-in needed".into(),
            ));
        };
        if bundle.access_token != stale {
            return Ok(bundle.access_token.clone());
        }
        self.refresh_locked(bundle).await
    }

    async fn refresh_locked(&self, bundle: &mut TokenBundle) -> Result<String, MailError> {
        if bundle.refresh_token.is_empty() {
            return Err(MailError::LoginRequired(
                "access token expired and no refresh token is stored".into(),
            ));
        }
        debug!("refreshing access token");
        let tokens = self
            .flow
            .refresh(&bundle.refresh_token)
            .await
            .map_err(flow_error)?;
        apply_tokens(bundle, tokens);
        if let Err(e) = self.store.save(bundle) {
            warn!("could not persist refreshed tokens: {}", e);
        }
        Ok(bundle.access_token.clone())
    }

    /// Run one authorized request, retrying exactly once through a reactive
    /// refresh when the first attempt comes back 401.
    pub(crate) async fn authorized<F>(&self, build: F) -> Result<reqwest::Response, MailError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let token = self.access_token().await?;
        let response = build(&self.http, &token)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        debug!("request rejected with 401; refreshing and retrying once");
        let token = self.refresh_after_rejection(&token).await?;
        build(&self.http, &token)
            .send()
            .await
            .map_err(transport_error)
    }

    fn user_url(&self, mailbox: &str, suffix: &str) -> String {
        format!(
            "{}/users/{}/{}",
            GRAPH_BASE,
            utf8_percent_encode(mailbox, PATH_SEGMENT),
            suffix
        )
    }

    fn message_url(&self, mailbox: &str, message_id: &str, suffix: &str) -> String {
        let tail = format!(
            "messages/{}{}",
            utf8_percent_encode(message_id, PATH_SEGMENT),
            suffix
        );
        self.user_url(mailbox, &tail)
    }

    /// Map a configured folder to something usable in a Graph URL: the
    /// well-known `inbox` directly, anything else through a displayName
    /// lookup cached for the process lifetime.
    async fn resolve_folder(&self, mailbox: &str, folder: &str) -> Result<String, MailError> {
        if folder.eq_ignore_ascii_case("inbox") {
            return Ok("inbox".to_string());
        }
        let cache_key = format!(
            "{}\u{0}{}",
            mailbox.to_ascii_lowercase(),
            folder.to_ascii_lowercase()
        );
        if let Some(id) = self.folder_ids.lock().await.get(&cache_key) {
            return Ok(id.clone());
        }
        let url = self.user_url(mailbox, "mailFolders");
        let filter = format!("displayName eq '{}'", folder.replace('\'', "''"));
        let response = self
            .authorized(|http, token| {
                http.get(&url)
                    .query(&[("$filter", filter.as_str()), ("$select", "id")])
                    .bearer_auth(token)
            })
            .await?;
        let page: FolderPage = expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| MailError::BadResponse(e.to_string()))?;
        let Some(entry) = page.value.into_iter().next() else {
            return Err(MailError::Rejected {
                status: 404,
                code: "ErrorFolderNotFound".into(),
                detail: format!("mail folder '{}' not found for {}", folder, mailbox),
            });
        };
        self.folder_ids
            .lock()
            .await
            .insert(cache_key, entry.id.clone());
        Ok(entry.id)
    }
}

#[async_trait]
impl MailBackend for GraphClient {
    async fn send_mail(&self, envelope: &Envelope, raw_mime: &[u8]) -> Result<(), MailError> {
        if raw_mime.len() > LARGE_MESSAGE_THRESHOLD {
            return self.send_large(envelope, raw_mime).await;
        }
        let url = self.user_url(&self.upstream_user, "sendMail");
        let encoded = BASE64.encode(raw_mime);
        let response = self
            .authorized(|http, token| {
                http.post(&url)
                    .bearer_auth(token)
                    .header(reqwest::header::CONTENT_TYPE, "text/plain")
                    .body(encoded.clone())
            })
            .await?;
        expect_success(response).await?;
        debug!("message from {} accepted by sendMail", envelope.sender);
        Ok(())
    }

    async fn list_messages(
        &self,
        mailbox: &str,
        folder: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageMeta>, MailError> {
        let folder_ref = self.resolve_folder(mailbox, folder).await?;
        let url = self.user_url(mailbox, &format!("mailFolders/{}/messages", folder_ref));
        let expand = format!(
            "singleValueExtendedProperties($filter=id eq '{}')",
            MESSAGE_SIZE_PROPERTY
        );
        let mut query: Vec<(&str, String)> = vec![
            ("$select", "id,receivedDateTime".to_string()),
            ("$top", "100".to_string()),
            ("$orderby", "receivedDateTime asc".to_string()),
            ("$expand", expand),
        ];
        if let Some(since) = since {
            query.push((
                "$filter",
                format!(
                    "receivedDateTime ge {}",
                    since.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            ));
        }

        let mut out = Vec::new();
        let mut next_link: Option<String> = None;
        loop {
            let response = self
                .authorized(|http, token| {
                    match &next_link {
                        // nextLink already carries the query string.
                        Some(link) => http.get(link),
                        None => http.get(&url).query(&query),
                    }
                    .bearer_auth(token)
                })
                .await?;
            let page: MessagePage = expect_success(response)
                .await?
                .json()
                .await
                .map_err(|e| MailError::BadResponse(e.to_string()))?;
            out.extend(page.value.into_iter().map(MessageMeta::from));
            match page.next_link {
                Some(link) => next_link = Some(link),
                None => break,
            }
        }
        Ok(out)
    }

    async fn fetch_mime(&self, mailbox: &str, message_id: &str) -> Result<Vec<u8>, MailError> {
        let url = self.message_url(mailbox, message_id, "/$value");
        let response = self
            .authorized(|http, token| http.get(&url).bearer_auth(token))
            .await?;
        let response = expect_success(response).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }

    async fn mark_read(&self, mailbox: &str, message_id: &str) -> Result<(), MailError> {
        let url = self.message_url(mailbox, message_id, "");
        let body = requests::mark_read_body(true);
        let response = self
            .authorized(|http, token| http.patch(&url).bearer_auth(token).json(&body))
            .await?;
        expect_success(response).await.map(|_| ())
    }

    async fn delete(&self, mailbox: &str, message_id: &str) -> Result<(), MailError> {
        let url = self.message_url(mailbox, message_id, "");
        let response = self
            .authorized(|http, token| http.delete(&url).bearer_auth(token))
            .await?;
        expect_success(response).await.map(|_| ())
    }

    async fn probe(&self) -> bool {
        // Any HTTP response (including 401) proves the path to Graph works.
        self.http
            .get(GRAPH_BASE)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .is_ok()
    }
}

/// Reject non-2xx responses, classifying them by status and Graph error code.
pub(crate) async fn expect_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, MailError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<GraphErrorBody>(&body) {
        Ok(parsed) => (parsed.error.code, parsed.error.message),
        Err(_) => (String::new(), body.chars().take(200).collect()),
    };
    Err(MailError::from_status(status.as_u16(), code, message))
}

pub(crate) fn transport_error(error: reqwest::Error) -> MailError {
    if error.is_timeout() {
        MailError::Timeout(error.to_string())
    } else {
        MailError::Transport(error.to_string())
    }
}

fn flow_error(error: FlowError) -> MailError {
    match error {
        FlowError::Http(msg) => MailError::Transport(msg),
        FlowError::Expired | FlowError::Denied => MailError::LoginRequired(error.to_string()),
        FlowError::RefreshRejected(msg) => {
            MailError::LoginRequired(format!("refresh token rejected: {}", msg))
        }
        FlowError::Protocol(msg) => MailError::BadResponse(msg),
    }
}

fn bundle_from(tokens: TokenResponse, account: &str) -> TokenBundle {
    let expires_at = Utc::now() + Duration::seconds(tokens.expires_in.unwrap_or(3600) as i64);
    TokenBundle {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token.unwrap_or_default(),
        expires_at,
        scopes: tokens.scope.unwrap_or_default(),
        account: account.to_string(),
    }
}

fn apply_tokens(bundle: &mut TokenBundle, tokens: TokenResponse) {
    bundle.access_token = tokens.access_token;
    bundle.expires_at = Utc::now() + Duration::seconds(tokens.expires_in.unwrap_or(3600) as i64);
    if let Some(refresh) = tokens.refresh_token {
        // The identity platform rotates refresh tokens; keep the newest.
        bundle.refresh_token = refresh;
    }
    if let Some(scope) = tokens.scope {
        bundle.scopes = scope;
    }
}

fn build_http_client(config: &Config) -> Result<reqwest::Client, MailError> {
    let mut builder = reqwest::Client::builder()
        .timeout(CALL_TIMEOUT)
        .connect_timeout(StdDuration::from_secs(10));
    // HTTPS_PROXY in the environment wins; reqwest picks it up by itself.
    if std::env::var_os("HTTPS_PROXY").is_none() {
        if let Some(proxy_config) = &config.proxy {
            let mut proxy = reqwest::Proxy::all(&proxy_config.url)
                .map_err(|e| MailError::Transport(format!("invalid proxy url: {}", e)))?;
            if let Some(user) = &proxy_config.user {
                proxy = proxy.basic_auth(user, proxy_config.password.as_deref().unwrap_or(""));
            }
            builder = builder.proxy(proxy);
        }
    }
    builder
        .build()
        .map_err(|e| MailError::Transport(e.to_string()))
}

// ── Response shapes ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct GraphErrorBody {
    error: GraphErrorInner,
}

#[derive(Deserialize)]
struct GraphErrorInner {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct FolderPage {
    #[serde(default)]
    value: Vec<FolderEntry>,
}

#[derive(Deserialize)]
struct FolderEntry {
    id: String,
}

#[derive(Deserialize)]
struct MessagePage {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct GraphMessage {
    id: String,
    #[serde(default, rename = "singleValueExtendedProperties")]
    properties: Vec<ExtendedProperty>,
}

#[derive(Deserialize)]
struct ExtendedProperty {
    #[serde(default)]
    id: String,
    #[serde(default)]
    value: String,
}

impl From<GraphMessage> for MessageMeta {
    fn from(message: GraphMessage) -> Self {
        let size = message
            .properties
            .iter()
            .find(|p| p.id.eq_ignore_ascii_case(MESSAGE_SIZE_PROPERTY))
            .and_then(|p| p.value.parse().ok())
            .unwrap_or(0);
        MessageMeta {
            id: message.id,
            size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_page_parses_with_next_link() {
        let raw = r#"{
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/next",
            "value": [
                {
                    "id": "AAMkAD=",
                    "singleValueExtendedProperties": [
                        { "id": "Integer 0x0e08", "value": "2048" }
                    ]
                },
                { "id": "AAMkAE=" }
            ]
        }"#;
        let page: MessagePage = serde_json::from_str(raw).unwrap();
        assert_eq!(page.next_link.as_deref(), Some("https://graph.microsoft.com/v1.0/next"));
        let metas: Vec<MessageMeta> = page.value.into_iter().map(MessageMeta::from).collect();
        assert_eq!(metas[0].id, "AAMkAD=");
        assert_eq!(metas[0].size, 2048);
        assert_eq!(metas[1].size, 0);
    }

    #[test]
    fn graph_error_body_extraction() {
        let raw = r#"{"error":{"code":"ErrorItemNotFound","message":"gone"}}"#;
        let parsed: GraphErrorBody = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.error.code, "ErrorItemNotFound");
        assert_eq!(parsed.error.message, "gone");
    }

    #[test]
    fn path_segments_are_escaped() {
        let encoded = utf8_percent_encode("odd id/with?chars", PATH_SEGMENT).to_string();
        assert_eq!(encoded, "odd%20id%2Fwith%3Fchars");
    }
}
