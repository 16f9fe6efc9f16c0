/*
 * flow.rs
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

//! OAuth2 Device Authorization Grant (RFC 8628) and refresh-token exchange.
//!
//! 1. POST the device code request; receive user code + verification URL.
//! 2. Surface both to the operator through a callback.
//! 3. Poll the token endpoint until the user finishes in a browser, the code
//!    expires, or the overall deadline fires.
//!
//! Refresh exchanges reuse the same endpoint with `grant_type=refresh_token`.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{authority, SCOPES};

/// RFC 8628 grant type for device code token polling.
const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Upper bound on the whole device flow, regardless of `expires_in`.
const OVERALL_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// Ceiling for the polling interval after `slow_down` responses.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("token endpoint unreachable: {0}")]
    Http(String),
    #[error("device code expired before the user completed authentication")]
    Expired,
    #[error("the user declined the authorization request")]
    Denied,
    #[error("refresh token no longer valid: {0}")]
    RefreshRejected(String),
    #[error("unexpected token endpoint response: {0}")]
    Protocol(String),
}

/// Response from `POST …/devicecode`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    5
}

/// Successful response from the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Device code + refresh exchanges for one tenant/client registration.
pub struct DeviceFlow {
    http: reqwest::Client,
    token_url: String,
    device_code_url: String,
    client_id: String,
}

impl DeviceFlow {
    /// `http` must already carry the proxy and timeout policy; the login
    /// endpoints route through the same egress as Graph itself.
    pub fn new(http: reqwest::Client, tenant_id: &str, client_id: &str) -> Self {
        let authority = authority(tenant_id);
        Self {
            http,
            token_url: format!("{}/oauth2/v2.0/token", authority),
            device_code_url: format!("{}/oauth2/v2.0/devicecode", authority),
            client_id: client_id.to_string(),
        }
    }

    /// Step 1: obtain a device code and the user-facing verification data.
    pub async fn request_device_code(&self) -> Result<DeviceCode, FlowError> {
        let scope = SCOPES.join(" ");
        let params = [("client_id", self.client_id.as_str()), ("scope", &scope)];
        let response = self
            .http
            .post(&self.device_code_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| FlowError::Http(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FlowError::Protocol(format!(
                "device code request failed ({}): {}",
                status,
                truncate(&body)
            )));
        }
        let code: DeviceCode = response
            .json()
            .await
            .map_err(|e| FlowError::Protocol(e.to_string()))?;
        info!(
            "device code issued; user code {} at {}",
            code.user_code, code.verification_uri
        );
        Ok(code)
    }

    /// Step 2: poll until the user completes authentication.
    pub async fn poll_for_token(&self, device: &DeviceCode) -> Result<TokenResponse, FlowError> {
        let ttl = Duration::from_secs(device.expires_in).min(OVERALL_DEADLINE);
        let deadline = tokio::time::Instant::now() + ttl;
        let mut interval = Duration::from_secs(device.interval.max(1));

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(FlowError::Expired);
            }
            tokio::time::sleep(interval).await;

            let params = [
                ("client_id", self.client_id.as_str()),
                ("device_code", device.device_code.as_str()),
                ("grant_type", DEVICE_CODE_GRANT),
            ];
            let response = self
                .http
                .post(&self.token_url)
                .form(&params)
                .send()
                .await
                .map_err(|e| FlowError::Http(e.to_string()))?;

            if response.status().is_success() {
                info!("device code flow completed");
                return response
                    .json()
                    .await
                    .map_err(|e| FlowError::Protocol(e.to_string()));
            }

            let error: TokenErrorResponse = response
                .json()
                .await
                .map_err(|e| FlowError::Protocol(e.to_string()))?;
            match error.error.as_str() {
                "authorization_pending" => {
                    debug!("authorization pending");
                }
                "slow_down" => {
                    // RFC 8628 §3.5: add five seconds.
                    interval = (interval + Duration::from_secs(5)).min(MAX_POLL_INTERVAL);
                    warn!("token endpoint asked to slow down; interval now {:?}", interval);
                }
                "expired_token" => return Err(FlowError::Expired),
                "access_denied" => return Err(FlowError::Denied),
                other => {
                    return Err(FlowError::Protocol(format!(
                        "{}: {}",
                        other,
                        error.error_description.unwrap_or_default()
                    )))
                }
            }
        }
    }

    /// Exchange a refresh token for a fresh access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, FlowError> {
        let scope = SCOPES.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", &scope),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| FlowError::Http(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| FlowError::Protocol(e.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        // invalid_grant means the refresh token was revoked or aged out;
        // everything else at 4xx is treated the same way so the caller can
        // fall back to a fresh device login.
        if status.as_u16() >= 500 {
            Err(FlowError::Http(format!("status {}", status)))
        } else {
            Err(FlowError::RefreshRejected(truncate(&body)))
        }
    }
}

/// Trim response bodies before they reach logs or error chains.
fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_code_defaults_interval() {
        let parsed: DeviceCode = serde_json::from_str(
            r#"{"device_code":"d","user_code":"ABC-123","verification_uri":"https://microsoft.com/devicelogin","expires_in":900}"#,
        )
        .unwrap();
        assert_eq!(parsed.interval, 5);
    }

    #[test]
    fn token_response_tolerates_missing_refresh() {
        let parsed: TokenResponse =
            serde_json::from_str(r#"{"access_token":"at","expires_in":3599}"#).unwrap();
        assert!(parsed.refresh_token.is_none());
        assert_eq!(parsed.expires_in, Some(3599));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(300);
        let out = truncate(&long);
        assert!(out.len() <= 204);
        assert!(out.ends_with('…'));
    }
}
