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

//! OAuth2 against the Microsoft identity platform: the device code grant and
//! encrypted persistence of the resulting tokens.

pub mod flow;
pub mod token_store;

/// Delegated scopes requested for mail operations. `offline_access` yields
/// the refresh token that keeps the gateway headless after first login.
pub const SCOPES: &[&str] = &[
    "https://graph.microsoft.com/Mail.Send",
    "https://graph.microsoft.com/Mail.Send.Shared",
    "https://graph.microsoft.com/Mail.ReadWrite",
    "https://graph.microsoft.com/Mail.ReadWrite.Shared",
    "offline_access",
];

/// OAuth2 authority for a tenant.
pub fn authority(tenant_id: &str) -> String {
    format!("https://login.microsoftonline.com/{}", tenant_id)
}
