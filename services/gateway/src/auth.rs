//! Gateway-facing authentication: the `X-API-Key` allow-list gate and the
//! optional client-IP allow-list, both checked before a request reaches
//! session or tenant lookup.

use std::net::IpAddr;

use axum::http::HeaderMap;

use crate::config::AuthConfig;
use crate::error::Error;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const TENANT_CLIENT_ID_HEADER: &str = "x-tenant-client-id";
pub const TENANT_CLIENT_SECRET_HEADER: &str = "x-tenant-client-secret";

/// Credentials a caller presents to bind an SSE session to a tenant.
pub struct TenantCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Checks the `X-API-Key` header against the configured allow-list using a
/// constant-time comparison, so a timing side channel can't be used to guess
/// a valid key one byte at a time.
pub fn check_api_key(headers: &HeaderMap, config: &AuthConfig) -> Result<(), Error> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::AuthError)?;

    if config.api_keys.iter().any(|key| constant_time_eq(key.as_bytes(), presented.as_bytes())) {
        Ok(())
    } else {
        Err(Error::AuthError)
    }
}

/// Checks a client IP against the configured allow-list. An empty list means
/// unrestricted.
pub fn check_ip_allow_list(client_ip: IpAddr, config: &AuthConfig) -> Result<(), Error> {
    if config.ip_allow_list.is_empty() {
        return Ok(());
    }
    let allowed = config
        .ip_allow_list
        .iter()
        .any(|entry| entry.parse::<IpAddr>().map(|ip| ip == client_ip).unwrap_or(false));
    if allowed {
        Ok(())
    } else {
        Err(Error::PermissionDenied(format!("client ip {client_ip} not in allow list")))
    }
}

/// Extracts the tenant-binding credential headers used on the initial SSE
/// handshake.
pub fn extract_tenant_credentials(headers: &HeaderMap) -> Result<TenantCredentials, Error> {
    let client_id = headers
        .get(TENANT_CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::AuthError)?
        .to_string();
    let client_secret = headers
        .get(TENANT_CLIENT_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::AuthError)?
        .to_string();
    Ok(TenantCredentials { client_id, client_secret })
}

/// Compares a presented tenant client secret against the decrypted stored
/// one in constant time, for the SSE handshake's tenant-binding check.
pub fn secrets_match(stored: &str, presented: &str) -> bool {
    constant_time_eq(stored.as_bytes(), presented.as_bytes())
}

/// Compares two byte strings in time proportional to the longer operand,
/// never short-circuiting on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
