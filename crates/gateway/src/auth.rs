//! HTTP Basic authentication against a static credential table.

use crate::error::{ApiError, BAD_CREDENTIALS, NOT_AUTHENTICATED};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Credential entry `{0}` is missing `:`")]
    MissingSeparator(String),
    #[error("Credential entry `{0}` has an empty username")]
    EmptyUsername(String),
}

/// Username to password, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct CredentialTable {
    entries: HashMap<String, String>,
}

impl CredentialTable {
    /// Parse `user:pass,user2:pass2`. Each entry splits on its first `:`, so
    /// passwords may contain colons. A repeated username keeps the last entry.
    pub fn parse(spec: &str) -> Result<Self, CredentialError> {
        let mut entries = HashMap::new();

        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (username, password) = entry
                .split_once(':')
                .ok_or_else(|| CredentialError::MissingSeparator(entry.to_string()))?;
            if username.is_empty() {
                return Err(CredentialError::EmptyUsername(entry.to_string()));
            }
            entries.insert(username.to_string(), password.to_string());
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn verify(&self, username: &str, password: &str) -> bool {
        match self.entries.get(username) {
            Some(expected) => constant_time_compare(expected, password),
            None => false,
        }
    }
}

/// Whether requests need credentials at all.
#[derive(Debug, Clone, Default)]
pub enum AccessGate {
    #[default]
    Disabled,
    Enabled(CredentialTable),
}

impl AccessGate {
    /// Build the gate from the `--api-auth` value. Absent, blank, or
    /// entry-less values disable authentication.
    pub fn from_config(api_auth: Option<&str>) -> Result<Self, CredentialError> {
        let Some(spec) = api_auth.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Self::Disabled);
        };

        let table = CredentialTable::parse(spec)?;
        if table.is_empty() {
            Ok(Self::Disabled)
        } else {
            Ok(Self::Enabled(table))
        }
    }

    pub fn is_required(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }

    /// Check a request's headers.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Self::Enabled(table) = self else {
            return Ok(());
        };

        let (username, password) = basic_credentials(headers)
            .ok_or_else(|| ApiError::Unauthorized(NOT_AUTHENTICATED.to_string()))?;
        if table.verify(&username, &password) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized(BAD_CREDENTIALS.to_string()))
        }
    }
}

/// Extract `(username, password)` from an `Authorization: Basic` header.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Constant-time string comparison. Length is not hidden.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }

    result == 0
}

/// Middleware rejecting requests that fail [`AccessGate::check`].
pub async fn require_credentials(
    State(gate): State<Arc<AccessGate>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    gate.check(request.headers())?;
    Ok(next.run(request).await)
}
