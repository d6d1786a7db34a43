//! Caller authentication
//!
//! Browser callers carry a session issued by the portal: an HS256 JWT in the
//! `webvpn.session-token` cookie (`__Secure-` prefixed behind TLS) or an
//! `Authorization: Bearer` header. Agents authenticate separately with a relay key,
//! see [`crate::credentials`].

use anyhow::Result;
use http::HeaderMap;
use http::header::{AUTHORIZATION, COOKIE};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cookies::cookie_value;

/// Session cookie names, plain and `__Secure-` prefixed
pub const SESSION_COOKIES: [&str; 2] = ["webvpn.session-token", "__Secure-webvpn.session-token"];

/// Permission granting access to every user's endpoints
pub const PERMISSION_ADMIN_USERS: &str = "admin.users";

/// Permission granting endpoint and key management
pub const PERMISSION_CLIENTS_MANAGE: &str = "clients.manage";

/// JWT Claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Subject (user ID)
    pub exp: usize,  // Expiration time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>, // Issued at
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
    pub permissions: Vec<String>,
}

impl CallerIdentity {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// Admins see and reach every endpoint
    pub fn is_admin(&self) -> bool {
        self.has_permission(PERMISSION_ADMIN_USERS) || self.has_permission(PERMISSION_CLIENTS_MANAGE)
    }
}

/// Verifies portal-issued session tokens
#[derive(Clone)]
pub struct SessionVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl SessionVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Validate JWT token
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(token_data.claims)
    }

    /// Authenticate the caller of an HTTP request. Missing, invalid, expired and
    /// deactivated sessions all yield `None`.
    pub fn authenticate(&self, headers: &HeaderMap) -> Option<CallerIdentity> {
        let token = extract_session_token(headers)?;
        match self.validate_token(&token) {
            Ok(claims) if claims.active => Some(CallerIdentity {
                user_id: claims.sub,
                permissions: claims.permissions,
            }),
            Ok(claims) => {
                debug!(user_id = %claims.sub, "Session belongs to a deactivated user");
                None
            }
            Err(e) => {
                debug!("Rejected session token: {}", e);
                None
            }
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extract a session token from the request
/// Checks (in order): session cookies, Authorization header
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join("; ");

    SESSION_COOKIES
        .iter()
        .find_map(|name| cookie_value(&cookies, name))
        .or_else(|| bearer_token(headers))
}

/// Extract an agent's relay key from the handshake
/// Checks (in order): Authorization header, `key` query parameter
pub fn extract_agent_key(headers: &HeaderMap, query_key: Option<&str>) -> Option<String> {
    if let Some(token) = bearer_token(headers) {
        debug!("Agent key extracted from Authorization header");
        return Some(token);
    }

    if let Some(key) = query_key.filter(|k| !k.is_empty()) {
        // Agents commonly pass the key in the URL; proxies may log it
        debug!("Agent key extracted from query parameter");
        return Some(key.to_string());
    }

    None
}

/// Whether a caller is a browser that should be redirected to the login page
pub fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}
