use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::utils::{decode_body, encode_body};

/// A request frame sent by the relay to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// Correlation id, unique among the outstanding requests of one connection
    pub id: String,

    /// HTTP method (GET, POST, PUT, DELETE, etc.)
    pub method: String,

    /// Upstream path including the query string
    /// Example: "/app/api/v1/users?limit=10"
    pub path: String,

    /// Whitelisted request headers, one value per name
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body encoded in Base64
    /// Empty string for requests without body
    #[serde(default)]
    pub body: String,
}

impl ProxyRequest {
    /// Create a request without headers or body
    pub fn new(id: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    /// Attach raw body bytes, encoding them for the wire
    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = encode_body(body);
        self
    }

    /// Check if the request has a body
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// Decode the wire body back into bytes
    pub fn decoded_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        decode_body(&self.body)
    }
}
