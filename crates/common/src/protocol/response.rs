use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::utils::decode_body;

/// A response header value as reported by the agent: either a single string or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    /// Iterate over every value regardless of representation
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            HeaderValues::One(value) => std::slice::from_ref(value),
            HeaderValues::Many(values) => values,
        };
        values.iter().map(String::as_str)
    }

    /// First value, if any
    pub fn first(&self) -> Option<&str> {
        self.iter().next()
    }
}

impl From<Vec<String>> for HeaderValues {
    fn from(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            HeaderValues::One(values.remove(0))
        } else {
            HeaderValues::Many(values)
        }
    }
}

/// A successful reply from the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyResponse {
    /// Must match the id of the corresponding ProxyRequest
    pub id: String,

    /// HTTP status code (200, 404, 500, etc.)
    pub status: u16,

    #[serde(default)]
    pub headers: HashMap<String, HeaderValues>,

    /// Response body encoded in Base64
    #[serde(default)]
    pub body: String,
}

impl ProxyResponse {
    /// Create a new response without headers or body
    pub fn new(id: impl Into<String>, status: u16) -> Self {
        Self {
            id: id.into(),
            status,
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    /// Check if the response has a body
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// Check if the response is successful (2xx status code)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// All values of a header, matched case-insensitively
    pub fn header_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .flat_map(|(_, values)| values.iter())
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).next()
    }

    /// Decode the wire body back into bytes
    pub fn decoded_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        decode_body(&self.body)
    }
}

/// An error reply. Agents send `{id, error}` when the local service could not be reached;
/// the relay sends the same shape for unknown ids and, without an id, for unparseable frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub error: String,
}

impl ProxyFailure {
    pub fn for_request(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            error: error.into(),
        }
    }

    pub fn without_request(error: impl Into<String>) -> Self {
        Self {
            id: None,
            error: error.into(),
        }
    }
}
