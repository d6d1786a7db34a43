use serde::{Deserialize, Serialize};

use super::{ProxyFailure, ProxyRequest, ProxyResponse};

/// Control frames carry no correlation id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Heartbeat,
}

/// Any frame the agent may send to the relay.
///
/// Frames are untagged JSON objects, so variant order matters: control frames are
/// recognised by their `type`, failures by their `error` field, and everything else
/// must be a full response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentMessage {
    Control(ControlFrame),
    Failure(ProxyFailure),
    Response(ProxyResponse),
}

impl AgentMessage {
    /// Parse a text frame
    pub fn parse(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Correlation id carried by the frame, if any
    pub fn request_id(&self) -> Option<&str> {
        match self {
            AgentMessage::Control(_) => None,
            AgentMessage::Failure(failure) => failure.id.as_deref(),
            AgentMessage::Response(response) => Some(&response.id),
        }
    }
}

/// Any frame the relay may send to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelayMessage {
    Request(ProxyRequest),
    Failure(ProxyFailure),
}

impl RelayMessage {
    pub fn parse(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
