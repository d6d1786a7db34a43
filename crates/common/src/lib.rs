//! Common utilities and types for the WebVPN tunnel system
//!
//! This crate provides the agent wire protocol, shared data models and utilities used
//! by both the relay (public gateway) and the agent (colocated with the internal service).

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod utils;
pub mod validation;

// Re-export commonly used types for convenience
pub use error::{Result, TunnelError};
pub use models::{EndpointConfig, PresenceRecord, RelayCredential, normalize_base_path};
pub use protocol::{
    AgentMessage, ControlFrame, HeaderValues, ProxyFailure, ProxyRequest, ProxyResponse,
    RelayMessage,
};
pub use utils::{
    current_timestamp_millis, current_timestamp_secs, decode_body, encode_body,
    generate_relay_key, generate_request_id, header_map_to_values, key_prefix, now_rfc3339,
    values_to_header_map,
};
