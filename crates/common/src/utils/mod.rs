mod encoding;
mod headers;
mod id;
mod time;

pub use encoding::{decode_body, encode_body, encode_key};
pub use headers::{header_map_to_values, values_to_header_map};
pub use id::{generate_relay_key, generate_request_id, key_prefix};
pub use time::{current_timestamp_millis, current_timestamp_secs, now_rfc3339};
