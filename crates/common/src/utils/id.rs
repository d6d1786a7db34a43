use rand::RngCore;
use uuid::Uuid;

use crate::constants::{KEY_BYTES, KEY_PREFIX_LEN};
use crate::utils::encode_key;

/// Generate a unique request identifier using UUID v4
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a new relay key: random bytes in URL-safe Base64
pub fn generate_relay_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    encode_key(&bytes)
}

/// The non-secret lookup prefix of a relay key
pub fn key_prefix(key: &str) -> &str {
    match key.char_indices().nth(KEY_PREFIX_LEN) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}
