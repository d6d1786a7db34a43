use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};

/// Encode bytes to Base64 string for a wire frame body
pub fn encode_body(body: &[u8]) -> String {
    STANDARD.encode(body)
}

/// Decode a wire frame body
pub fn decode_body(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}

/// Encode key material so it can travel in a query string
pub fn encode_key(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode_body(&[]), "");
        assert_eq!(decode_body("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_encode_html() {
        let encoded = encode_body(b"<html></html>");
        assert_eq!(encoded, "PGh0bWw+PC9odG1sPg==");
        assert_eq!(decode_body(&encoded).unwrap(), b"<html></html>");
    }

    #[test]
    fn test_binary_body_survives() {
        let original: Vec<u8> = (0..=255).collect();
        assert_eq!(decode_body(&encode_body(&original)).unwrap(), original);
    }

    #[test]
    fn test_decode_invalid_base64() {
        assert!(decode_body("This is not valid base64!!!").is_err());
        assert!(decode_body("SGVsbG8").is_err()); // Missing padding
    }

    #[test]
    fn test_encode_key_is_url_safe() {
        let encoded = encode_key(&[0xfb, 0xff, 0xfe, 0x00]);
        assert_eq!(encoded, "-__-AA");
        assert!(!encoded.contains('='));
    }
}
