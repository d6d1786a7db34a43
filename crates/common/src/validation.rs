//! Input validation for data that arrives from browsers and agents
//!
//! Tunnel identifiers end up in log lines, presence keys and redirect targets, so they
//! are restricted to a conservative alphabet before anything else looks at them.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Tunnel identifiers: 1-64 characters of letters, digits, `_` or `-`
static TUNNEL_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("Invalid regex"));

/// Maximum length for HTTP paths
pub const MAX_PATH_LENGTH: usize = 4096;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid tunnel ID format: {0}")]
    InvalidTunnelId(String),

    #[error("Path too long: {0} bytes (max: {1})")]
    PathTooLong(usize, usize),
}

/// Validate tunnel ID format
///
/// # Examples
///
/// ```
/// use webvpn_common::validation::validate_tunnel_id;
///
/// assert!(validate_tunnel_id("cm3k2x9ab0000qz").is_ok());
/// assert!(validate_tunnel_id("../etc").is_err());
/// ```
pub fn validate_tunnel_id(id: &str) -> Result<(), ValidationError> {
    if !TUNNEL_ID_REGEX.is_match(id) {
        return Err(ValidationError::InvalidTunnelId(
            id.chars().take(50).collect::<String>(), // Limit error message
        ));
    }
    Ok(())
}

/// Validate and sanitize an HTTP path
///
/// - Removes control characters
/// - Enforces length limits
/// - Ensures path starts with /
pub fn validate_path(path: &str) -> Result<String, ValidationError> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(ValidationError::PathTooLong(path.len(), MAX_PATH_LENGTH));
    }

    let sanitized: String = path.chars().filter(|c| !c.is_control()).collect();

    if sanitized.is_empty() {
        Ok("/".to_string())
    } else if sanitized.starts_with('/') {
        Ok(sanitized)
    } else {
        Ok(format!("/{}", sanitized))
    }
}
