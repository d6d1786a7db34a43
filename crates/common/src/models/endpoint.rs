use serde::{Deserialize, Serialize};

/// Routing data for one tunnel identifier, owned by the administrative layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Tunnel identifier
    pub id: String,

    /// Port of the internal service next to the agent
    pub upstream_port: u16,

    /// Path prefix the upstream application is mounted under, if any
    #[serde(default)]
    pub upstream_base_path: Option<String>,

    #[serde(default = "default_active")]
    pub active: bool,

    /// User id of the owner, for authorization
    pub owner_id: String,
}

fn default_active() -> bool {
    true
}

impl EndpointConfig {
    /// Normalized upstream base path; empty when the app is served from the root
    pub fn normalized_base_path(&self) -> String {
        self.upstream_base_path
            .as_deref()
            .map(normalize_base_path)
            .unwrap_or_default()
    }
}

/// Normalize a mount prefix: leading slash, no trailing slash, "/" means none.
///
/// ```
/// use webvpn_common::normalize_base_path;
///
/// assert_eq!(normalize_base_path(" app/ "), "/app");
/// assert_eq!(normalize_base_path("/"), "");
/// ```
pub fn normalize_base_path(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut base = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };
    while base.len() > 1 && base.ends_with('/') {
        base.pop();
    }
    if base == "/" { String::new() } else { base }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_path() {
        assert_eq!(normalize_base_path(""), "");
        assert_eq!(normalize_base_path("   "), "");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path("//"), "");
        assert_eq!(normalize_base_path("grafana"), "/grafana");
        assert_eq!(normalize_base_path("/grafana/"), "/grafana");
        assert_eq!(normalize_base_path("/a/b"), "/a/b");
    }

    #[test]
    fn test_endpoint_config_json() {
        let json = r#"{"id":"nas","upstreamPort":8080,"upstreamBasePath":"ui/","ownerId":"u1"}"#;
        let endpoint: EndpointConfig = serde_json::from_str(json).unwrap();

        assert!(endpoint.active);
        assert_eq!(endpoint.upstream_port, 8080);
        assert_eq!(endpoint.normalized_base_path(), "/ui");
    }

    #[test]
    fn test_endpoint_without_base_path() {
        let json = r#"{"id":"nas","upstreamPort":80,"active":false,"ownerId":"u1"}"#;
        let endpoint: EndpointConfig = serde_json::from_str(json).unwrap();

        assert!(!endpoint.active);
        assert_eq!(endpoint.normalized_base_path(), "");
    }
}
