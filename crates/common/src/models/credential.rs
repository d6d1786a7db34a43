use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A relay key bound to one tunnel identifier. Only a salted hash of the key is stored,
/// together with its first few characters for candidate lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCredential {
    pub id: String,
    pub tunnel_id: String,
    pub key_prefix: String,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RelayCredential {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Mark the credential revoked. The first revocation time is kept; a revoked
    /// credential never becomes active again.
    pub fn revoke(&mut self, at: DateTime<Utc>) {
        if self.revoked_at.is_none() {
            self.revoked_at = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credential() -> RelayCredential {
        RelayCredential {
            id: "k1".to_string(),
            tunnel_id: "nas".to_string(),
            key_prefix: "AbCdEfGh".to_string(),
            key_hash: "$argon2id$...".to_string(),
            created_at: Utc::now(),
            revoked_at: None,
        }
    }

    #[test]
    fn test_revocation_is_monotonic() {
        let mut cred = credential();
        assert!(!cred.is_revoked());

        let first = Utc::now();
        cred.revoke(first);
        cred.revoke(first + Duration::hours(1));

        assert!(cred.is_revoked());
        assert_eq!(cred.revoked_at, Some(first));
    }

    #[test]
    fn test_credential_json_omits_active_revocation() {
        let json = serde_json::to_value(credential()).unwrap();
        assert!(json.get("revokedAt").is_none());
        assert_eq!(json["keyPrefix"], "AbCdEfGh");
        assert_eq!(json["tunnelId"], "nas");
    }
}
