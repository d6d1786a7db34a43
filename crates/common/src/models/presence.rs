use serde::{Deserialize, Serialize};

/// Presence snapshot for one tunnel identifier as shown to dashboard viewers.
/// Missing fields mean "unknown", typically because their TTL elapsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub id: String,
    pub online: bool,
    pub last_seen: Option<String>,
    pub ip: Option<String>,
    pub version: Option<String>,
    pub last_access: Option<String>,
}
