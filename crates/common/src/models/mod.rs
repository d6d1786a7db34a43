mod credential;
mod endpoint;
mod presence;

pub use credential::RelayCredential;
pub use endpoint::{EndpointConfig, normalize_base_path};
pub use presence::PresenceRecord;
