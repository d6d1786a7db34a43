mod message;
mod request;
mod response;

pub use message::{AgentMessage, ControlFrame, RelayMessage};
pub use request::ProxyRequest;
pub use response::{HeaderValues, ProxyFailure, ProxyResponse};
