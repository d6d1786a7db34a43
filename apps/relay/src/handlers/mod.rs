//! HTTP and WebSocket handlers
//!
//! Agent sessions (`connect`, `response`, `disconnect`), the tunnel gateway
//! (`forwarding`, `fallback`), and the dashboard-facing status and key endpoints.

pub mod assets;
pub mod cleanup;
pub mod connect;
pub mod disconnect;
pub mod fallback;
pub mod forwarding;
pub mod keys;
pub mod response;
pub mod status;

#[cfg(test)]
mod tests;

pub use cleanup::{liveness_loop, run_liveness_sweep};
pub use connect::agent_socket;
pub use disconnect::handle_disconnect;
pub use forwarding::proxy_tunnel;
pub use response::handle_agent_frame;
