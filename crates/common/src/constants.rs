/// Lifetime of the `online` presence flag; refreshed by heartbeats and the liveness sweep
pub const ONLINE_TTL_SECS: u64 = 30;

/// Lifetime of last-seen / ip / version / last-access presence fields (24 hours)
pub const STATUS_TTL_SECS: u64 = 86_400;

/// Interval at which the agent sends `{"type":"heartbeat"}` frames
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Default deadline for a dispatched request
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Interval of the relay liveness sweep
pub const LIVENESS_SWEEP_INTERVAL_SECS: u64 = 10;

/// Interval of the status push to dashboard viewers
pub const STATUS_BROADCAST_INTERVAL_SECS: u64 = 5;

/// Number of leading characters of a relay key stored in clear for candidate lookup
pub const KEY_PREFIX_LEN: usize = 8;

/// Random bytes in a freshly issued relay key
pub const KEY_BYTES: usize = 32;

/// Maximum request/response body size buffered by the gateway (32 MB)
pub const MAX_BODY_SIZE_BYTES: usize = 32 * 1024 * 1024;

/// Bytes inspected when sniffing an untyped body for HTML
pub const HTML_SNIFF_BYTES: usize = 512;

/// Lifetime of the `webvpn_tunnel` routing cookie
pub const TUNNEL_COOKIE_MAX_AGE_SECS: u64 = 300;

/// Frames buffered per agent connection before dispatch applies backpressure
pub const OUTBOUND_BUFFER_FRAMES: usize = 256;

/// WebSocket close code: no credential supplied
pub const CLOSE_MISSING_KEY: u16 = 4001;

/// WebSocket close code: credential did not match any active key
pub const CLOSE_INVALID_KEY: u16 = 4003;

/// WebSocket close code: credential store unavailable
pub const CLOSE_SERVER_ERROR: u16 = 1011;

/// Minimum delay for exponential backoff reconnection (1 second)
pub const RECONNECT_MIN_DELAY_MS: u64 = 1000;

/// Maximum delay for exponential backoff reconnection (60 seconds)
pub const RECONNECT_MAX_DELAY_MS: u64 = 60000;

/// Multiplier for exponential backoff reconnection
pub const RECONNECT_MULTIPLIER: f64 = 2.0;
