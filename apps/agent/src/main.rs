use anyhow::{Context, Result, bail};
use clap::Parser;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use reqwest::Client;
use reqwest::header::{HOST, HeaderValue};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::Message as WsMessage,
    tungstenite::protocol::CloseFrame,
    tungstenite::protocol::frame::coding::CloseCode,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;
use webvpn_common::{
    ControlFrame, ProxyFailure, ProxyRequest, ProxyResponse, RelayMessage, TunnelError,
    constants::{
        CLOSE_INVALID_KEY, CLOSE_MISSING_KEY, HEARTBEAT_INTERVAL_SECS, RECONNECT_MAX_DELAY_MS,
        RECONNECT_MIN_DELAY_MS, RECONNECT_MULTIPLIER, REQUEST_TIMEOUT_SECS,
    },
    encode_body, header_map_to_values,
};

type WebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Request headers that are never copied onto the local request
const SKIPPED_HEADERS: [&str; 4] = ["host", "content-length", "connection", "transfer-encoding"];

/// CLI arguments for the tunnel agent
#[derive(Parser, Debug)]
#[command(name = "webvpn-agent")]
#[command(about = "Expose a local HTTP service through a WebVPN relay", long_about = None)]
#[command(version)]
struct Args {
    /// Relay URL, including any base path (e.g. https://portal.example/vpn)
    #[arg(short, long, env = "WEBVPN_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Relay key issued for this tunnel
    #[arg(short, long, env = "WEBVPN_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Local port to forward requests to
    #[arg(short, long, default_value = "80")]
    port: u16,

    /// Local host address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Version reported to the relay
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    version: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Connection timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Request timeout in seconds
    #[arg(long, default_value_t = REQUEST_TIMEOUT_SECS)]
    request_timeout: u64,
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct Config {
    /// Local service address (e.g., "http://127.0.0.1:3000")
    pub local_address: String,

    /// Host header sent to the local service
    pub local_host: String,

    /// Relay WebSocket URL, key and version included
    pub websocket_url: Url,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Request timeout when calling local service
    pub request_timeout: Duration,

    /// Heartbeat interval
    pub heartbeat_interval: Duration,

    /// Reconnection strategy
    pub reconnect_config: ReconnectConfig,
}

/// Reconnection configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl ReconnectConfig {
    fn next_delay(&self, current: Duration) -> Duration {
        Duration::from_millis(
            ((current.as_millis() as f64 * self.multiplier).min(self.max_delay.as_millis() as f64))
                as u64,
        )
    }

    /// Delay to carry into the next attempt once a session has ended. A rejected key
    /// keeps the accumulated backoff.
    fn delay_after(&self, current: Duration, end: SessionEnd) -> Duration {
        match end {
            SessionEnd::Dropped => self.min_delay,
            SessionEnd::Rejected => current,
        }
    }
}

/// How an established relay session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Connection lost or closed by the relay; worth retrying promptly
    Dropped,
    /// The relay refused the key
    Rejected,
}

impl Config {
    fn from_args(args: Args) -> Result<Self> {
        let key = match args.key {
            Some(key) if !key.trim().is_empty() => key,
            _ => bail!("A relay key is required (--key or WEBVPN_KEY)"),
        };

        Ok(Self {
            local_address: format!("http://{}:{}", args.host, args.port),
            local_host: args.host,
            websocket_url: relay_socket_url(&args.server, &key, &args.version)?,
            connect_timeout: Duration::from_secs(args.connect_timeout),
            request_timeout: Duration::from_secs(args.request_timeout),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            reconnect_config: ReconnectConfig {
                min_delay: Duration::from_millis(RECONNECT_MIN_DELAY_MS),
                max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
                multiplier: RECONNECT_MULTIPLIER,
            },
        })
    }
}

/// `{server}/ws?key=..&version=..` with the scheme switched to ws/wss
fn relay_socket_url(server: &str, key: &str, version: &str) -> Result<Url> {
    let mut url = Url::parse(server).with_context(|| format!("Invalid server URL {}", server))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => bail!("Unsupported server URL scheme {}", other),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Cannot use scheme {} for {}", scheme, server))?;

    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_fragment(None);
    {
        let mut query = url.query_pairs_mut();
        query.clear().append_pair("key", key);
        if !version.is_empty() {
            query.append_pair("version", version);
        }
    }
    Ok(url)
}

/// The relay URL with credentials removed, for log lines
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

/// HTTP access to the local service
pub struct LocalService {
    client: Client,
    base_url: String,
    host: String,
}

impl LocalService {
    pub fn new(config: &Config) -> Result<Self> {
        // Redirects and compressed bodies go back to the relay untouched
        let client = Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.local_address.clone(),
            host: config.local_host.clone(),
        })
    }

    /// Forward one request frame and build the reply frame
    pub async fn reply_for(&self, request: ProxyRequest) -> String {
        let start_time = Instant::now();
        let request_id = request.id.clone();

        let reply = match self.forward(&request).await {
            Ok(response) => {
                debug!(
                    "Response: {} {} -> {} ({}ms)",
                    request.method,
                    request.path,
                    response.status,
                    start_time.elapsed().as_millis()
                );
                serde_json::to_string(&response)
            }
            Err(e) => {
                warn!("Local service error for {} {}: {:#}", request.method, request.path, e);
                serde_json::to_string(&ProxyFailure::for_request(request_id, e.to_string()))
            }
        };

        reply.unwrap_or_else(|e| {
            error!("Failed to serialize reply: {}", e);
            r#"{"error":"Failed to serialize reply"}"#.to_string()
        })
    }

    async fn forward(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TunnelError::InvalidMessage(format!("Unsupported HTTP method: {}", request.method)))?;
        let url = format!("{}{}", self.base_url, request.path);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = builder.header(HOST, HeaderValue::from_str(&self.host)?);

        if request.has_body() {
            builder = builder.body(request.decoded_body().map_err(TunnelError::from)?);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TunnelError::LocalServiceUnavailable(e.to_string()))?;

        let mut reply = ProxyResponse::new(request.id.clone(), response.status().as_u16());
        reply.headers = header_map_to_values(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| TunnelError::HttpError(e.to_string()))?;
        reply.body = encode_body(&body);
        Ok(reply)
    }
}

/// Connection manager handles WebSocket lifecycle and reconnection
pub struct ConnectionManager {
    config: Config,
    local: Arc<LocalService>,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Result<Self> {
        let local = Arc::new(LocalService::new(&config)?);
        Ok(Self { config, local })
    }

    /// Main run loop with automatic reconnection
    pub async fn run(&self) -> Result<()> {
        let mut reconnect_delay = self.config.reconnect_config.min_delay;
        let mut attempt = 0;

        loop {
            match self.establish_connection().await {
                Ok(ws_stream) => {
                    info!("Connected to relay {}", redacted(&self.config.websocket_url));

                    // Handle the connection until it drops
                    let end = self.handle_connection(ws_stream).await;
                    if end == SessionEnd::Dropped {
                        attempt = 0;
                    }
                    reconnect_delay = self
                        .config
                        .reconnect_config
                        .delay_after(reconnect_delay, end);
                }
                Err(e) => {
                    error!("Failed to connect: {}", e);
                }
            }

            attempt += 1;
            info!(
                "Reconnecting in {:?} (attempt {})",
                reconnect_delay, attempt
            );
            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = self.config.reconnect_config.next_delay(reconnect_delay);
        }
    }

    async fn establish_connection(&self) -> Result<WebSocket> {
        debug!("Connecting to {}", redacted(&self.config.websocket_url));

        let connect = connect_async(self.config.websocket_url.as_str());
        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| TunnelError::ConnectionError("Connection timeout".to_string()))?
            .map_err(|e| TunnelError::ConnectionError(e.to_string()))?;

        Ok(ws_stream)
    }

    /// Handle active WebSocket connection with split read/write tasks
    async fn handle_connection(&self, ws_stream: WebSocket) -> SessionEnd {
        let (write, read) = ws_stream.split();

        let (outgoing_tx, outgoing_rx) = mpsc::channel(100);

        let mut write_handle = tokio::spawn(spawn_write_task(write, outgoing_rx));

        let mut read_handle = tokio::spawn(spawn_read_task(
            read,
            outgoing_tx.clone(),
            self.local.clone(),
        ));

        let mut heartbeat_handle = tokio::spawn(spawn_heartbeat_task(
            outgoing_tx,
            self.config.heartbeat_interval,
        ));

        // Whichever task ends first means the connection is gone
        let end = tokio::select! {
            result = &mut write_handle => {
                warn!("Write task ended: {:?}", result);
                SessionEnd::Dropped
            }
            result = &mut read_handle => match result {
                Ok(Ok(end)) => end,
                other => {
                    warn!("Read task ended: {:?}", other);
                    SessionEnd::Dropped
                }
            },
            result = &mut heartbeat_handle => {
                warn!("Heartbeat task ended: {:?}", result);
                SessionEnd::Dropped
            }
        };

        write_handle.abort();
        read_handle.abort();
        heartbeat_handle.abort();

        end
    }
}

/// Write task sends outgoing messages through WebSocket
async fn spawn_write_task(
    mut write: SplitSink<WebSocket, WsMessage>,
    mut outgoing_rx: mpsc::Receiver<WsMessage>,
) -> Result<()> {
    while let Some(message) = outgoing_rx.recv().await {
        if let Err(e) = write.send(message).await {
            error!("Failed to send message: {}", e);
            break;
        }
    }

    debug!("Write task exiting");
    Ok(())
}

/// Read task receives incoming messages and dispatches them
async fn spawn_read_task(
    mut read: SplitStream<WebSocket>,
    outgoing_tx: mpsc::Sender<WsMessage>,
    local: Arc<LocalService>,
) -> Result<SessionEnd> {
    while let Some(message) = read.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                handle_text_message(&text, &outgoing_tx, &local).await?;
            }
            Ok(WsMessage::Binary(data)) => {
                handle_text_message(&String::from_utf8_lossy(&data), &outgoing_tx, &local).await?;
            }
            Ok(WsMessage::Ping(data)) => {
                if let Err(e) = outgoing_tx.send(WsMessage::Pong(data)).await {
                    error!("Failed to send pong: {}", e);
                    break;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                debug!("Read task exiting");
                return Ok(close_outcome(frame.as_ref()));
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    debug!("Read task exiting");
    Ok(SessionEnd::Dropped)
}

fn is_rejection(code: CloseCode) -> bool {
    matches!(u16::from(code), CLOSE_MISSING_KEY | CLOSE_INVALID_KEY)
}

fn close_outcome(frame: Option<&CloseFrame>) -> SessionEnd {
    match frame {
        Some(frame) if is_rejection(frame.code) => {
            error!("Relay rejected the key: {} ({})", frame.reason, u16::from(frame.code));
            SessionEnd::Rejected
        }
        Some(frame) => {
            info!("Relay closed connection: {}", frame.reason);
            SessionEnd::Dropped
        }
        None => {
            info!("Relay closed connection");
            SessionEnd::Dropped
        }
    }
}

/// Reply to frames that are not a usable request
fn invalid_request_reply(id: Option<String>) -> Result<String> {
    let failure = match id {
        Some(id) => ProxyFailure::for_request(id, "Invalid request"),
        None => ProxyFailure::without_request("Invalid request"),
    };
    Ok(serde_json::to_string(&failure)?)
}

/// Request id of a frame that failed to parse, when it still names one
fn malformed_frame_id(text: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("id")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Handle incoming text messages
async fn handle_text_message(
    text: &str,
    outgoing_tx: &mpsc::Sender<WsMessage>,
    local: &Arc<LocalService>,
) -> Result<()> {
    let request = match RelayMessage::parse(text) {
        Ok(RelayMessage::Request(request)) if !request.id.is_empty() => request,
        Ok(RelayMessage::Request(_)) | Err(_) => {
            warn!("Ignoring malformed frame from relay");
            let reply = invalid_request_reply(malformed_frame_id(text))?;
            outgoing_tx
                .send(WsMessage::Text(reply.into()))
                .await
                .map_err(|e| TunnelError::WebSocketError(e.to_string()))?;
            return Ok(());
        }
        Ok(RelayMessage::Failure(failure)) => {
            warn!("Relay reported: {} (request_id: {:?})", failure.error, failure.id);
            return Ok(());
        }
    };

    debug!("Received request: {} {}", request.method, request.path);

    // Requests are served concurrently; replies are matched by id
    let local = local.clone();
    let outgoing_tx = outgoing_tx.clone();
    tokio::spawn(async move {
        let reply = local.reply_for(request).await;
        if let Err(e) = outgoing_tx.send(WsMessage::Text(reply.into())).await {
            error!("Failed to queue reply: {}", e);
        }
    });

    Ok(())
}

/// Heartbeat task keeps the relay's presence record fresh
async fn spawn_heartbeat_task(
    outgoing_tx: mpsc::Sender<WsMessage>,
    interval: Duration,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    let heartbeat = serde_json::to_string(&ControlFrame::Heartbeat)?;

    loop {
        ticker.tick().await;

        if let Err(e) = outgoing_tx
            .send(WsMessage::Text(heartbeat.clone().into()))
            .await
        {
            error!("Failed to send heartbeat: {}", e);
            break;
        }

        debug!("Sent heartbeat");
    }

    debug!("Heartbeat task exiting");
    Ok(())
}

/// Log level used when `RUST_LOG` is unset
fn default_log_level(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_level(args.verbose))),
        )
        .with_target(false)
        .init();

    info!("WebVPN agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Local service: {}:{}", args.host, args.port);

    let config = Config::from_args(args)?;
    info!("Relay: {}", redacted(&config.websocket_url));

    let manager = ConnectionManager::new(config)?;

    tokio::select! {
        result = manager.run() => {
            error!("Connection manager exited: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
        }
    }

    Ok(())
}
