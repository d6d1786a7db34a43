use anyhow::{Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use webvpn_common::constants::{LIVENESS_SWEEP_INTERVAL_SECS, REQUEST_TIMEOUT_SECS, STATUS_BROADCAST_INTERVAL_SECS};
use webvpn_common::normalize_base_path;

/// CLI arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "webvpn-relay")]
#[command(about = "WebVPN tunnel relay and HTTP rewriting gateway", long_about = None)]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address to listen on
    #[arg(short, long, env = "WEBVPN_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Path prefix the gateway is mounted under (e.g. "/vpn")
    #[arg(long, env = "WEBVPN_BASE_PATH", default_value = "")]
    pub base_path: String,

    /// JSON file with endpoint definitions
    #[arg(long, env = "WEBVPN_ENDPOINTS_FILE", default_value = "endpoints.json")]
    pub endpoints_file: PathBuf,

    /// JSON file holding hashed relay keys
    #[arg(long, env = "WEBVPN_CREDENTIALS_FILE", default_value = "credentials.json")]
    pub credentials_file: PathBuf,

    /// HMAC secret used to verify caller session tokens
    #[arg(long, env = "WEBVPN_SESSION_SECRET", hide_env_values = true)]
    pub session_secret: Option<String>,

    /// DynamoDB table for presence data; presence stays in memory when unset
    #[arg(long, env = "WEBVPN_PRESENCE_TABLE")]
    pub presence_table: Option<String>,

    /// Seconds to wait for an agent reply
    #[arg(long, default_value_t = REQUEST_TIMEOUT_SECS)]
    pub request_timeout: u64,

    /// Retry GET/HEAD without the endpoint base path when the prefixed path is a 404
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub retry_without_base_path: bool,

    /// Host names the upstream services use to refer to themselves
    #[arg(long, value_delimiter = ',', default_value = "localhost,127.0.0.1")]
    pub local_hosts: Vec<String>,

    /// Login page unauthenticated browsers are redirected to, under the base path
    #[arg(long, default_value = "/unauthorized")]
    pub login_path: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the relay (default)
    Serve,

    /// Issue a relay key for a tunnel and store its hash in the credentials file
    IssueKey {
        #[arg(long)]
        tunnel: String,
    },
}

/// Runtime configuration of the relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Normalized: empty or `/prefix` without trailing slash
    pub base_path: String,
    pub endpoints_file: PathBuf,
    pub credentials_file: PathBuf,
    pub session_secret: String,
    pub presence_table: Option<String>,
    pub request_timeout: Duration,
    pub retry_without_base_path: bool,
    pub local_hosts: Vec<String>,
    pub login_path: String,
    pub liveness_sweep_interval: Duration,
    pub status_broadcast_interval: Duration,
}

impl RelayConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let session_secret = match args.session_secret.as_deref() {
            Some(secret) if !secret.is_empty() => secret.to_string(),
            _ => bail!("A session secret is required (--session-secret or WEBVPN_SESSION_SECRET)"),
        };
        if args.request_timeout == 0 {
            bail!("--request-timeout must be at least one second");
        }

        Ok(Self {
            listen: args.listen,
            base_path: normalize_base_path(&args.base_path),
            endpoints_file: args.endpoints_file.clone(),
            credentials_file: args.credentials_file.clone(),
            session_secret,
            presence_table: args.presence_table.clone().filter(|t| !t.is_empty()),
            request_timeout: Duration::from_secs(args.request_timeout),
            retry_without_base_path: args.retry_without_base_path,
            local_hosts: args
                .local_hosts
                .iter()
                .map(|host| host.trim().to_string())
                .filter(|host| !host.is_empty())
                .collect(),
            login_path: normalize_base_path(&args.login_path),
            liveness_sweep_interval: Duration::from_secs(LIVENESS_SWEEP_INTERVAL_SECS),
            status_broadcast_interval: Duration::from_secs(STATUS_BROADCAST_INTERVAL_SECS),
        })
    }

    /// Defaults suitable for tests and embedding
    pub fn with_secret(session_secret: impl Into<String>) -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            base_path: String::new(),
            endpoints_file: PathBuf::from("endpoints.json"),
            credentials_file: PathBuf::from("credentials.json"),
            session_secret: session_secret.into(),
            presence_table: None,
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            retry_without_base_path: true,
            local_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            login_path: "/unauthorized".to_string(),
            liveness_sweep_interval: Duration::from_secs(LIVENESS_SWEEP_INTERVAL_SECS),
            status_broadcast_interval: Duration::from_secs(STATUS_BROADCAST_INTERVAL_SECS),
        }
    }
}
