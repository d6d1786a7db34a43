//! Client-side asset interceptor
//!
//! The relay serves a service worker ([`SERVICE_WORKER_SCRIPT`]) and injects a bootstrap
//! script into every proxied HTML page. The bootstrap registers the worker and posts it
//! an [`InterceptorMessage`]; the worker then rewrites root-relative requests of the
//! tunneled page into the tunnel prefix. The same path rules back the server-side
//! fallback router for browsers without service workers.

use serde::{Deserialize, Serialize};

/// Path of the service worker script, relative to the gateway base path
pub const SERVICE_WORKER_PATH: &str = "/webvpn-sw.js";

/// The service worker served to browsers
pub const SERVICE_WORKER_SCRIPT: &str = include_str!("../assets/webvpn-sw.js");

/// Gateway paths that are never rewritten into a tunnel
const RESERVED_PREFIXES: [&str; 8] = [
    "/_next/",
    "/clients",
    "/admin",
    "/logs",
    "/unauthorized",
    "/webvpn-api",
    "/ws",
    "/tunnel/",
];
const RESERVED_EXACT: [&str; 3] = ["/", "/favicon.ico", SERVICE_WORKER_PATH];

/// Messages posted from the bootstrap script to the service worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InterceptorMessage {
    #[serde(rename = "WEBVPN_SET_CLIENT", rename_all = "camelCase")]
    SetClient { client_id: String, base_path: String },
}

impl InterceptorMessage {
    /// Tag checked by the service worker
    pub const SET_CLIENT: &'static str = "WEBVPN_SET_CLIENT";
}

/// JSON that is safe to embed inside a `<script>` element
fn script_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "null".to_string())
        .replace("</", "<\\/")
}

/// Bootstrap `<script>` registering the worker and pushing it the active tunnel
pub fn bootstrap_script(tunnel_id: &str, gateway_base_path: &str) -> String {
    let message = InterceptorMessage::SetClient {
        client_id: tunnel_id.to_string(),
        base_path: gateway_base_path.to_string(),
    };
    let script_url = format!("{}{}", gateway_base_path, SERVICE_WORKER_PATH);
    let scope = format!("{}/", gateway_base_path);

    format!(
        concat!(
            "<script data-webvpn-sw>(function(){{",
            "if(!('serviceWorker' in navigator))return;",
            "var msg={msg};",
            "var post=function(w){{if(w)w.postMessage(msg);}};",
            "post(navigator.serviceWorker.controller);",
            "navigator.serviceWorker.register({url},{{scope:{scope}}})",
            ".then(function(){{return navigator.serviceWorker.ready;}})",
            ".then(function(reg){{post(reg.active);}})",
            ".catch(function(e){{console.warn('webvpn: service worker registration failed',e);}});",
            "}})();</script>"
        ),
        msg = script_json(&message),
        url = script_json(&script_url),
        scope = script_json(&scope),
    )
}

/// Path with the gateway base path removed; paths outside the base are returned as-is
pub fn strip_base_path<'a>(path: &'a str, base_path: &str) -> &'a str {
    if base_path.is_empty() {
        return path;
    }
    if path == base_path {
        return "/";
    }
    match path.strip_prefix(base_path) {
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    }
}

/// Tunnel identifier of a `{base}/tunnel/{id}[/...]` path
pub fn tunnel_id_from_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    let rest = strip_base_path(path, base_path).strip_prefix("/tunnel/")?;
    let id = rest.split('/').next().unwrap_or_default();
    (!id.is_empty()).then_some(id)
}

/// Whether `app_path` belongs to the gateway itself
pub fn is_reserved_path(app_path: &str) -> bool {
    RESERVED_EXACT.contains(&app_path)
        || RESERVED_PREFIXES
            .iter()
            .any(|prefix| app_path.starts_with(prefix))
}

/// Tunnel identifier named by a `Referer` URL
pub fn tunnel_id_from_referer(referer: &str, base_path: &str) -> Option<String> {
    let url = url::Url::parse(referer).ok()?;
    tunnel_id_from_path(url.path(), base_path).map(str::to_string)
}

/// Where a stray root-relative request should go, if anywhere.
///
/// The referer wins over the remembered tunnel cookie. Returns the tunnel identifier
/// and the application path to proxy.
pub fn resolve_stray_request(
    path: &str,
    base_path: &str,
    referer: Option<&str>,
    cookie_tunnel: Option<&str>,
) -> Option<(String, String)> {
    let app_path = strip_base_path(path, base_path);
    if is_reserved_path(app_path) {
        return None;
    }

    let tunnel_id = referer
        .and_then(|r| tunnel_id_from_referer(r, base_path))
        .or_else(|| cookie_tunnel.map(str::to_string))?;

    Some((tunnel_id, app_path.to_string()))
}
