//! Response content rewriting for tunneled HTML
//!
//! Tunneled applications were written to live at the root of their own host. Before an
//! HTML response reaches the browser it is decoded, absolute links back to the upstream's
//! own local addresses are pointed at the public tunnel URL, and a `<base>` tag plus the
//! interceptor bootstrap script are injected so that root-relative requests stay inside
//! the tunnel prefix.

use std::io::Read;

use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use http::HeaderMap;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use webvpn_common::constants::{HTML_SNIFF_BYTES, MAX_BODY_SIZE_BYTES};

use crate::interceptor::bootstrap_script;

/// Marker attribute on the injected `<base>` tag
pub const BASE_MARKER: &str = "data-webvpn-base";

/// Marker attribute on the injected bootstrap script
pub const SCRIPT_MARKER: &str = "data-webvpn-sw";

static HEAD_OPEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<head(?:\s[^>]*)?>").expect("Invalid regex"));

/// Where a response is being served from
#[derive(Debug, Clone)]
pub struct RewriteContext<'a> {
    pub tunnel_id: &'a str,
    /// Gateway base path, normalized (`""` or `/vpn`)
    pub gateway_base_path: &'a str,
    /// `scheme://host` seen by the browser, when known
    pub public_origin: Option<&'a str>,
    pub upstream_port: u16,
    /// Host names the upstream uses to refer to itself
    pub local_hosts: &'a [String],
}

impl RewriteContext<'_> {
    /// `{base}/tunnel/{id}`
    pub fn tunnel_base_path(&self) -> String {
        format!("{}/tunnel/{}", self.gateway_base_path, self.tunnel_id)
    }
}

/// Result of running a response body through the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub body: Vec<u8>,
    /// First listed content coding, lowercased
    pub encoding: Option<String>,
    /// The body was decompressed and is now served as identity
    pub decoded: bool,
    pub html: bool,
    /// Base tag and bootstrap script were inserted
    pub injected: bool,
}

impl RewriteOutcome {
    /// Adjust upstream response headers to match the outbound body
    pub fn apply_to_headers(&self, headers: &mut HeaderMap) {
        if self.decoded {
            headers.remove(CONTENT_ENCODING);
        }
        // Recomputed by the serving layer; injected scripts would trip upstream CSPs
        headers.remove(CONTENT_LENGTH);
        headers.remove("content-security-policy");
        headers.remove("content-security-policy-report-only");
    }

    /// Observability headers describing what the pipeline did
    pub fn diagnostic_headers(&self) -> [(&'static str, String); 5] {
        [
            ("x-webvpn-injected", flag(self.injected)),
            ("x-webvpn-html", flag(self.html)),
            (
                "x-webvpn-encoding",
                self.encoding.clone().unwrap_or_else(|| "none".to_string()),
            ),
            ("x-webvpn-decoded", flag(self.decoded)),
            ("x-webvpn-body-len", self.body.len().to_string()),
        ]
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

/// Content codings understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl Coding {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "identity" => Some(Coding::Identity),
            "gzip" | "x-gzip" => Some(Coding::Gzip),
            "deflate" => Some(Coding::Deflate),
            "br" => Some(Coding::Brotli),
            _ => None,
        }
    }
}

/// First coding of a `Content-Encoding` header value, lowercased
fn primary_encoding(content_encoding: Option<&str>) -> Option<String> {
    let first = content_encoding?.split(',').next()?.trim().to_ascii_lowercase();
    (!first.is_empty()).then_some(first)
}

fn read_capped(reader: impl Read) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(MAX_BODY_SIZE_BYTES as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() > MAX_BODY_SIZE_BYTES {
        return Err(std::io::Error::other("decoded body exceeds size limit"));
    }
    Ok(out)
}

fn decompress(body: &[u8], coding: Coding) -> std::io::Result<Vec<u8>> {
    match coding {
        Coding::Identity => Ok(body.to_vec()),
        Coding::Gzip => read_capped(MultiGzDecoder::new(body)),
        // "deflate" is specified as zlib-wrapped but many servers send raw deflate
        Coding::Deflate => {
            read_capped(ZlibDecoder::new(body)).or_else(|_| read_capped(DeflateDecoder::new(body)))
        }
        Coding::Brotli => read_capped(brotli::Decompressor::new(body, 4096)),
    }
}

/// Whether a body should be treated as an HTML document
pub fn looks_like_html(content_type: Option<&str>, body: &[u8]) -> bool {
    if let Some(content_type) = content_type.filter(|ct| !ct.trim().is_empty()) {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        return mime == "text/html" || mime == "application/xhtml+xml";
    }

    let sniff = &body[..body.len().min(HTML_SNIFF_BYTES)];
    let head = String::from_utf8_lossy(sniff).trim_start().to_ascii_lowercase();
    ["<!doctype html", "<html", "<head", "<meta"]
        .iter()
        .any(|prefix| head.starts_with(prefix))
}

/// Point absolute URLs naming the upstream's own local addresses at the public tunnel URL
pub fn rewrite_local_origins(html: &str, ctx: &RewriteContext<'_>) -> String {
    let mut hosts: Vec<String> = ctx
        .local_hosts
        .iter()
        .filter(|host| !host.is_empty())
        .map(|host| regex::escape(host))
        .collect();
    hosts.push(r"192\.168\.\d{1,3}\.\d{1,3}".to_string());

    let pattern = format!(
        r"(?i)https?://(?:{}):{}(?:/|\b)",
        hosts.join("|"),
        ctx.upstream_port
    );
    let regex = match Regex::new(&pattern) {
        Ok(regex) => regex,
        Err(e) => {
            warn!("Skipping local origin rewrite, bad host pattern: {}", e);
            return html.to_string();
        }
    };

    let replacement = format!(
        "{}{}/",
        ctx.public_origin.unwrap_or_default(),
        ctx.tunnel_base_path()
    );
    regex
        .replace_all(html, regex::NoExpand(&replacement))
        .into_owned()
}

/// Insert the base tag and bootstrap script once, right after `<head>` or at the start
pub fn inject_bootstrap(html: &str, ctx: &RewriteContext<'_>) -> Option<String> {
    if html.contains(SCRIPT_MARKER) || html.contains(BASE_MARKER) {
        return None;
    }

    let snippet = format!(
        r#"<base {} href="{}/">{}"#,
        BASE_MARKER,
        ctx.tunnel_base_path(),
        bootstrap_script(ctx.tunnel_id, ctx.gateway_base_path)
    );
    let insert_at = HEAD_OPEN_REGEX.find(html).map_or(0, |m| m.end());

    let mut out = String::with_capacity(html.len() + snippet.len());
    out.push_str(&html[..insert_at]);
    out.push_str(&snippet);
    out.push_str(&html[insert_at..]);
    Some(out)
}

/// Run an upstream response body through decoding, HTML detection and rewriting.
///
/// Failures never surface: an undecodable or non-UTF-8 body is passed through untouched.
pub fn rewrite_response_body(
    body: Vec<u8>,
    content_encoding: Option<&str>,
    content_type: Option<&str>,
    ctx: &RewriteContext<'_>,
) -> RewriteOutcome {
    let encoding = primary_encoding(content_encoding);
    let mut outcome = RewriteOutcome {
        encoding: encoding.clone(),
        ..Default::default()
    };
    if body.is_empty() {
        outcome.body = body;
        return outcome;
    }

    let coding = match Coding::parse(encoding.as_deref().unwrap_or_default()) {
        Some(coding) => coding,
        None => {
            debug!(
                "Unknown content encoding {:?} for tunnel {}, passing through",
                encoding, ctx.tunnel_id
            );
            outcome.body = body;
            return outcome;
        }
    };

    let decoded = match decompress(&body, coding) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(
                "Failed to decode {:?} body for tunnel {}: {}",
                encoding, ctx.tunnel_id, e
            );
            outcome.body = body;
            return outcome;
        }
    };

    outcome.html = looks_like_html(content_type, &decoded);
    if !outcome.html {
        // Non-HTML keeps its original coding
        outcome.body = body;
        return outcome;
    }

    outcome.decoded = coding != Coding::Identity;
    let text = match String::from_utf8(decoded) {
        Ok(text) => text,
        Err(e) => {
            debug!("HTML body for tunnel {} is not UTF-8, not rewriting", ctx.tunnel_id);
            outcome.body = e.into_bytes();
            return outcome;
        }
    };

    let rewritten = rewrite_local_origins(&text, ctx);
    let final_html = match inject_bootstrap(&rewritten, ctx) {
        Some(injected) => {
            outcome.injected = true;
            injected
        }
        None => rewritten,
    };

    debug!(
        "Rewrote HTML for tunnel {}: {} -> {} bytes (decoded: {}, injected: {})",
        ctx.tunnel_id,
        text.len(),
        final_html.len(),
        outcome.decoded,
        outcome.injected
    );
    outcome.body = final_html.into_bytes();
    outcome
}
