//! Cookie and redirect rewriting
//!
//! Upstream cookies are re-scoped to the tunnel base path so that same-named cookies
//! from different tunneled apps (or the portal itself) never collide, and redirects
//! are kept inside the tunnel prefix.

use url::Url;
use webvpn_common::constants::TUNNEL_COOKIE_MAX_AGE_SECS;

/// Cookie remembering the most recently used tunnel, read by the fallback router
pub const TUNNEL_COOKIE: &str = "webvpn_tunnel";

const GATEWAY_COOKIE_NAMES: [&str; 2] = [TUNNEL_COOKIE, "webvpn_tunnel_assets"];
const GATEWAY_COOKIE_PREFIXES: [&str; 2] = ["webvpn.", "__Secure-webvpn."];

fn is_gateway_cookie(name: &str) -> bool {
    GATEWAY_COOKIE_NAMES.contains(&name)
        || GATEWAY_COOKIE_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

fn split_pairs(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header.split(';').filter_map(|pair| {
        let pair = pair.trim();
        if pair.is_empty() {
            return None;
        }
        Some(match pair.split_once('=') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => (pair, ""),
        })
    })
}

/// Value of cookie `name` in a `Cookie` header
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    split_pairs(header)
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Remove the portal's own cookies from a `Cookie` header before it goes upstream.
/// Returns None when nothing is left.
pub fn strip_gateway_cookies(header: &str) -> Option<String> {
    let kept: Vec<&str> = header
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(name, _)| name.trim());
            !is_gateway_cookie(name)
        })
        .collect();

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("; "))
    }
}

/// Re-scope an upstream `Set-Cookie` value to `tunnel_base_path`.
///
/// Any `Path` attribute is replaced (or one is added right after the name/value pair)
/// and `Domain` attributes are dropped.
pub fn rewrite_set_cookie(cookie: &str, tunnel_base_path: &str) -> String {
    let mut parts = cookie.split(';').map(str::trim).filter(|p| !p.is_empty());
    let Some(name_value) = parts.next() else {
        return String::new();
    };

    let path_attr = format!("Path={}", tunnel_base_path);
    let mut rewritten = vec![name_value.to_string()];
    let mut has_path = false;

    for attr in parts {
        let attr_name = attr.split_once('=').map_or(attr, |(name, _)| name).trim();
        if attr_name.eq_ignore_ascii_case("path") {
            has_path = true;
            rewritten.push(path_attr.clone());
        } else if attr_name.eq_ignore_ascii_case("domain") {
            continue;
        } else {
            rewritten.push(attr.to_string());
        }
    }

    if !has_path {
        rewritten.insert(1, path_attr);
    }

    rewritten.join("; ")
}

/// Keep an upstream redirect inside the tunnel.
///
/// Absolute URLs are reduced to path, query and fragment; root-relative results are
/// prefixed with `tunnel_base_path`. Relative locations pass through untouched.
pub fn rewrite_location(location: &str, tunnel_base_path: &str) -> String {
    let location = match Url::parse(location) {
        Ok(url) if url.has_host() => {
            let mut reduced = url.path().to_string();
            if let Some(query) = url.query() {
                reduced.push('?');
                reduced.push_str(query);
            }
            if let Some(fragment) = url.fragment() {
                reduced.push('#');
                reduced.push_str(fragment);
            }
            reduced
        }
        _ => location.to_string(),
    };

    if location.starts_with('/') && !location.starts_with("//") {
        format!("{}{}", tunnel_base_path, location)
    } else {
        location
    }
}

/// `Set-Cookie` value remembering the active tunnel for the fallback router
pub fn tunnel_cookie(tunnel_id: &str) -> String {
    format!(
        "{}={}; Path=/; SameSite=Lax; Max-Age={}",
        TUNNEL_COOKIE, tunnel_id, TUNNEL_COOKIE_MAX_AGE_SECS
    )
}
