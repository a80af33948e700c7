use url::Url;

use crate::error::{ClientError, Result};

/// Normalize a relay URL into the WebSocket endpoint the client dials.
///
/// `http://` and `https://` are accepted as aliases for `ws://` and `wss://`.
/// When the URL has neither an explicit port nor a non-root path, the default
/// port for the scheme (80 or 443) is written out explicitly.
///
/// Limitation: a URL with a path is assumed to already carry whatever port
/// the caller intended, so no port is injected for it. Endpoints that live
/// under a path must spell their port out.
pub fn normalize_relay_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let (scheme, rest) = if let Some(rest) = raw.strip_prefix("wss://") {
        ("wss", rest)
    } else if let Some(rest) = raw.strip_prefix("ws://") {
        ("ws", rest)
    } else if let Some(rest) = raw.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = raw.strip_prefix("http://") {
        ("ws", rest)
    } else {
        return Err(ClientError::InvalidEndpoint(format!(
            "unsupported scheme in `{raw}`"
        )));
    };

    let split_at = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, remainder) = rest.split_at(split_at);
    if authority.is_empty() {
        return Err(ClientError::InvalidEndpoint(format!("missing host in `{raw}`")));
    }

    let path = remainder
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let has_path = !path.is_empty() && path != "/";

    let normalized = if has_explicit_port(authority) || has_path {
        format!("{scheme}://{authority}{remainder}")
    } else {
        let port = if scheme == "wss" { 443 } else { 80 };
        format!("{scheme}://{authority}:{port}{remainder}")
    };

    let parsed = Url::parse(&normalized)
        .map_err(|err| ClientError::InvalidEndpoint(format!("{raw}: {err}")))?;
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ClientError::InvalidEndpoint(format!("missing host in `{raw}`")));
    }

    Ok(normalized)
}

fn has_explicit_port(authority: &str) -> bool {
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    if let Some(after_bracket) = host_port.rsplit_once(']').map(|(_, tail)| tail) {
        return after_bracket.starts_with(':') && after_bracket.len() > 1;
    }
    host_port
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty())
}
