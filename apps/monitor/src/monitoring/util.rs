use std::collections::HashMap;

use serde_json::Value;
use url::Url;

/// Read a numeric tuning knob from a check's ExtraOptions. The config
/// document carries all numbers as JSON numbers, so fractional values are
/// truncated the same way for every option.
pub fn int_option(options: &HashMap<String, Value>, key: &str, default: i64) -> i64 {
    options.get(key).and_then(Value::as_f64).map(|value| value as i64).unwrap_or(default)
}

pub fn float_option(options: &HashMap<String, Value>, key: &str, default: f64) -> f64 {
    options.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// The pieces of an endpoint URL the probes care about. The host is
/// lowercased; the scheme is kept verbatim so callers can rewrite it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl ParsedUrl {
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(match self.scheme.as_str() {
            "https" | "wss" => 443,
            _ => 80,
        })
    }

    /// Rebuild the URL, keeping an explicit port when one was given.
    pub fn to_url_string(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}{}", self.scheme, self.host, port, self.path),
            None => format!("{}://{}{}", self.scheme, self.host, self.path),
        }
    }
}

/// Parse an endpoint URL from the service catalog. Bare hostnames are
/// treated as https, matching how operators write them.
pub fn parse_endpoint_url(raw: &str) -> Option<ParsedUrl> {
    if raw.is_empty() {
        return None;
    }
    let normalized = if raw.contains("://") { raw.to_string() } else { format!("https://{raw}") };
    let url = Url::parse(&normalized).ok()?;
    let host = url.host_str()?.to_lowercase();
    Some(ParsedUrl {
        scheme: url.scheme().to_string(),
        host,
        port: url.port(),
        path: url.path().to_string(),
    })
}

/// The lowercased hostname of an endpoint URL, or "" when it has none.
pub fn parse_url_for_domain(raw: &str) -> String {
    parse_endpoint_url(raw).map(|parsed| parsed.host).unwrap_or_default()
}
