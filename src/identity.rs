use std::net::IpAddr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// A caller identity used as the rate-limit counting key.
///
/// The three variants are never conflated: an IP counter and a session
/// counter for the same physical caller are independent buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Identity {
    Ip(IpAddr),
    Session(String),
    Reflink(String),
}

impl Identity {
    /// Stable counting key, namespaced by identity type.
    pub fn counting_key(&self) -> String {
        match self {
            Identity::Ip(ip) => format!("ip:{ip}"),
            Identity::Session(id) => format!("session:{id}"),
            Identity::Reflink(code) => format!("reflink:{code}"),
        }
    }

    pub fn kind(&self) -> IdentityKind {
        match self {
            Identity::Ip(_) => IdentityKind::Ip,
            Identity::Session(_) => IdentityKind::Session,
            Identity::Reflink(_) => IdentityKind::Reflink,
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.counting_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Ip,
    Session,
    Reflink,
}

/// Identity material extracted from an inbound request. Pure data; the facade
/// decides which component becomes the counting identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestIdentity {
    pub ip: Option<IpAddr>,
    pub session_id: Option<String>,
    pub reflink_code: Option<String>,
}

impl RequestIdentity {
    /// Counting identity, most specific first: reflink > session > IP.
    pub fn identity(&self) -> Option<Identity> {
        if let Some(code) = &self.reflink_code {
            return Some(Identity::Reflink(code.clone()));
        }
        if let Some(session) = &self.session_id {
            return Some(Identity::Session(session.clone()));
        }
        self.ip.map(Identity::Ip)
    }
}

/// Extract identity material from request headers and the query string.
///
/// Reflink codes arrive either in the `X-Reflink-Code` header or a `reflink`
/// query parameter; sessions in `X-Session-Id`. The client IP is taken from
/// the first `X-Forwarded-For` hop, then `X-Real-IP`.
pub fn extract_identity(headers: &HeaderMap, query: Option<&str>) -> RequestIdentity {
    RequestIdentity {
        ip: client_ip(headers),
        session_id: header_value(headers, "x-session-id"),
        reflink_code: header_value(headers, "x-reflink-code")
            .or_else(|| query.and_then(query_param_reflink)),
    }
}

/// Resolve the client IP from proxy headers.
pub fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
        // First hop is the original client; later hops are proxies.
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    header_value(headers, "x-real-ip").and_then(|v| v.trim().parse().ok())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}

fn query_param_reflink(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "reflink")
        .map(|(_, value)| value.to_string())
        .filter(|v| !v.is_empty())
}
