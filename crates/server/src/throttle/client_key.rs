use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use http::request::Parts;

use ::throttle::ClientKey;

/// Derive the throttling key of a request.
///
/// With `trust_forwarded_headers` the first `X-Forwarded-For` entry, then `X-Real-IP`, win
/// over the peer address. Requests with no usable address all share the unknown key.
pub(crate) fn extract(parts: &Parts, trust_forwarded_headers: bool) -> ClientKey {
    let forwarded = trust_forwarded_headers
        .then(|| forwarded_ip(parts))
        .flatten();

    let peer = || {
        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    };

    match forwarded.or_else(peer) {
        Some(ip) => ClientKey::from(ip),
        None => ClientKey::unknown(),
    }
}

fn forwarded_ip(parts: &Parts) -> Option<IpAddr> {
    let from_forwarded_for = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|ip| ip.trim().parse().ok());

    from_forwarded_for.or_else(|| {
        parts
            .headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|ip| ip.trim().parse().ok())
    })
}
