//! Client identification for throttling.

use std::fmt;
use std::net::IpAddr;

/// Identifies the client a hit is counted against.
///
/// Usually the remote IP address of the connection. Clients sharing an address, such as
/// users behind the same proxy or NAT, share one counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Key used when the remote address of a request is not known.
    pub const UNKNOWN: &'static str = "unknown";

    /// Create a key from an arbitrary identifier.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for requests without a known remote address.
    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        // IPv4-mapped IPv6 addresses from dual-stack sockets count as the IPv4 client.
        Self(ip.to_canonical().to_string())
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
