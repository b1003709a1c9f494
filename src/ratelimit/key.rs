//! Identity key derivation from client addresses.

use std::net::SocketAddr;

/// The identity a request is rate limited under.
///
/// Derived from the client's network address: the host without the port.
/// Addresses that cannot be split collapse to the empty key, so all of them
/// share one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Build a key from a `host:port` string.
    pub fn from_addr(addr: &str) -> Self {
        Self(split_host(addr).unwrap_or_default().to_string())
    }

    /// Use an arbitrary string as the key, bypassing address parsing.
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as handed to limiters.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for IdentityKey {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.ip().to_string())
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Split `host:port` or `[host]:port`, returning the host.
fn split_host(addr: &str) -> Option<&str> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        tail.strip_prefix(':')?;
        return Some(host);
    }

    let (host, _port) = addr.rsplit_once(':')?;
    // Unbracketed IPv6 is ambiguous
    if host.contains(':') {
        return None;
    }
    Some(host)
}
