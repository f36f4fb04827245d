//! Endpoint identity and canonical pool-partition keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport kinds a channel can be established over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// TCP socket transport
    Tcp,
    /// WebSocket transport
    #[serde(rename = "ws")]
    WebSocket,
    /// Unix domain socket transport
    Unix,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::WebSocket => write!(f, "ws"),
            Self::Unix => write!(f, "unix"),
        }
    }
}

/// A remote endpoint, used as the pool-partition key.
///
/// Identity is derived from the canonical key string
/// (`kind://host:port`), not object identity: hostnames are lowercased at
/// construction so `Endpoint::tcp("Db.Internal", 9000)` and
/// `Endpoint::tcp("db.internal", 9000)` land in the same pool partition.
/// Unix socket paths are case-sensitive and kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
    kind: TransportKind,
}

impl Endpoint {
    /// Create an endpoint for the given transport kind.
    pub fn new(kind: TransportKind, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = match kind {
            TransportKind::Unix => host,
            TransportKind::Tcp | TransportKind::WebSocket => host.to_ascii_lowercase(),
        };
        Self { host, port, kind }
    }

    /// Create a TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(TransportKind::Tcp, host, port)
    }

    /// Create a WebSocket endpoint.
    pub fn ws(host: impl Into<String>, port: u16) -> Self {
        Self::new(TransportKind::WebSocket, host, port)
    }

    /// Create a Unix domain socket endpoint.
    ///
    /// The host carries the filesystem path of the socket; the port is
    /// unused and fixed to zero.
    pub fn unix(path: impl Into<String>) -> Self {
        Self::new(TransportKind::Unix, path, 0)
    }

    /// Remote host (or socket path for Unix endpoints), canonicalized.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Remote port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Transport kind.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Canonical key string (`kind://host:port`).
    ///
    /// Pool partitioning, equality, and hashing all follow this key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}://{}:{}", self.kind, self.host, self.port)
    }

    /// Socket address string (`host:port`), without the kind prefix.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.kind, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_kind_display() {
        assert_eq!(TransportKind::Tcp.to_string(), "tcp");
        assert_eq!(TransportKind::WebSocket.to_string(), "ws");
        assert_eq!(TransportKind::Unix.to_string(), "unix");
    }

    #[test]
    fn test_canonical_key() {
        let endpoint = Endpoint::tcp("db.internal", 9000);
        assert_eq!(endpoint.key(), "tcp://db.internal:9000");
        assert_eq!(endpoint.to_string(), endpoint.key());
    }

    #[test]
    fn test_identity_follows_key() {
        let a = Endpoint::tcp("Db.Internal", 9000);
        let b = Endpoint::tcp("db.internal", 9000);
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn test_kinds_partition_separately() {
        let tcp = Endpoint::tcp("host", 80);
        let ws = Endpoint::ws("host", 80);
        assert_ne!(tcp, ws);
        assert_ne!(tcp.key(), ws.key());
    }

    #[test]
    fn test_unix_endpoint() {
        let endpoint = Endpoint::unix("/run/hawser.sock");
        assert_eq!(endpoint.kind(), TransportKind::Unix);
        assert_eq!(endpoint.port(), 0);
        assert_eq!(endpoint.key(), "unix:///run/hawser.sock:0");
    }

    #[test]
    fn test_serde_roundtrip() {
        let endpoint = Endpoint::ws("api.example.com", 8443);
        let json = serde_json::to_string(&endpoint).unwrap();
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(endpoint, back);
        assert!(json.contains("\"ws\""));
    }
}
