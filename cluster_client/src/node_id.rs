//! Address-keyed node identity.
//!
//! Nodes are keyed by the address the cluster advertises them under
//! (endpoint, port) rather than a gossip-protocol identity — that's
//! what `MOVED`/`ASK` redirections and `CLUSTER SHARDS` entries both
//! name.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub endpoint: String,
    pub port: u16,
}

impl NodeId {
    pub fn new(endpoint: impl Into<String>, port: u16) -> Self {
        NodeId {
            endpoint: endpoint.into(),
            port,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.port)
    }
}

/// Bundles a node's routing address with transport hints.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescription {
    pub id: NodeId,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub tls_port: Option<u16>,
    pub use_tls: bool,
    pub role: NodeRole,
    pub health: NodeHealth,
    pub replication_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Primary,
    Replica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Online,
    Failed,
    Loading,
}

/// Parses `endpoint:port`, splitting at the *last* `:` so an IPv6
/// address in `endpoint` is tolerated.
pub fn parse_address(addr: &str) -> Option<(String, u16)> {
    let idx = addr.rfind(':')?;
    let (host, port_str) = (&addr[..idx], &addr[idx + 1..]);
    let port: u16 = port_str.parse().ok()?;
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test01_parse_simple_address() {
        assert_eq!(
            parse_address("10.0.0.2:7001"),
            Some(("10.0.0.2".to_string(), 7001))
        );
    }

    #[test]
    fn test02_parse_ipv6_address_splits_at_last_colon() {
        assert_eq!(
            parse_address("::1:7001"),
            Some(("::1".to_string(), 7001))
        );
    }

    #[test]
    fn test03_parse_hostname() {
        assert_eq!(
            parse_address("redis-node-1.local:6379"),
            Some(("redis-node-1.local".to_string(), 6379))
        );
    }

    #[test]
    fn test04_display() {
        let id = NodeId::new("10.0.0.2", 7001);
        assert_eq!(id.to_string(), "10.0.0.2:7001");
    }
}
