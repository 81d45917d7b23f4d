//! Parses a `CLUSTER SHARDS` reply into a `ClusterDescription`.
//!
//! The reply is a top-level array of shards, each an array or map with
//! `slots` (flat `[start, end]` pairs) and `nodes` entries. Unknown keys
//! are ignored. A single voter's malformed reply is reported
//! as an error but must never poison the election — callers are
//! expected to log and discard that one ballot.

use crate::node_id::{NodeDescription, NodeHealth, NodeId, NodeRole};
use crate::resp::Token;
use crate::topology::{ClusterDescription, Shard};

#[derive(Debug, Clone, PartialEq)]
pub struct TopologyParseError(pub String);

impl std::fmt::Display for TopologyParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed CLUSTER SHARDS reply: {}", self.0)
    }
}

pub fn parse_cluster_shards(reply: &Token) -> Result<ClusterDescription, TopologyParseError> {
    let top = reply.strip_attribute();
    let items = as_array(top).ok_or_else(|| TopologyParseError("expected top-level array".into()))?;
    let mut shards = Vec::with_capacity(items.len());
    for item in items {
        shards.push(parse_shard(item)?);
    }
    Ok(ClusterDescription { shards })
}

fn as_array(token: &Token) -> Option<&[Token]> {
    match token.strip_attribute() {
        Token::Array(items) | Token::Set(items) | Token::Push(items) => Some(items),
        _ => None,
    }
}

/// Reads `shard` as a sequence of key/value pairs whether it was framed
/// as a RESP3 map or a RESP2 flat array of alternating keys and values
/// (the server may reply in either shape over the two protocol
/// versions).
fn shard_pairs(shard: &Token) -> Result<Vec<(String, Token)>, TopologyParseError> {
    match shard.strip_attribute() {
        Token::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| Ok((token_as_string(k)?, v.clone())))
            .collect(),
        Token::Array(items) => {
            if items.len() % 2 != 0 {
                return Err(TopologyParseError("odd-length shard array".into()));
            }
            items
                .chunks(2)
                .map(|pair| Ok((token_as_string(&pair[0])?, pair[1].clone())))
                .collect()
        }
        _ => Err(TopologyParseError("expected shard map or array".into())),
    }
}

fn token_as_string(token: &Token) -> Result<String, TopologyParseError> {
    match token.strip_attribute() {
        Token::SimpleString(s) => Ok(s.clone()),
        Token::BlobString(b) => Ok(String::from_utf8_lossy(b).into_owned()),
        Token::Number(n) => Ok(n.to_string()),
        _ => Err(TopologyParseError("expected string-like token".into())),
    }
}

fn parse_shard(shard: &Token) -> Result<Shard, TopologyParseError> {
    let pairs = shard_pairs(shard)?;
    let mut slot_ranges = Vec::new();
    let mut nodes = Vec::new();

    for (key, value) in pairs {
        match key.as_str() {
            "slots" => {
                let flat = as_array(&value)
                    .ok_or_else(|| TopologyParseError("slots is not an array".into()))?;
                if flat.len() % 2 != 0 {
                    return Err(TopologyParseError("odd-length slots array".into()));
                }
                for pair in flat.chunks(2) {
                    let start = token_as_u16(&pair[0])?;
                    let end = token_as_u16(&pair[1])?;
                    slot_ranges.push(start..=end);
                }
            }
            "nodes" => {
                let raw_nodes = as_array(&value)
                    .ok_or_else(|| TopologyParseError("nodes is not an array".into()))?;
                for raw in raw_nodes {
                    nodes.push(parse_node(raw)?);
                }
            }
            _ => {} // unknown keys ignored
        }
    }

    Ok(Shard { slot_ranges, nodes })
}

fn token_as_u16(token: &Token) -> Result<u16, TopologyParseError> {
    match token.strip_attribute() {
        Token::Number(n) if *n >= 0 && *n <= u16::MAX as i64 => Ok(*n as u16),
        other => Err(TopologyParseError(format!("expected u16, got {other:?}"))),
    }
}

fn parse_node(raw: &Token) -> Result<NodeDescription, TopologyParseError> {
    let pairs = shard_pairs(raw)?;
    let mut ip = None;
    let mut hostname = None;
    let mut endpoint = None;
    let mut port = None;
    let mut tls_port = None;
    let mut role = NodeRole::Replica;
    let mut health = NodeHealth::Online;
    let mut replication_offset = 0u64;

    for (key, value) in pairs {
        match key.as_str() {
            "id" => {} // not part of this client's routing identity
            "ip" => ip = Some(token_as_string(&value)?),
            "hostname" => hostname = Some(token_as_string(&value)?),
            "endpoint" => endpoint = Some(token_as_string(&value)?),
            "port" => port = Some(token_as_u16(&value)?),
            "tls-port" => tls_port = Some(token_as_u16(&value)?),
            "role" => {
                role = match token_as_string(&value)?.as_str() {
                    "master" => NodeRole::Primary,
                    "replica" => NodeRole::Replica,
                    other => return Err(TopologyParseError(format!("unknown role {other}"))),
                }
            }
            "health" => {
                health = match token_as_string(&value)?.as_str() {
                    "online" => NodeHealth::Online,
                    "failed" => NodeHealth::Failed,
                    "loading" => NodeHealth::Loading,
                    other => return Err(TopologyParseError(format!("unknown health {other}"))),
                }
            }
            "replication-offset" => {
                replication_offset = match value.strip_attribute() {
                    Token::Number(n) => *n as u64,
                    _ => return Err(TopologyParseError("replication-offset not a number".into())),
                }
            }
            _ => {} // unknown keys ignored
        }
    }

    let port = port.ok_or_else(|| TopologyParseError("node missing port".into()))?;
    // Endpoint preference: hostname falls back to IP.
    let routing_endpoint = endpoint
        .or_else(|| hostname.clone())
        .or_else(|| ip.clone())
        .ok_or_else(|| TopologyParseError("node has no endpoint/ip/hostname".into()))?;

    Ok(NodeDescription {
        id: NodeId::new(routing_endpoint, port),
        ip,
        hostname,
        tls_port,
        use_tls: false,
        role,
        health,
        replication_offset,
    })
}
