//! A Redis/Valkey cluster-aware client: RESP wire codec, hash-slot
//! routing, MOVED/ASK redirection, and topology discovery behind a
//! single `ClusterClient` façade.
//!
//! Fans requests out across shards by hash slot instead of dialing one
//! fixed address, reconnecting and rerouting as the cluster's topology
//! changes underneath it.

mod backoff;
mod channel;
mod cluster_client;
mod cluster_shards;
mod cluster_state;
mod command;
mod config;
mod connection;
mod election;
mod error;
mod hash_slot;
mod node_client;
mod node_id;
mod redirect;
mod resp;
mod topology;
mod waiter;

pub use channel::{Channel, ChannelFactory, TcpChannelFactory};
pub use cluster_client::ClusterClient;
pub use command::{Command, Del, Encodable, Exists, Get, MGet, Ping, Set};
pub use config::{ClientConfig, RespVersion};
pub use error::{ClientError, ClientResult};
pub use hash_slot::{slot_for_key, HashSlot, SLOT_COUNT};
pub use node_id::{NodeDescription, NodeHealth, NodeId, NodeRole};
pub use resp::Token;
pub use topology::{ClusterDescription, Shard};
