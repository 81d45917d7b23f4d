//! Error hierarchy for the cluster client.
//!
//! A single enum carrying a human-readable message plus a
//! `ClientErrorKind` discriminant, with `From` impls bridging the
//! lower-level error types instead of a derive-macro stack.

use std::fmt;
use std::io;

use crate::resp::decoder::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Socket closed mid-request.
    ConnectionClosed,
    /// Server returned a simple/blob error.
    CommandError(String),
    /// A single command's keys span more than one hash slot.
    KeysRequireMultipleHashSlots,
    /// A pipeline grouped commands across shards but a single node was required.
    KeysRequireMultipleNodes,
    /// No consensus could be reached during topology discovery.
    ClusterIsUnavailable,
    /// A slot has no owning shard after discovery completed.
    ClusterIsMissingSlotAssignment,
    /// A MOVED reply named a node absent from the current description.
    ClusterIsMissingMovedErrorNode,
    /// The cluster client was used after `shutdown()`.
    ClusterClientIsShutDown,
    /// The waiting request was cancelled before it could complete.
    ClientRequestCancelled,
    /// The circuit breaker is open; no consensus can be attempted yet.
    NoConsensusReachedCircuitBreakerOpen,
    /// `max_redirects` retries were exhausted following MOVED/ASK/TRYAGAIN.
    WaitedForDiscoveryAfterMovedTooManyTimes,
    /// Internal bookkeeping error: a pipeline slot was never written.
    PipelinedResultNotReturned,
    /// RESP decoding failed.
    ParseError(String),
    /// Any I/O failure not otherwise classified.
    Io(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::ConnectionClosed => write!(f, "connection closed"),
            ClientError::CommandError(msg) => write!(f, "command error: {msg}"),
            ClientError::KeysRequireMultipleHashSlots => {
                write!(f, "keys in command require multiple hash slots")
            }
            ClientError::KeysRequireMultipleNodes => {
                write!(f, "keys require multiple nodes")
            }
            ClientError::ClusterIsUnavailable => write!(f, "cluster is unavailable"),
            ClientError::ClusterIsMissingSlotAssignment => {
                write!(f, "cluster is missing slot assignment")
            }
            ClientError::ClusterIsMissingMovedErrorNode => {
                write!(f, "cluster is missing moved error node")
            }
            ClientError::ClusterClientIsShutDown => write!(f, "cluster client is shut down"),
            ClientError::ClientRequestCancelled => write!(f, "client request cancelled"),
            ClientError::NoConsensusReachedCircuitBreakerOpen => {
                write!(f, "no consensus reached, circuit breaker open")
            }
            ClientError::WaitedForDiscoveryAfterMovedTooManyTimes => {
                write!(f, "waited for discovery after moved too many times")
            }
            ClientError::PipelinedResultNotReturned => {
                write!(f, "pipelined result not returned")
            }
            ClientError::ParseError(reason) => write!(f, "parse error: {reason}"),
            ClientError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

impl From<ParseError> for ClientError {
    fn from(err: ParseError) -> Self {
        ClientError::ParseError(err.to_string())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
