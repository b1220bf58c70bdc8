//! Overlay error types.

use std::time::Duration;

use crate::identity::{ConnectionId, NodeId};

/// Errors that can occur in the hive_overlay crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (socket connect/write failure).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote refused or could not be reached.
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// A raw send addressed a connection that is not (or no longer) live.
    #[error("Attempt to send data to connection that does not exist: {0}")]
    UnknownConnection(ConnectionId),

    /// A node-level send addressed a node that is not a neighbor.
    #[error("Peer not found: {0}")]
    PeerNotFound(NodeId),

    /// Node traffic arrived on a connection that never completed a handshake.
    #[error("Message on connection {0} before handshake")]
    UnrecognizedConnection(ConnectionId),

    /// Any other violation of the wire protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A frame that can never be decoded as JSON.
    #[error("Decode error: {0}")]
    Decode(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `listen` was called while a listener is already bound.
    #[error("Already listening on {0}")]
    AlreadyListening(std::net::SocketAddr),

    /// The node has been closed.
    #[error("Node not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
