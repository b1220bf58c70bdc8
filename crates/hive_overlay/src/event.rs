//! Events published to subscribers of a node.

use serde_json::Value;

use crate::identity::NodeId;

/// Category of a [`NodeEvent::Fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Socket-level failure on one connection.
    Transport,
    /// A peer broke the wire protocol.
    Protocol,
    /// Bytes that could not be framed into a message.
    Decode,
}

/// Something observable happened on the node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// A neighbor completed its handshake.
    Connect { node_id: NodeId },
    /// A neighbor's last connection closed.
    Disconnect { node_id: NodeId },
    /// A broadcast reached this node for the first time.
    Broadcast { origin: NodeId, message: Value },
    /// A direct packet addressed to this node arrived.
    Direct { origin: NodeId, message: Value },
    /// An error with no caller to return it to. The node keeps running.
    Fault { kind: FaultKind, detail: String },
}
