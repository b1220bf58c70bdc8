//! Neighbor table — which node identity sits behind which connection.
//!
//! Entries appear only once a handshake has been received. At most one
//! connection is mapped per node; when a node handshakes on a second
//! connection the newer one takes over the mapping, while the older one
//! still resolves to the same identity until it closes. If the mapped
//! connection closes first, a surviving one takes the mapping back.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::identity::{ConnectionId, NodeId};

/// Public view of one neighbor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborInfo {
    pub node_id: NodeId,
    /// When the handshake completed.
    pub connected_at: DateTime<Utc>,
    /// Last time routed traffic arrived from this neighbor.
    pub last_seen: DateTime<Utc>,
}

/// Result of recording a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshaken {
    /// First live connection to this node.
    New,
    /// The node was already a neighbor over another connection, which is
    /// no longer the mapped one.
    Replaced(ConnectionId),
    /// Repeated handshake on the mapped connection.
    Unchanged,
}

struct Neighbor {
    connection: ConnectionId,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Mapping between node identities and the connections that carry them.
#[derive(Default)]
pub struct NeighborTable {
    by_node: HashMap<NodeId, Neighbor>,
    by_connection: HashMap<ConnectionId, NodeId>,
}

impl NeighborTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node_id` announced itself on `connection`.
    pub fn handshake(
        &mut self,
        node_id: NodeId,
        connection: ConnectionId,
    ) -> Result<Handshaken, NetworkError> {
        if let Some(known) = self.by_connection.get(&connection) {
            if *known != node_id {
                return Err(NetworkError::Protocol(format!(
                    "connection {connection} re-announced as {node_id} (was {known})"
                )));
            }
        }
        self.by_connection.insert(connection.clone(), node_id.clone());

        let now = Utc::now();
        match self.by_node.get_mut(&node_id) {
            Some(existing) if existing.connection == connection => Ok(Handshaken::Unchanged),
            Some(existing) => {
                let old = std::mem::replace(&mut existing.connection, connection);
                existing.last_seen = now;
                Ok(Handshaken::Replaced(old))
            }
            None => {
                self.by_node.insert(
                    node_id,
                    Neighbor {
                        connection,
                        connected_at: now,
                        last_seen: now,
                    },
                );
                Ok(Handshaken::New)
            }
        }
    }

    /// The node identity announced on `connection`, if any.
    pub fn resolve(&self, connection: &ConnectionId) -> Option<&NodeId> {
        self.by_connection.get(connection)
    }

    /// The connection currently carrying traffic to `node_id`.
    pub fn connection_for(&self, node_id: &NodeId) -> Result<&ConnectionId, NetworkError> {
        self.by_node
            .get(node_id)
            .map(|n| &n.connection)
            .ok_or_else(|| NetworkError::PeerNotFound(node_id.clone()))
    }

    /// Update the last-seen timestamp for a neighbor.
    pub fn touch(&mut self, node_id: &NodeId) {
        if let Some(neighbor) = self.by_node.get_mut(node_id) {
            neighbor.last_seen = Utc::now();
        }
    }

    /// Forget a closed connection. Returns the node that is no longer a
    /// neighbor, or `None` if the connection was never mapped (no handshake)
    /// or the node is still reachable over another connection.
    pub fn connection_closed(&mut self, connection: &ConnectionId) -> Option<NodeId> {
        let node_id = self.by_connection.remove(connection)?;
        let neighbor = self.by_node.get_mut(&node_id)?;
        if neighbor.connection != *connection {
            return None;
        }

        let survivor = self
            .by_connection
            .iter()
            .find(|(_, id)| **id == node_id)
            .map(|(conn, _)| conn.clone());
        match survivor {
            Some(survivor) => {
                neighbor.connection = survivor;
                None
            }
            None => {
                self.by_node.remove(&node_id);
                Some(node_id)
            }
        }
    }

    /// Every open connection on which `node_id` has handshaken.
    pub fn connections_of(&self, node_id: &NodeId) -> Vec<ConnectionId> {
        self.by_connection
            .iter()
            .filter(|(_, id)| *id == node_id)
            .map(|(conn, _)| conn.clone())
            .collect()
    }

    /// Whether `node_id` is a neighbor.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.by_node.contains_key(node_id)
    }

    /// Snapshot of every neighbor identity.
    pub fn ids(&self) -> Neighbors {
        let mut ids: Vec<NodeId> = self.by_node.keys().cloned().collect();
        ids.sort();
        Neighbors(ids)
    }

    /// Snapshot of every neighbor with its timestamps.
    pub fn list(&self) -> Vec<NeighborInfo> {
        self.by_node
            .iter()
            .map(|(node_id, n)| NeighborInfo {
                node_id: node_id.clone(),
                connected_at: n.connected_at,
                last_seen: n.last_seen,
            })
            .collect()
    }

    /// Number of neighbors.
    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.by_node.clear();
        self.by_connection.clear();
    }
}

/// A snapshot of neighbor identities. Iterate it as often as you like.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Neighbors(Vec<NodeId>);

impl Neighbors {
    pub fn iter(&self) -> std::slice::Iter<'_, NodeId> {
        self.0.iter()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.0.contains(node_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for Neighbors {
    type Item = NodeId;
    type IntoIter = std::vec::IntoIter<NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Neighbors {
    type Item = &'a NodeId;
    type IntoIter = std::slice::Iter<'a, NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
