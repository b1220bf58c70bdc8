//! Hive Overlay — a flooding peer-to-peer overlay over plain TCP.
//!
//! Each [`OverlayNode`] gets a random identity, links directly to other nodes
//! over TCP, and offers two routing primitives on top of that link graph:
//! network-wide broadcast and direct delivery to a node that need not be a
//! neighbor. Both are flood-based with a hop budget and duplicate
//! suppression; neither is reliable.
//!
//! # Architecture
//!
//! - **Framing**: JSON objects written back to back, split on `}{` with
//!   merge-and-retry for delimiters inside strings.
//! - **Transport**: TCP listener and dialer, one reader and one writer task
//!   per connection.
//! - **Identity**: a handshake on every link maps node identities to
//!   connections.
//! - **Routing**: ttl-bounded flooding with a seen-packet cache.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hive_overlay::{NodeConfig, NodeEvent, OverlayNode};
//!
//! # async fn example() -> Result<(), hive_overlay::NetworkError> {
//! let a = OverlayNode::new(NodeConfig::default());
//! let b = OverlayNode::new(NodeConfig::default());
//! let addr = b.listen(9002).await?;
//!
//! let mut events = b.subscribe();
//! a.connect("127.0.0.1", addr.port()).await?;
//! a.broadcast(serde_json::json!({"text": "hi"})).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let NodeEvent::Broadcast { origin, message } = event {
//!         println!("{origin}: {message}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod framing;
pub mod identity;
pub mod logging;
pub mod message;
pub mod neighbor;
pub mod node;
pub mod router;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NodeConfig;
pub use error::NetworkError;
pub use event::{FaultKind, NodeEvent};
pub use identity::{ConnectionId, NodeId, PacketId};
pub use message::{PacketKind, RoutedPacket, WireMessage};
pub use neighbor::{NeighborInfo, Neighbors};
pub use node::OverlayNode;
