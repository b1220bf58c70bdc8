//! Identifiers — node identities, connection handles and packet ids.
//!
//! All three are random UUID v4 strings. A [`NodeId`] is generated once per
//! node and lives as long as the process; it is never persisted. A
//! [`ConnectionId`] names one live TCP link and stays inside the crate.
//! A [`PacketId`] is minted once at the originating node and carried
//! unchanged through every re-emission of a routed packet.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random identifier (UUID v4).
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Wrap an existing string.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string representation.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// The logical address of a node in the overlay.
    NodeId
);

string_id!(
    /// Opaque handle for one live transport connection.
    ConnectionId
);

string_id!(
    /// Unique id of a routed packet, shared by all of its copies.
    PacketId
);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
