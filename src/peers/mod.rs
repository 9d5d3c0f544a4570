//! Peer discovery and connection lifecycle
//!
//! Consumer side: [`DiscoveryRegistry`] listens for announcements and keeps
//! one [`PeerConnection`] per producer. Producer side: [`Producer`] owns the
//! ring and announces it.

pub mod connection;
pub mod producer;
pub mod registry;

pub use connection::{ConnectionStatus, PeerConnection, PeerState};
pub use producer::{Producer, ProducerEvent};
pub use registry::{DiscoveryRegistry, RegistryStats};

use serde::Serialize;

use crate::protocol::StreamFormat;

/// Why a connection left the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// No announcement within the timeout
    Timeout,
    /// Producer re-announced with a different return port or format
    Replaced,
    /// Registry closed
    Shutdown,
}

/// Notifications from a registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Connected {
        name: String,
        stream_name: String,
        format: StreamFormat,
    },
    Disconnected {
        name: String,
        reason: DisconnectReason,
    },
    /// Text the producer sent over the back-channel
    Command { name: String, text: String },
}

/// Capacity of event channels. Events beyond it are dropped rather than
/// blocking a polling or receive thread.
pub(crate) const EVENT_CAPACITY: usize = 256;
