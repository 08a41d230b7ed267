//! Backend-agnostic transport interface.
//!
//! Everything above this layer talks to a [`Transport`] and never to sockets.
//! Two backends implement it: the in-process [`LoopbackHub`](crate::LoopbackHub)
//! and the TCP star relay ([`TcpHostTransport`](crate::TcpHostTransport) /
//! [`TcpClientTransport`](crate::TcpClientTransport)).
//!
//! Sends are fire-and-forget: they hand bytes to the backend and return
//! without waiting for delivery. Received data is buffered by the backend and
//! collected with [`Transport::drain_received`].

use std::fmt;

use serde::{Deserialize, Serialize};

pub use stratum_config::TransportMode;

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Opaque identifier of a peer within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Bytes that arrived from a directly connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedData {
    /// The peer the bytes came from on this link (the host, for clients).
    pub from: PeerId,
    /// Raw message bytes, exactly as sent.
    pub bytes: Vec<u8>,
}

/// Session membership change observed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer joined the session.
    Joined(PeerId),
    /// A peer left or lost its connection.
    Left(PeerId),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by transport send operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The local endpoint is not part of a live session.
    #[error("transport is not connected")]
    NotConnected,
    /// No connection exists to the requested peer.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    /// Clients only have a link to the host.
    #[error("{0} is not reachable from a client link")]
    Unreachable(PeerId),
    /// The background writer for a link has shut down.
    #[error("link to {0} is closed")]
    LinkClosed(PeerId),
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Send/receive primitive shared by every backend.
pub trait Transport: Send + Sync {
    /// Which backend this is. Informational only.
    fn mode(&self) -> TransportMode;

    /// Whether the local endpoint is part of a live session.
    fn is_connected(&self) -> bool;

    /// Whether the local endpoint is the session host.
    fn is_host(&self) -> bool;

    /// Identifier of the local endpoint.
    fn local_peer_id(&self) -> PeerId;

    /// Identifier of the session host.
    fn host_peer_id(&self) -> PeerId;

    /// Peers the local endpoint has a direct link to. For the host these are
    /// all clients; for a client it is just the host.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Send bytes to one directly linked peer.
    fn send_to(&self, peer: PeerId, bytes: &[u8]) -> Result<(), TransportError>;

    /// Send bytes to every directly linked peer.
    fn send_to_all(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Send bytes to every directly linked peer except `excluded`.
    fn send_to_all_except(&self, excluded: PeerId, bytes: &[u8]) -> Result<(), TransportError>;

    /// Take every message received since the last call, in arrival order.
    fn drain_received(&self) -> Vec<ReceivedData>;

    /// Take every membership change observed since the last call.
    fn drain_peer_events(&self) -> Vec<PeerEvent> {
        Vec::new()
    }
}
