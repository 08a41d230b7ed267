//! Link-level frames exchanged by the TCP relay backend.
//!
//! These frames carry session plumbing (handshake, membership) and wrap the
//! opaque command bytes produced by the sync layer. They never appear on the
//! loopback backend.
//!
//! Wire format: `[version: u8] [postcard-encoded LinkFrame]`.

use serde::{Deserialize, Serialize};

use crate::transport::PeerId;

/// Current link protocol version. Prepended to every encoded frame.
pub const LINK_PROTOCOL_VERSION: u8 = 1;

/// A single frame on a host/client TCP link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LinkFrame {
    /// Client opens the link.
    Hello {
        /// Display name of the connecting peer.
        peer_name: String,
    },
    /// Host accepts the link and assigns an identity.
    Welcome {
        /// Identifier assigned to the connecting client.
        peer_id: PeerId,
        /// Identifier of the host.
        host_id: PeerId,
        /// Clients already in the session.
        peers: Vec<PeerId>,
    },
    /// Host refuses the link.
    Rejected {
        /// Human-readable reason.
        reason: String,
    },
    /// Another client joined the session.
    PeerJoined {
        /// The new client.
        peer_id: PeerId,
    },
    /// A client left the session.
    PeerLeft {
        /// The departed client.
        peer_id: PeerId,
    },
    /// Opaque message bytes for the layer above.
    Data(Vec<u8>),
}

/// Errors that can occur while decoding a link frame.
#[derive(Debug, thiserror::Error)]
pub enum LinkFrameError {
    /// The frame body was empty (no version byte).
    #[error("empty link frame: no version byte")]
    EmptyFrame,

    /// The version byte does not match [`LINK_PROTOCOL_VERSION`].
    #[error("unsupported link protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard (de)serialization failed.
    #[error("link frame serialization error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Encode a [`LinkFrame`] into a versioned binary body.
pub fn encode_link_frame(frame: &LinkFrame) -> Result<Vec<u8>, LinkFrameError> {
    let body = postcard::to_allocvec(frame)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(LINK_PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a versioned binary body into a [`LinkFrame`].
pub fn decode_link_frame(data: &[u8]) -> Result<LinkFrame, LinkFrameError> {
    let (&version, body) = data.split_first().ok_or(LinkFrameError::EmptyFrame)?;
    if version != LINK_PROTOCOL_VERSION {
        return Err(LinkFrameError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}
