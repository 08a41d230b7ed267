//! Peer transport: the backend-agnostic [`Transport`] trait, an in-process
//! loopback backend, and a TCP star relay with its framing and compression.

pub mod compression;
pub mod framing;
pub mod link;
pub mod loopback;
pub mod tcp_client;
pub mod tcp_host;
pub mod transport;

pub use compression::{CompressionConfig, CompressionError, compress_payload, decompress_payload};
pub use framing::{FrameError, read_frame, write_frame};
pub use link::{LINK_PROTOCOL_VERSION, LinkFrame, LinkFrameError};
pub use loopback::{LoopbackHub, LoopbackTransport, SendKind, SentRecord};
pub use tcp_client::{ConnectError, ConnectionState, ConnectionStateWatch, TcpClientTransport};
pub use tcp_host::{HOST_PEER_ID, IdGenerator, TcpHostTransport};
pub use transport::{PeerEvent, PeerId, ReceivedData, Transport, TransportError, TransportMode};
