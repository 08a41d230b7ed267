//! Host side of the TCP star relay.
//!
//! The host binds a listener, performs the `Hello`/`Welcome` handshake with
//! each client and assigns it a [`PeerId`]. Every link gets a reader task that
//! pushes received data into a crossbeam inbox, and a writer task fed by an
//! unbounded channel so [`Transport`] sends never block the caller.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use stratum_config::NetworkConfig;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::framing::{FrameError, read_frame, write_frame};
use crate::link::LinkFrame;
use crate::transport::{
    PeerEvent, PeerId, ReceivedData, Transport, TransportError, TransportMode,
};

/// Identifier the host always uses for itself.
pub const HOST_PEER_ID: PeerId = PeerId(1);

/// How long a new connection may take to send its `Hello`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Atomic generator for client [`PeerId`]s. Starts after [`HOST_PEER_ID`].
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 2.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(HOST_PEER_ID.0 + 1),
        }
    }

    /// Return the next unique [`PeerId`].
    pub fn next_id(&self) -> PeerId {
        PeerId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientLink {
    name: String,
    outbound: mpsc::UnboundedSender<LinkFrame>,
}

struct HostShared {
    links: RwLock<BTreeMap<PeerId, ClientLink>>,
    id_gen: IdGenerator,
    inbox_tx: Sender<ReceivedData>,
    events_tx: Sender<PeerEvent>,
    max_peers: usize,
    max_frame_bytes: u32,
}

impl HostShared {
    fn peers(&self) -> Vec<PeerId> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    fn push_to(&self, peer: PeerId, frame: LinkFrame) -> Result<(), TransportError> {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        let link = links.get(&peer).ok_or(TransportError::UnknownPeer(peer))?;
        link.outbound
            .send(frame)
            .map_err(|_| TransportError::LinkClosed(peer))
    }

    fn push_all_except(
        &self,
        excluded: Option<PeerId>,
        frame: &LinkFrame,
    ) -> Result<(), TransportError> {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        let mut result = Ok(());
        for (peer, link) in links.iter() {
            if Some(*peer) == excluded {
                continue;
            }
            // Keep going on a dead link so the remaining peers still get it.
            if link.outbound.send(frame.clone()).is_err() {
                result = Err(TransportError::LinkClosed(*peer));
            }
        }
        result
    }

    fn remove(&self, peer: PeerId) {
        let removed = self
            .links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer);
        if let Some(link) = removed {
            tracing::info!(%peer, name = %link.name, "peer left");
            let _ = self.events_tx.send(PeerEvent::Left(peer));
            let _ = self.push_all_except(None, &LinkFrame::PeerLeft { peer_id: peer });
        }
    }
}

/// Host endpoint of the TCP star relay.
pub struct TcpHostTransport {
    shared: Arc<HostShared>,
    inbox_rx: Receiver<ReceivedData>,
    events_rx: Receiver<PeerEvent>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpHostTransport {
    /// Bind to `host_address:port` from the network config and start
    /// accepting clients on the current tokio runtime.
    pub async fn bind(config: &NetworkConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.endpoint()).await?;
        Self::with_listener(listener, config.max_peers as usize, config.max_frame_bytes)
    }

    /// Start accepting clients on a pre-bound listener (useful for tests).
    pub fn with_listener(
        listener: TcpListener,
        max_peers: usize,
        max_frame_bytes: u32,
    ) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(HostShared {
            links: RwLock::new(BTreeMap::new()),
            id_gen: IdGenerator::new(),
            inbox_tx,
            events_tx,
            max_peers,
            max_frame_bytes,
        });

        tracing::info!("Host listening on {local_addr}");
        tokio::spawn(accept_loop(listener, Arc::clone(&shared), shutdown_rx));

        Ok(Self {
            shared,
            inbox_rx,
            events_rx,
            local_addr,
            shutdown_tx,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and close every link.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.shared
            .links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for TcpHostTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for TcpHostTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Relay
    }

    fn is_connected(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    fn is_host(&self) -> bool {
        true
    }

    fn local_peer_id(&self) -> PeerId {
        HOST_PEER_ID
    }

    fn host_peer_id(&self) -> PeerId {
        HOST_PEER_ID
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.peers()
    }

    fn send_to(&self, peer: PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.shared.push_to(peer, LinkFrame::Data(bytes.to_vec()))
    }

    fn send_to_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.shared
            .push_all_except(None, &LinkFrame::Data(bytes.to_vec()))
    }

    fn send_to_all_except(&self, excluded: PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.shared
            .push_all_except(Some(excluded), &LinkFrame::Data(bytes.to_vec()))
    }

    fn drain_received(&self) -> Vec<ReceivedData> {
        self.inbox_rx.try_iter().collect()
    }

    fn drain_peer_events(&self) -> Vec<PeerEvent> {
        self.events_rx.try_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<HostShared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let shared = Arc::clone(&shared);
                        let shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = admit(stream, peer_addr, shared, shutdown).await {
                                tracing::warn!("Handshake with {peer_addr} failed: {e}");
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Accept failed: {e}"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Host shutting down");
                    break;
                }
            }
        }
    }
}

/// Run the handshake for one connection and, if accepted, start its tasks.
async fn admit(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<HostShared>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), FrameError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let max = shared.max_frame_bytes;

    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader, max))
        .await
        .map_err(|_| FrameError::ConnectionClosed)??;
    let LinkFrame::Hello { peer_name } = hello else {
        let reason = "expected Hello".to_string();
        write_frame(&mut writer, &LinkFrame::Rejected { reason }, max).await?;
        return Ok(());
    };

    if shared.peers().len() >= shared.max_peers {
        tracing::warn!("Session full, rejecting {peer_addr}");
        let reason = "session is full".to_string();
        write_frame(&mut writer, &LinkFrame::Rejected { reason }, max).await?;
        return Ok(());
    }

    let peer = shared.id_gen.next_id();
    let welcome = LinkFrame::Welcome {
        peer_id: peer,
        host_id: HOST_PEER_ID,
        peers: shared.peers(),
    };
    write_frame(&mut writer, &welcome, max).await?;

    let _ = shared.push_all_except(None, &LinkFrame::PeerJoined { peer_id: peer });

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    shared
        .links
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(
            peer,
            ClientLink {
                name: peer_name.clone(),
                outbound,
            },
        );
    let _ = shared.events_tx.send(PeerEvent::Joined(peer));
    tracing::info!(%peer, name = %peer_name, "Accepted {peer_addr}");

    tokio::spawn(write_loop(writer, outbound_rx, max));
    read_loop(peer, reader, &shared, shutdown_rx).await;
    shared.remove(peer);
    Ok(())
}

async fn read_loop(
    peer: PeerId,
    mut reader: OwnedReadHalf,
    shared: &HostShared,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = read_frame(&mut reader, shared.max_frame_bytes) => {
                match result {
                    Ok(LinkFrame::Data(bytes)) => {
                        tracing::trace!(%peer, len = bytes.len(), "data frame");
                        if shared.inbox_tx.send(ReceivedData { from: peer, bytes }).is_err() {
                            break;
                        }
                    }
                    Ok(other) => tracing::debug!(%peer, "ignoring link frame {other:?}"),
                    Err(FrameError::ConnectionClosed) => break,
                    Err(e) => {
                        tracing::warn!(%peer, "link error: {e}");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Drains a link's outbound channel onto the socket. Ends when the link is
/// dropped from the map or the socket fails.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<LinkFrame>,
    max_frame_bytes: u32,
) {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame, max_frame_bytes).await {
            tracing::warn!("write failed: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generator_starts_after_host() {
        let id_gen = IdGenerator::new();
        assert_eq!(id_gen.next_id(), PeerId(2));
        assert_eq!(id_gen.next_id(), PeerId(3));
    }

    #[tokio::test]
    async fn test_host_reports_identity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = TcpHostTransport::with_listener(listener, 4, 1 << 20).unwrap();
        assert!(host.is_host());
        assert!(host.is_connected());
        assert_eq!(host.local_peer_id(), HOST_PEER_ID);
        assert!(host.connected_peers().is_empty());
        assert_eq!(host.mode(), TransportMode::Relay);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = TcpHostTransport::with_listener(listener, 4, 1 << 20).unwrap();
        assert_eq!(
            host.send_to(PeerId(9), b"x"),
            Err(TransportError::UnknownPeer(PeerId(9)))
        );
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = TcpHostTransport::with_listener(listener, 4, 1 << 20).unwrap();
        host.shutdown();
        assert!(!host.is_connected());
        assert_eq!(host.send_to_all(b"x"), Err(TransportError::NotConnected));
    }
}
