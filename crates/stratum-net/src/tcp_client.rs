//! Client side of the TCP star relay.
//!
//! [`TcpClientTransport::connect`] performs the `Hello`/`Welcome` handshake on
//! the calling task, then spawns a reader task (data into a crossbeam inbox,
//! membership frames into the known-peer set) and a writer task fed by an
//! unbounded channel. State changes are broadcast via a [`watch`] channel so
//! any number of consumers can react without polling.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::framing::{FrameError, read_frame, write_frame};
use crate::link::LinkFrame;
use crate::transport::{
    PeerEvent, PeerId, ReceivedData, Transport, TransportError, TransportMode,
};

/// How long the host may take to answer the `Hello`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Welcome received, ready for communication.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Errors that can occur while joining a host.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Framing failure during the handshake.
    #[error("handshake failed: {0}")]
    Frame(#[from] FrameError),
    /// The host did not answer in time.
    #[error("host did not answer within {0:?}")]
    Timeout(Duration),
    /// The host refused the connection.
    #[error("rejected by host: {0}")]
    Rejected(String),
    /// The host answered with something other than `Welcome`.
    #[error("unexpected handshake frame")]
    UnexpectedFrame,
}

/// Client endpoint of the TCP star relay.
pub struct TcpClientTransport {
    local: PeerId,
    host: PeerId,
    state: Arc<ConnectionStateWatch>,
    outbound: mpsc::UnboundedSender<LinkFrame>,
    inbox_rx: Receiver<ReceivedData>,
    events_rx: Receiver<PeerEvent>,
    known_peers: Arc<RwLock<BTreeSet<PeerId>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpClientTransport {
    /// Connect to the host at `addr` and complete the handshake.
    pub async fn connect(
        addr: SocketAddr,
        peer_name: &str,
        max_frame_bytes: u32,
    ) -> Result<Self, ConnectError> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let hello = LinkFrame::Hello {
            peer_name: peer_name.to_string(),
        };
        write_frame(&mut writer, &hello, max_frame_bytes).await?;

        let answer = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader, max_frame_bytes))
            .await
            .map_err(|_| ConnectError::Timeout(HANDSHAKE_TIMEOUT))??;

        let (local, host, peers) = match answer {
            LinkFrame::Welcome {
                peer_id,
                host_id,
                peers,
            } => (peer_id, host_id, peers),
            LinkFrame::Rejected { reason } => {
                state.set(ConnectionState::Disconnected);
                return Err(ConnectError::Rejected(reason));
            }
            _ => {
                state.set(ConnectionState::Disconnected);
                return Err(ConnectError::UnexpectedFrame);
            }
        };

        state.set(ConnectionState::Connected);
        tracing::info!(%local, %host, "Joined session at {addr}");

        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let known_peers = Arc::new(RwLock::new(peers.into_iter().collect::<BTreeSet<_>>()));

        let reader_task = ReaderTask {
            host,
            state: Arc::clone(&state),
            inbox_tx,
            events_tx,
            known_peers: Arc::clone(&known_peers),
            max_frame_bytes,
        };
        tokio::spawn(reader_task.run(reader, shutdown_rx.clone()));
        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            Arc::clone(&state),
            shutdown_rx,
            max_frame_bytes,
        ));

        Ok(Self {
            local,
            host,
            state,
            outbound,
            inbox_rx,
            events_rx,
            known_peers,
            shutdown_tx,
        })
    }

    /// Return the connection state watch.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    /// Other clients the host has announced, excluding this one.
    pub fn session_peers(&self) -> Vec<PeerId> {
        self.known_peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .filter(|peer| *peer != self.local)
            .collect()
    }

    /// Leave the session. Background tasks exit and the state flips to
    /// [`ConnectionState::Disconnected`] immediately.
    pub fn disconnect(&self) {
        self.shutdown_tx.send_replace(true);
        self.state.set(ConnectionState::Disconnected);
    }

    fn push(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(LinkFrame::Data(bytes.to_vec()))
            .map_err(|_| TransportError::LinkClosed(self.host))
    }
}

impl Drop for TcpClientTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Transport for TcpClientTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Relay
    }

    fn is_connected(&self) -> bool {
        self.state.current() == ConnectionState::Connected
    }

    fn is_host(&self) -> bool {
        false
    }

    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn host_peer_id(&self) -> PeerId {
        self.host
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        if self.is_connected() {
            vec![self.host]
        } else {
            Vec::new()
        }
    }

    fn send_to(&self, peer: PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        if peer != self.host {
            return Err(TransportError::Unreachable(peer));
        }
        self.push(bytes)
    }

    fn send_to_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.push(bytes)
    }

    fn send_to_all_except(&self, excluded: PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        if excluded == self.host {
            return Ok(());
        }
        self.push(bytes)
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

struct ReaderTask {
    host: PeerId,
    state: Arc<ConnectionStateWatch>,
    inbox_tx: Sender<ReceivedData>,
    events_tx: Sender<PeerEvent>,
    known_peers: Arc<RwLock<BTreeSet<PeerId>>>,
    max_frame_bytes: u32,
}

impl ReaderTask {
    async fn run(self, mut reader: OwnedReadHalf, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = read_frame(&mut reader, self.max_frame_bytes) => {
                    match result {
                        Ok(frame) => self.on_frame(frame),
                        Err(FrameError::ConnectionClosed) => {
                            tracing::info!("Host closed the connection");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("link error: {e}");
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
        self.state.set(ConnectionState::Disconnected);
    }

    fn on_frame(&self, frame: LinkFrame) {
        match frame {
            LinkFrame::Data(bytes) => {
                let _ = self.inbox_tx.send(ReceivedData {
                    from: self.host,
                    bytes,
                });
            }
            LinkFrame::PeerJoined { peer_id } => {
                self.known_peers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(peer_id);
                let _ = self.events_tx.send(PeerEvent::Joined(peer_id));
            }
            LinkFrame::PeerLeft { peer_id } => {
                self.known_peers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&peer_id);
                let _ = self.events_tx.send(PeerEvent::Left(peer_id));
            }
            other => tracing::debug!("ignoring link frame {other:?}"),
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<LinkFrame>,
    state: Arc<ConnectionStateWatch>,
    mut shutdown_rx: watch::Receiver<bool>,
    max_frame_bytes: u32,
) {
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame, max_frame_bytes).await {
                    tracing::warn!("write to host failed: {e}");
                    state.set(ConnectionState::Disconnected);
                    break;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_host::{HOST_PEER_ID, TcpHostTransport};
    use tokio::net::TcpListener;

    const MAX: u32 = 1 << 20;

    async fn host() -> TcpHostTransport {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        TcpHostTransport::with_listener(listener, 2, MAX).unwrap()
    }

    /// Poll until `f` yields something or a second passes.
    async fn wait_for<T>(mut f: impl FnMut() -> Vec<T>) -> Vec<T> {
        for _ in 0..100 {
            let items = f();
            if !items.is_empty() {
                return items;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Vec::new()
    }

    #[test]
    fn test_connection_state_transitions() {
        let watch = ConnectionStateWatch::new();
        assert_eq!(watch.current(), ConnectionState::Disconnected);
        watch.set(ConnectionState::Connecting);
        assert_eq!(watch.current(), ConnectionState::Connecting);
        watch.set(ConnectionState::Connected);
        assert_eq!(watch.current(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_handshake_assigns_ids() {
        let host = host().await;
        let client = TcpClientTransport::connect(host.local_addr(), "Ada", MAX)
            .await
            .unwrap();

        assert!(client.is_connected());
        assert_eq!(client.local_peer_id(), PeerId(2));
        assert_eq!(client.host_peer_id(), HOST_PEER_ID);
        assert_eq!(client.connected_peers(), vec![HOST_PEER_ID]);

        let events = wait_for(|| host.drain_peer_events()).await;
        assert_eq!(events, vec![PeerEvent::Joined(PeerId(2))]);
    }

    #[tokio::test]
    async fn test_data_flows_both_ways() {
        let host = host().await;
        let client = TcpClientTransport::connect(host.local_addr(), "Ada", MAX)
            .await
            .unwrap();
        let _ = wait_for(|| host.drain_peer_events()).await;

        client.send_to_all(b"dig 42").unwrap();
        let at_host = wait_for(|| host.drain_received()).await;
        assert_eq!(at_host[0].from, PeerId(2));
        assert_eq!(at_host[0].bytes, b"dig 42");

        host.send_to(PeerId(2), b"ack").unwrap();
        let at_client = wait_for(|| client.drain_received()).await;
        assert_eq!(at_client[0].from, HOST_PEER_ID);
        assert_eq!(at_client[0].bytes, b"ack");
    }

    #[tokio::test]
    async fn test_full_session_rejects_extra_client() {
        let host = host().await;
        let _a = TcpClientTransport::connect(host.local_addr(), "A", MAX)
            .await
            .unwrap();
        let _b = TcpClientTransport::connect(host.local_addr(), "B", MAX)
            .await
            .unwrap();
        let _ = wait_for(|| {
            let peers = host.connected_peers();
            if peers.len() == 2 { peers } else { Vec::new() }
        })
        .await;

        let result = TcpClientTransport::connect(host.local_addr(), "C", MAX).await;
        assert!(matches!(result, Err(ConnectError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_client_only_reaches_host() {
        let host = host().await;
        let client = TcpClientTransport::connect(host.local_addr(), "Ada", MAX)
            .await
            .unwrap();
        assert_eq!(
            client.send_to(PeerId(7), b"x"),
            Err(TransportError::Unreachable(PeerId(7)))
        );
        assert_eq!(client.send_to_all_except(HOST_PEER_ID, b"x"), Ok(()));
    }

    #[tokio::test]
    async fn test_disconnect_is_clean() {
        let host = host().await;
        let client = TcpClientTransport::connect(host.local_addr(), "Ada", MAX)
            .await
            .unwrap();
        client.disconnect();
        assert_eq!(client.state().current(), ConnectionState::Disconnected);
        assert_eq!(client.send_to_all(b"x"), Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_host_sees_client_leave() {
        let host = host().await;
        let client = TcpClientTransport::connect(host.local_addr(), "Ada", MAX)
            .await
            .unwrap();
        let _ = wait_for(|| host.drain_peer_events()).await;

        drop(client);
        let events = wait_for(|| host.drain_peer_events()).await;
        assert_eq!(events, vec![PeerEvent::Left(PeerId(2))]);
        assert!(host.connected_peers().is_empty());
    }
}
