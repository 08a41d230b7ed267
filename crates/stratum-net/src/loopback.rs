//! In-process transport backend.
//!
//! A [`LoopbackHub`] plays the role of the network: endpoints join it as the
//! host or as clients and exchange bytes through crossbeam channels with the
//! same star topology as the TCP relay (clients only reach the host). Every
//! endpoint counts its send calls. A hub built with
//! [`LoopbackHub::with_recording`] also keeps the bytes of each send so tests
//! can assert on exactly what left an endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender};

use crate::transport::{
    PeerEvent, PeerId, ReceivedData, Transport, TransportError, TransportMode,
};

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

struct Slot {
    inbox: Sender<ReceivedData>,
    events: Sender<PeerEvent>,
}

#[derive(Default)]
struct HubState {
    host: Option<PeerId>,
    slots: BTreeMap<PeerId, Slot>,
}

/// Shared in-process "network" that loopback endpoints attach to.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
    record_sends: bool,
}

impl LoopbackHub {
    /// Create an empty hub. Endpoints only count their sends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty hub whose endpoints keep a copy of every send.
    pub fn with_recording() -> Self {
        Self {
            record_sends: true,
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the session host.
    pub fn join_host(&self, peer: PeerId) -> LoopbackTransport {
        self.join(peer, true)
    }

    /// Attach a client.
    pub fn join_client(&self, peer: PeerId) -> LoopbackTransport {
        self.join(peer, false)
    }

    fn join(&self, peer: PeerId, is_host: bool) -> LoopbackTransport {
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        let mut state = self.lock();
        if is_host {
            state.host = Some(peer);
        }
        for (other, slot) in &state.slots {
            if *other != peer {
                let _ = slot.events.send(PeerEvent::Joined(peer));
            }
        }
        state.slots.insert(
            peer,
            Slot {
                inbox: inbox_tx,
                events: events_tx,
            },
        );
        drop(state);

        tracing::debug!(%peer, is_host, "loopback endpoint joined");

        LoopbackTransport {
            hub: self.clone(),
            local: peer,
            is_host,
            inbox: inbox_rx,
            events: events_rx,
            send_calls: AtomicUsize::new(0),
            sent: self.record_sends.then(|| Mutex::new(Vec::new())),
        }
    }

    /// Detach an endpoint, as if its connection dropped.
    pub fn leave(&self, peer: PeerId) {
        let mut state = self.lock();
        if state.slots.remove(&peer).is_none() {
            return;
        }
        if state.host == Some(peer) {
            state.host = None;
        }
        for slot in state.slots.values() {
            let _ = slot.events.send(PeerEvent::Left(peer));
        }
    }

    fn deliver(&self, from: PeerId, to: PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        let state = self.lock();
        let slot = state.slots.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        slot.inbox
            .send(ReceivedData {
                from,
                bytes: bytes.to_vec(),
            })
            .map_err(|_| TransportError::LinkClosed(to))
    }

    fn host(&self) -> Option<PeerId> {
        self.lock().host
    }

    fn members(&self) -> Vec<PeerId> {
        self.lock().slots.keys().copied().collect()
    }

    fn contains(&self, peer: PeerId) -> bool {
        self.lock().slots.contains_key(&peer)
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Which send primitive produced a [`SentRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    /// `send_to(peer, ..)`.
    To(PeerId),
    /// `send_to_all(..)`.
    All,
    /// `send_to_all_except(peer, ..)`.
    AllExcept(PeerId),
}

/// One recorded send call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    /// Primitive used.
    pub kind: SendKind,
    /// Bytes handed to the transport.
    pub bytes: Vec<u8>,
}

/// A loopback endpoint implementing [`Transport`].
pub struct LoopbackTransport {
    hub: LoopbackHub,
    local: PeerId,
    is_host: bool,
    inbox: Receiver<ReceivedData>,
    events: Receiver<PeerEvent>,
    send_calls: AtomicUsize,
    sent: Option<Mutex<Vec<SentRecord>>>,
}

impl LoopbackTransport {
    /// Number of send primitives invoked on this endpoint so far.
    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    /// Every send call made on this endpoint, oldest first. Empty unless the
    /// hub was built with [`LoopbackHub::with_recording`].
    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.as_ref().map_or_else(Vec::new, |sent| {
            sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
        })
    }

    fn record(&self, kind: SendKind, bytes: &[u8]) {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(sent) = &self.sent {
            sent.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(SentRecord {
                    kind,
                    bytes: bytes.to_vec(),
                });
        }
    }

    /// Direct links in the star: every other member for the host, the host
    /// for a client.
    fn links(&self) -> Vec<PeerId> {
        if self.is_host {
            self.hub
                .members()
                .into_iter()
                .filter(|peer| *peer != self.local)
                .collect()
        } else {
            self.hub
                .host()
                .filter(|host| *host != self.local)
                .into_iter()
                .collect()
        }
    }
}

impl Transport for LoopbackTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Loopback
    }

    fn is_connected(&self) -> bool {
        self.hub.contains(self.local) && self.hub.host().is_some()
    }

    fn is_host(&self) -> bool {
        self.is_host
    }

    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn host_peer_id(&self) -> PeerId {
        if self.is_host {
            self.local
        } else {
            self.hub.host().unwrap_or(self.local)
        }
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.links()
    }

    fn send_to(&self, peer: PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        self.record(SendKind::To(peer), bytes);
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if !self.is_host && Some(peer) != self.hub.host() {
            return Err(TransportError::Unreachable(peer));
        }
        self.hub.deliver(self.local, peer, bytes)
    }

    fn send_to_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.record(SendKind::All, bytes);
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        for peer in self.links() {
            self.hub.deliver(self.local, peer, bytes)?;
        }
        Ok(())
    }

    fn send_to_all_except(&self, excluded: PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        self.record(SendKind::AllExcept(excluded), bytes);
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        for peer in self.links().into_iter().filter(|peer| *peer != excluded) {
            self.hub.deliver(self.local, peer, bytes)?;
        }
        Ok(())
    }

    fn drain_received(&self) -> Vec<ReceivedData> {
        self.inbox.try_iter().collect()
    }

    fn drain_peer_events(&self) -> Vec<PeerEvent> {
        self.events.try_iter().collect()
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.hub.leave(self.local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn star() -> (LoopbackHub, LoopbackTransport, LoopbackTransport, LoopbackTransport) {
        let hub = LoopbackHub::with_recording();
        let host = hub.join_host(PeerId(1));
        let a = hub.join_client(PeerId(2));
        let b = hub.join_client(PeerId(3));
        (hub, host, a, b)
    }

    #[test]
    fn test_host_broadcast_reaches_every_client() {
        let (_hub, host, a, b) = star();
        host.send_to_all(b"dig").unwrap();

        for client in [&a, &b] {
            let received = client.drain_received();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].from, PeerId(1));
            assert_eq!(received[0].bytes, b"dig");
        }
        assert!(host.drain_received().is_empty());
    }

    #[test]
    fn test_client_broadcast_only_reaches_host() {
        let (_hub, host, a, b) = star();
        a.send_to_all(b"build").unwrap();

        assert_eq!(host.drain_received().len(), 1);
        assert!(b.drain_received().is_empty());
    }

    #[test]
    fn test_send_to_all_except_skips_excluded() {
        let (_hub, host, a, b) = star();
        host.send_to_all_except(PeerId(2), b"relay").unwrap();

        assert!(a.drain_received().is_empty());
        assert_eq!(b.drain_received().len(), 1);
    }

    #[test]
    fn test_client_cannot_address_other_client() {
        let (_hub, _host, a, _b) = star();
        assert_eq!(
            a.send_to(PeerId(3), b"x"),
            Err(TransportError::Unreachable(PeerId(3)))
        );
    }

    #[test]
    fn test_send_calls_are_recorded() {
        let (_hub, host, _a, _b) = star();
        host.send_to(PeerId(2), b"one").unwrap();
        host.send_to_all(b"two").unwrap();

        assert_eq!(host.send_calls(), 2);
        let sent = host.sent();
        assert_eq!(sent[0].kind, SendKind::To(PeerId(2)));
        assert_eq!(sent[1].kind, SendKind::All);
        assert_eq!(sent[1].bytes, b"two");
    }

    #[test]
    fn test_plain_hub_counts_without_keeping_bytes() {
        let hub = LoopbackHub::new();
        let host = hub.join_host(PeerId(1));
        let a = hub.join_client(PeerId(2));
        for _ in 0..100 {
            host.send_to_all(&[0xAB; 4096]).unwrap();
        }

        assert_eq!(host.send_calls(), 100);
        assert!(host.sent().is_empty());
        assert_eq!(a.drain_received().len(), 100);
    }

    #[test]
    fn test_connected_peers_follow_star_topology() {
        let (_hub, host, a, _b) = star();
        assert_eq!(host.connected_peers(), vec![PeerId(2), PeerId(3)]);
        assert_eq!(a.connected_peers(), vec![PeerId(1)]);
        assert_eq!(a.host_peer_id(), PeerId(1));
        assert!(host.is_host());
        assert!(!a.is_host());
    }

    #[test]
    fn test_client_without_host_is_disconnected() {
        let hub = LoopbackHub::new();
        let lonely = hub.join_client(PeerId(5));
        assert!(!lonely.is_connected());
        assert_eq!(
            lonely.send_to_all(b"x"),
            Err(TransportError::NotConnected)
        );
    }

    #[test]
    fn test_membership_events() {
        let hub = LoopbackHub::new();
        let host = hub.join_host(PeerId(1));
        let a = hub.join_client(PeerId(2));
        drop(a);

        assert_eq!(
            host.drain_peer_events(),
            vec![PeerEvent::Joined(PeerId(2)), PeerEvent::Left(PeerId(2))]
        );
        assert!(host.connected_peers().is_empty());
    }
}
