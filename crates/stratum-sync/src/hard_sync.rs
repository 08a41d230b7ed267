//! Hard sync: full-state snapshots that correct accumulated drift.
//!
//! Only the host originates snapshots. A snapshot travels as an ordinary
//! [`CommandType::HardSync`] command from the host to its clients. Clients
//! accept it only from the host and verify it before touching local state.
//! A snapshot that fails to decode, decompress or hash-check is discarded and
//! answered with a [`CommandType::SyncRequest`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stratum_config::HardSyncConfig;
use stratum_net::{CompressionConfig, CompressionError, PeerId, compress_payload, decompress_payload};

use crate::command::{CommandPayload, CommandType, GameCommand};
use crate::dispatcher::MalformedCommand;
use crate::manager::{CommandManager, SendOutcome};
use crate::registry::{CommandHandler, HandlerError, HandlerResult};

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncReason {
    NewDay,
    ManualSave,
    ClientRequest,
    InitialJoin,
}

/// Errors raised while building or applying a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum HardSyncError {
    /// The compressed block could not be unpacked.
    #[error("snapshot decompression failed: {0}")]
    Decompress(#[from] CompressionError),

    /// The decompressed state does not hash to the advertised digest.
    #[error("snapshot integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// Hex digest carried by the snapshot.
        expected: String,
        /// Hex digest of the received state.
        actual: String,
    },

    /// The decompressed state has the wrong size.
    #[error("snapshot length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Size carried by the snapshot.
        expected: u32,
        /// Size after decompression.
        actual: usize,
    },

    /// The state does not fit the snapshot's 32-bit length field.
    #[error("state of {0} bytes is too large for a snapshot")]
    StateTooLarge(usize),

    /// The local world refused to capture or restore.
    #[error("world state error: {0}")]
    World(#[from] WorldStateError),
}

/// Error reported by a [`WorldState`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct WorldStateError(pub String);

/// The simulation state a snapshot captures and restores.
pub trait WorldState: Send {
    /// Serialize the full simulation state.
    fn capture(&self) -> Result<Vec<u8>, WorldStateError>;

    /// Replace the full simulation state.
    fn restore(&mut self, state: &[u8]) -> Result<(), WorldStateError>;

    /// Current in-game day.
    fn cycle(&self) -> i32;

    /// Fraction of the current day elapsed, `0.0..1.0`.
    fn time_of_day(&self) -> f32;
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Compressed full simulation state plus integrity metadata.
///
/// `data` is the last field so it is also the tail of the wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardSyncSnapshot {
    pub reason: SyncReason,
    pub cycle: i32,
    pub time_of_day: f32,
    /// Size of the state before compression.
    pub uncompressed_len: u32,
    /// SHA-256 over `reason`, `cycle`, `time_of_day` and the uncompressed
    /// state.
    pub hash: [u8; 32],
    /// Flagged LZ4 block (see `stratum_net::compression`).
    pub data: Vec<u8>,
}

impl HardSyncSnapshot {
    /// Compress and hash a captured state.
    pub fn create(
        state: &[u8],
        reason: SyncReason,
        cycle: i32,
        time_of_day: f32,
    ) -> Result<Self, HardSyncError> {
        let uncompressed_len =
            u32::try_from(state.len()).map_err(|_| HardSyncError::StateTooLarge(state.len()))?;
        Ok(Self {
            reason,
            cycle,
            time_of_day,
            uncompressed_len,
            hash: digest(state, reason, cycle, time_of_day),
            data: compress_payload(state, &CompressionConfig::always()),
        })
    }

    /// Decompress and verify. Returns the state only if size and hash match.
    pub fn open(&self) -> Result<Vec<u8>, HardSyncError> {
        let config = CompressionConfig::always();
        let state = decompress_payload(&self.data, &config)?;
        if state.len() != self.uncompressed_len as usize {
            return Err(HardSyncError::LengthMismatch {
                expected: self.uncompressed_len,
                actual: state.len(),
            });
        }
        let actual = digest(&state, self.reason, self.cycle, self.time_of_day);
        if actual != self.hash {
            return Err(HardSyncError::IntegrityMismatch {
                expected: hex::encode(self.hash),
                actual: hex::encode(actual),
            });
        }
        Ok(state)
    }

    /// Hex digest for logs.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

fn digest(state: &[u8], reason: SyncReason, cycle: i32, time_of_day: f32) -> [u8; 32] {
    Sha256::new()
        .chain_update([reason as u8])
        .chain_update(cycle.to_le_bytes())
        .chain_update(time_of_day.to_le_bytes())
        .chain_update(state)
        .finalize()
        .into()
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Executes hard-sync traffic against a shared [`WorldState`].
///
/// On the host it answers [`CommandType::SyncRequest`] with a fresh snapshot.
/// On clients it applies [`CommandType::HardSync`] after verification.
pub struct HardSyncService<S> {
    world: Arc<Mutex<S>>,
}

impl<S: WorldState + 'static> HardSyncService<S> {
    /// Create the service and register it for both hard-sync command types.
    pub fn install(world: Arc<Mutex<S>>, manager: &mut CommandManager) -> Arc<Self> {
        let service = Arc::new(Self { world });

        manager.register_handler(CommandType::HardSync, SnapshotHandler(Arc::clone(&service)));

        let on_request = Arc::clone(&service);
        manager.register_handler(
            CommandType::SyncRequest,
            move |command: &GameCommand, manager: &CommandManager| -> HandlerResult {
                on_request.answer_request(command, manager)
            },
        );

        service
    }

    fn world(&self) -> MutexGuard<'_, S> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capture the local world into a snapshot.
    pub fn build_snapshot(&self, reason: SyncReason) -> Result<HardSyncSnapshot, HardSyncError> {
        let world = self.world();
        let state = world.capture()?;
        HardSyncSnapshot::create(&state, reason, world.cycle(), world.time_of_day())
    }

    /// Build a snapshot and send it to every client. Host only.
    pub fn trigger(&self, manager: &CommandManager, reason: SyncReason) -> SendOutcome {
        if !manager.is_host() {
            tracing::debug!(?reason, "Ignoring hard-sync trigger on a client");
            return SendOutcome::Suppressed;
        }
        match self.build_snapshot(reason) {
            Ok(snapshot) => {
                tracing::info!(
                    ?reason,
                    cycle = snapshot.cycle,
                    bytes = snapshot.data.len(),
                    hash = %snapshot.hash_hex(),
                    "Distributing hard sync"
                );
                manager.send_command(GameCommand::hard_sync(snapshot))
            }
            Err(e) => {
                tracing::error!(?reason, "Failed to build hard-sync snapshot: {e}");
                SendOutcome::Failed
            }
        }
    }

    fn apply_snapshot(&self, command: &GameCommand, manager: &CommandManager) -> HandlerResult {
        let CommandPayload::HardSync(snapshot) = command.payload() else {
            return Err(HandlerError::UnexpectedPayload {
                expected: CommandType::HardSync,
                actual: command.label(),
            });
        };
        if manager.is_host() {
            tracing::debug!(sender = %command.sender_id(), "Host ignores incoming hard sync");
            return Ok(());
        }
        let host = manager.transport().host_peer_id();
        if command.sender_id() != host {
            tracing::warn!(
                sender = %command.sender_id(),
                %host,
                cycle = snapshot.cycle,
                "Rejected hard sync from a non-host peer"
            );
            return Err(HandlerError::Rejected(format!(
                "hard sync from {} but the host is {host}",
                command.sender_id()
            )));
        }

        let state = match snapshot.open() {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(
                    sender = %command.sender_id(),
                    cycle = snapshot.cycle,
                    "Rejected hard sync: {e}"
                );
                self.request_resync(manager, Some(snapshot.cycle));
                return Err(e.into());
            }
        };

        if let Err(e) = self.world().restore(&state) {
            tracing::error!(cycle = snapshot.cycle, "Failed to restore hard sync: {e}");
            self.request_resync(manager, Some(snapshot.cycle));
            return Err(HardSyncError::World(e).into());
        }

        tracing::info!(
            reason = ?snapshot.reason,
            cycle = snapshot.cycle,
            bytes = state.len(),
            "Applied hard sync"
        );
        Ok(())
    }

    fn answer_request(&self, command: &GameCommand, manager: &CommandManager) -> HandlerResult {
        let CommandPayload::SyncRequest(request) = command.payload() else {
            return Err(HandlerError::UnexpectedPayload {
                expected: CommandType::SyncRequest,
                actual: command.label(),
            });
        };
        if !manager.is_host() {
            return Ok(());
        }

        tracing::info!(
            sender = %command.sender_id(),
            reason = ?request.reason,
            last_cycle = ?request.last_applied_cycle,
            "Peer requested a hard sync"
        );
        let snapshot = self.build_snapshot(SyncReason::ClientRequest)?;
        manager.send_after_batch(GameCommand::hard_sync(snapshot));
        Ok(())
    }

    /// A snapshot from the host arrived but its payload could not be decoded.
    fn snapshot_undecodable(
        &self,
        malformed: &MalformedCommand,
        manager: &CommandManager,
    ) -> HandlerResult {
        if manager.is_host() || malformed.from != manager.transport().host_peer_id() {
            return Ok(());
        }
        tracing::error!(
            from = %malformed.from,
            tick = malformed.game_tick,
            "Undecodable hard sync: {}",
            malformed.error
        );
        self.request_resync(manager, None);
        Ok(())
    }

    fn request_resync(&self, manager: &CommandManager, last_cycle: Option<i32>) {
        manager.send_after_batch(GameCommand::sync_request(SyncReason::ClientRequest, last_cycle));
    }
}

/// Routes [`CommandType::HardSync`] traffic, including snapshots that failed
/// to decode, into a [`HardSyncService`].
struct SnapshotHandler<S>(Arc<HardSyncService<S>>);

impl<S: WorldState + 'static> CommandHandler for SnapshotHandler<S> {
    fn handle(&self, command: &GameCommand, manager: &CommandManager) -> HandlerResult {
        self.0.apply_snapshot(command, manager)
    }

    fn on_malformed(
        &self,
        malformed: &MalformedCommand,
        manager: &CommandManager,
    ) -> HandlerResult {
        self.0.snapshot_undecodable(malformed, manager)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Decides when the host should distribute a snapshot.
pub struct HardSyncScheduler {
    config: HardSyncConfig,
    is_host: bool,
    last_cycle: Option<i32>,
}

impl HardSyncScheduler {
    pub fn new(config: HardSyncConfig, is_host: bool) -> Self {
        Self {
            config,
            is_host,
            last_cycle: None,
        }
    }

    /// Report the current day. Fires once each time the day changes; the
    /// first report only sets the baseline.
    pub fn on_cycle(&mut self, cycle: i32) -> Option<SyncReason> {
        let previous = self.last_cycle.replace(cycle);
        let new_day = previous.is_some_and(|previous| cycle > previous);
        (new_day && self.config.on_new_day && self.allowed(SyncReason::NewDay))
            .then_some(SyncReason::NewDay)
    }

    pub fn on_manual_save(&self) -> Option<SyncReason> {
        (self.config.on_manual_save && self.allowed(SyncReason::ManualSave))
            .then_some(SyncReason::ManualSave)
    }

    pub fn on_peer_joined(&self, peer: PeerId) -> Option<SyncReason> {
        if !(self.config.on_peer_join && self.allowed(SyncReason::InitialJoin)) {
            return None;
        }
        tracing::debug!(%peer, "Scheduling hard sync for new peer");
        Some(SyncReason::InitialJoin)
    }

    fn allowed(&self, reason: SyncReason) -> bool {
        if !self.is_host {
            tracing::debug!(?reason, "Hard-sync triggers only fire on the host");
        }
        self.is_host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn colony_state(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 7) as u8).collect()
    }

    #[test]
    fn test_snapshot_open_roundtrip() {
        let state = colony_state(10_000);
        let snapshot = HardSyncSnapshot::create(&state, SyncReason::NewDay, 12, 0.25).unwrap();

        assert_eq!(snapshot.uncompressed_len, 10_000);
        assert!(snapshot.data.len() < state.len());
        assert_eq!(snapshot.open().unwrap(), state);
    }

    #[test]
    fn test_hash_covers_metadata_and_state() {
        let snapshot = HardSyncSnapshot::create(b"abc", SyncReason::ManualSave, 7, 0.5).unwrap();

        let mut hashed = vec![SyncReason::ManualSave as u8];
        hashed.extend_from_slice(&7i32.to_le_bytes());
        hashed.extend_from_slice(&0.5f32.to_le_bytes());
        hashed.extend_from_slice(b"abc");
        assert_eq!(snapshot.hash_hex(), hex::encode(Sha256::digest(&hashed)));
    }

    #[test]
    fn test_tampered_metadata_is_integrity_mismatch() {
        let state = colony_state(2048);
        let original = HardSyncSnapshot::create(&state, SyncReason::NewDay, 12, 0.25).unwrap();

        let mut cycle = original.clone();
        cycle.cycle = 13;
        let mut time_of_day = original.clone();
        time_of_day.time_of_day = 0.75;
        let mut reason = original.clone();
        reason.reason = SyncReason::ClientRequest;

        for tampered in [cycle, time_of_day, reason] {
            assert!(matches!(
                tampered.open(),
                Err(HardSyncError::IntegrityMismatch { .. })
            ));
        }
        assert_eq!(original.open().unwrap(), state);
    }

    #[test]
    fn test_corrupted_literal_is_integrity_mismatch() {
        let state = colony_state(4096);
        let mut snapshot = HardSyncSnapshot::create(&state, SyncReason::NewDay, 3, 0.0).unwrap();
        // LZ4 blocks always end in literals.
        let last = snapshot.data.len() - 1;
        snapshot.data[last] ^= 0xFF;

        assert!(matches!(
            snapshot.open(),
            Err(HardSyncError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn test_tampered_length_is_rejected() {
        let mut snapshot =
            HardSyncSnapshot::create(&colony_state(512), SyncReason::InitialJoin, 1, 0.5).unwrap();
        snapshot.uncompressed_len = 100;
        assert!(matches!(
            snapshot.open(),
            Err(HardSyncError::LengthMismatch { expected: 100, actual: 512 })
        ));
    }

    #[test]
    fn test_truncated_data_fails_to_decompress() {
        let mut snapshot =
            HardSyncSnapshot::create(&colony_state(512), SyncReason::InitialJoin, 1, 0.5).unwrap();
        snapshot.data.truncate(3);
        assert!(matches!(snapshot.open(), Err(HardSyncError::Decompress(_))));
    }

    #[test]
    fn test_scheduler_fires_once_per_new_day() {
        let mut scheduler = HardSyncScheduler::new(HardSyncConfig::default(), true);
        assert_eq!(scheduler.on_cycle(1), None);
        assert_eq!(scheduler.on_cycle(1), None);
        assert_eq!(scheduler.on_cycle(2), Some(SyncReason::NewDay));
        assert_eq!(scheduler.on_cycle(2), None);
    }

    #[test]
    fn test_scheduler_respects_config() {
        let config = HardSyncConfig {
            on_new_day: false,
            on_manual_save: false,
            on_peer_join: true,
        };
        let mut scheduler = HardSyncScheduler::new(config, true);
        scheduler.on_cycle(1);
        assert_eq!(scheduler.on_cycle(2), None);
        assert_eq!(scheduler.on_manual_save(), None);
        assert_eq!(scheduler.on_peer_joined(PeerId(4)), Some(SyncReason::InitialJoin));
    }

    #[test]
    fn test_scheduler_is_silent_on_clients() {
        let mut scheduler = HardSyncScheduler::new(HardSyncConfig::default(), false);
        scheduler.on_cycle(1);
        assert_eq!(scheduler.on_cycle(2), None);
        assert_eq!(scheduler.on_manual_save(), None);
        assert_eq!(scheduler.on_peer_joined(PeerId(2)), None);
    }
}
