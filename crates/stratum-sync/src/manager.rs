//! Command manager: ties the transport to the command pipeline.
//!
//! The manager is split along the thread boundary:
//!
//! - [`InboundHandle`] is `Send + Sync` and cloneable. Network threads call
//!   [`InboundHandle::on_data_received`] to decode, relay (host only) and
//!   enqueue. It never touches the execution guard. Hard syncs are accepted
//!   only when they come from the host, so they are never relayed.
//! - [`CommandManager`] lives on the tick thread. It owns the handler table,
//!   the dispatcher and the re-entrancy guard, and is deliberately `!Sync`
//!   (the guard is a [`Cell`]).
//!
//! While a remote command executes, [`CommandManager::send_command`] returns
//! [`SendOutcome::Suppressed`] without touching the transport, so handlers
//! that fire the game's "player did something" hooks cannot echo the command
//! back onto the network.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender};
use stratum_config::SyncConfig;
use stratum_net::{PeerId, Transport};

use crate::codec::{self, MessageKind};
use crate::command::{CommandType, GameCommand};
use crate::dispatcher::{
    CommandDispatcher, ExecutedCommand, MalformedCommand, Origin, QueuedCommand,
};
use crate::registry::{CommandHandler, DecoderTable, HandlerTable};

// ---------------------------------------------------------------------------
// Outcomes and events
// ---------------------------------------------------------------------------

/// Result of a send attempt. Failures are logged, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport.
    Sent,
    /// Dropped because a remote command is executing.
    Suppressed,
    /// Dropped because the transport is not connected.
    NotConnected,
    /// Stamping, encoding or the transport failed.
    Failed,
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Queued for local execution, and relayed to other clients if `relayed`.
    Queued {
        /// Whether the host forwarded the message.
        relayed: bool,
    },
    /// Not command traffic.
    Ignored,
    /// Malformed or oversized; discarded.
    Dropped,
}

/// Counts from one [`CommandManager::process_pending_commands`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub executed: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// Header fields of a command, carried by [`CommandEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSummary {
    pub discriminant: u8,
    pub sender_id: PeerId,
    pub game_tick: i64,
}

impl CommandSummary {
    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_discriminant(self.discriminant)
    }
}

impl From<&GameCommand> for CommandSummary {
    fn from(command: &GameCommand) -> Self {
        Self {
            discriminant: command.discriminant(),
            sender_id: command.sender_id(),
            game_tick: command.game_tick(),
        }
    }
}

/// Pipeline notifications for logging and telemetry.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    /// A local command left this peer.
    Sent {
        command: CommandSummary,
        /// `true` when the host broadcast it, `false` when a client sent it
        /// to the host.
        broadcast: bool,
    },
    /// A command arrived and was queued.
    Received { command: CommandSummary, from: PeerId },
    /// The host forwarded a client's command to the other clients.
    Relayed { command: CommandSummary, from: PeerId },
    /// A handler applied the command.
    Executed { command: CommandSummary, origin: Origin },
    /// Validation or execution failed.
    Failed { command: CommandSummary, error: String },
    /// A message or command was discarded without execution.
    Dropped {
        /// Discriminant, if the header could be read.
        discriminant: Option<u8>,
        reason: String,
    },
}

/// Fan-out of [`CommandEvent`]s to crossbeam subscribers. Disconnected
/// subscribers are pruned on the next emit.
#[derive(Default)]
struct EventBus {
    subscribers: Mutex<Vec<Sender<CommandEvent>>>,
}

impl EventBus {
    fn subscribe(&self) -> Receiver<CommandEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn emit(&self, event: CommandEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

// ---------------------------------------------------------------------------
// Receive path
// ---------------------------------------------------------------------------

/// Thread-safe receive path of a [`CommandManager`].
#[derive(Clone)]
pub struct InboundHandle {
    transport: Arc<dyn Transport>,
    decoders: Arc<DecoderTable>,
    ingress: Sender<QueuedCommand>,
    malformed: Sender<MalformedCommand>,
    events: Arc<EventBus>,
    max_payload_bytes: usize,
}

impl InboundHandle {
    /// Decode, relay (host only) and enqueue one message from `from`.
    pub fn on_data_received(&self, from: PeerId, bytes: &[u8]) -> ReceiveOutcome {
        let envelope = match codec::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%from, "Dropping malformed message: {e}");
                self.drop_message(None, e.to_string());
                return ReceiveOutcome::Dropped;
            }
        };

        if envelope.kind() == MessageKind::Control {
            tracing::trace!(%from, discriminant = envelope.discriminant, "ignoring control message");
            return ReceiveOutcome::Ignored;
        }

        if envelope.payload_length() > self.max_payload_bytes {
            tracing::warn!(
                %from,
                len = envelope.payload_length(),
                max = self.max_payload_bytes,
                "Dropping oversized command"
            );
            self.drop_message(Some(envelope.discriminant), "payload too large".into());
            return ReceiveOutcome::Dropped;
        }

        let command = match self.decoders.decode(&envelope) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(
                    %from,
                    discriminant = envelope.discriminant,
                    "Dropping command with malformed payload: {e}"
                );
                if let Some(command_type) = CommandType::from_discriminant(envelope.discriminant) {
                    let _ = self.malformed.send(MalformedCommand {
                        command_type,
                        from,
                        sender_id: envelope.sender_id,
                        game_tick: envelope.game_tick,
                        error: e.to_string(),
                    });
                }
                self.drop_message(Some(envelope.discriminant), e.to_string());
                return ReceiveOutcome::Dropped;
            }
        };
        let summary = CommandSummary::from(&command);

        if command.command_type() == Some(CommandType::HardSync) {
            let host = self.transport.host_peer_id();
            if from != host || command.sender_id() != host {
                tracing::warn!(
                    %from,
                    sender = %command.sender_id(),
                    %host,
                    "Dropping hard sync that did not originate at the host"
                );
                self.drop_message(
                    Some(envelope.discriminant),
                    "hard sync from a non-host peer".into(),
                );
                return ReceiveOutcome::Dropped;
            }
        }

        // Star relay: the host forwards the validated bytes untouched, which
        // also carries payloads of types this build cannot decode.
        let mut relayed = false;
        if self.transport.is_host() && self.transport.connected_peers().len() > 1 {
            match self.transport.send_to_all_except(from, bytes) {
                Ok(()) => {
                    relayed = true;
                    tracing::trace!(%from, command = %command.label(), "relayed");
                    self.events.emit(CommandEvent::Relayed {
                        command: summary,
                        from,
                    });
                }
                Err(e) => tracing::warn!(%from, "Relay of {} failed: {e}", command.label()),
            }
        }

        let label = command.label();
        let queued = QueuedCommand {
            command,
            origin: Origin::Remote(from),
        };
        if self.ingress.send(queued).is_err() {
            tracing::debug!(%from, "Manager gone, discarding {label}");
            return ReceiveOutcome::Dropped;
        }

        tracing::debug!(%from, command = %label, tick = summary.game_tick, "received");
        self.events.emit(CommandEvent::Received {
            command: summary,
            from,
        });
        ReceiveOutcome::Queued { relayed }
    }

    /// Feed everything the transport has buffered through the receive path.
    /// Returns the number of messages processed.
    pub fn pump(&self) -> usize {
        let received = self.transport.drain_received();
        let count = received.len();
        for data in received {
            self.on_data_received(data.from, &data.bytes);
        }
        count
    }

    fn drop_message(&self, discriminant: Option<u8>, reason: String) {
        self.events.emit(CommandEvent::Dropped {
            discriminant,
            reason,
        });
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Sets a manager flag for its lifetime. Resets on drop, including during
/// unwinding.
struct FlagGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> FlagGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self { flag }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

enum Execution {
    Done,
    Failed,
    Unhandled,
}

/// Per-session orchestrator of the command pipeline. Lives on the tick thread.
pub struct CommandManager {
    transport: Arc<dyn Transport>,
    inbound: InboundHandle,
    handlers: HandlerTable,
    dispatcher: CommandDispatcher,
    events: Arc<EventBus>,
    game_tick: i64,
    max_payload_bytes: usize,
    executing_remote: Cell<bool>,
    in_batch: Cell<bool>,
    deferred: RefCell<Vec<GameCommand>>,
}

impl CommandManager {
    /// Create a manager with every built-in decoder.
    pub fn new(transport: Arc<dyn Transport>, config: &SyncConfig) -> Self {
        Self::with_decoders(
            transport,
            Arc::new(DecoderTable::builtin()),
            config.history_capacity,
            config.max_payload_bytes as usize,
        )
    }

    /// Create a manager with a custom decoder table.
    pub fn with_decoders(
        transport: Arc<dyn Transport>,
        decoders: Arc<DecoderTable>,
        history_capacity: usize,
        max_payload_bytes: usize,
    ) -> Self {
        let dispatcher = CommandDispatcher::new(history_capacity);
        let events = Arc::new(EventBus::default());
        let max_payload_bytes = max_payload_bytes.min(codec::MAX_PAYLOAD_LEN);
        let inbound = InboundHandle {
            transport: Arc::clone(&transport),
            decoders,
            ingress: dispatcher.ingress(),
            malformed: dispatcher.malformed_ingress(),
            events: Arc::clone(&events),
            max_payload_bytes,
        };

        tracing::info!(
            mode = ?transport.mode(),
            host = transport.is_host(),
            peer = %transport.local_peer_id(),
            "Command manager ready"
        );

        Self {
            transport,
            inbound,
            handlers: HandlerTable::new(),
            dispatcher,
            events,
            game_tick: 0,
            max_payload_bytes,
            executing_remote: Cell::new(false),
            in_batch: Cell::new(false),
            deferred: RefCell::new(Vec::new()),
        }
    }

    // --- Setup ---

    /// Register the execution handler for a command type.
    pub fn register_handler<H: CommandHandler + 'static>(&mut self, ty: CommandType, handler: H) {
        self.handlers.register(ty, handler);
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// A receive-path handle for network threads.
    pub fn inbound(&self) -> InboundHandle {
        self.inbound.clone()
    }

    /// Subscribe to pipeline events.
    pub fn subscribe(&self) -> Receiver<CommandEvent> {
        self.events.subscribe()
    }

    // --- Session state ---

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_host(&self) -> bool {
        self.transport.is_host()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    /// Current logical tick used when stamping outgoing commands.
    pub fn game_tick(&self) -> i64 {
        self.game_tick
    }

    /// Advance the logical tick. Ticks never go backwards; a lower value is
    /// ignored with a warning.
    pub fn set_game_tick(&mut self, tick: i64) {
        if tick < self.game_tick {
            tracing::warn!(current = self.game_tick, requested = tick, "Ignoring tick regression");
            return;
        }
        self.game_tick = tick;
    }

    /// Whether a remote command is executing right now.
    pub fn is_executing_remote_command(&self) -> bool {
        self.executing_remote.get()
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn pending_len(&self) -> usize {
        self.dispatcher.pending_len()
    }

    // --- Send path ---

    /// Stamp and transmit a locally issued command. The host broadcasts to
    /// every client; a client sends to the host only.
    pub fn send_command(&self, mut command: GameCommand) -> SendOutcome {
        if self.executing_remote.get() {
            tracing::debug!(command = %command.label(), "Suppressed send during remote execution");
            return SendOutcome::Suppressed;
        }
        if !self.transport.is_connected() {
            tracing::debug!(command = %command.label(), "Not connected, send skipped");
            return SendOutcome::NotConnected;
        }
        if !self.stamp_local(&mut command) {
            return SendOutcome::Failed;
        }
        self.transmit(&command)
    }

    /// Send a command and also queue it for local execution through the same
    /// handlers remote peers use. Works offline; the send is then skipped.
    pub fn dispatch(&self, mut command: GameCommand) -> SendOutcome {
        if self.executing_remote.get() {
            tracing::debug!(command = %command.label(), "Suppressed dispatch during remote execution");
            return SendOutcome::Suppressed;
        }
        if !self.stamp_local(&mut command) {
            return SendOutcome::Failed;
        }
        let outcome = if self.transport.is_connected() {
            self.transmit(&command)
        } else {
            SendOutcome::NotConnected
        };
        self.dispatcher.enqueue(command, Origin::Local);
        outcome
    }

    /// Send a protocol reply once the current batch has finished executing.
    ///
    /// Replies queued here bypass echo suppression because they are sent
    /// after the guard is released. Outside a batch the command is sent
    /// immediately.
    pub fn send_after_batch(&self, command: GameCommand) {
        if self.in_batch.get() {
            self.deferred.borrow_mut().push(command);
        } else {
            self.send_command(command);
        }
    }

    fn stamp_local(&self, command: &mut GameCommand) -> bool {
        match command.stamp(self.transport.local_peer_id(), self.game_tick) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(command = %command.label(), "Cannot stamp command: {e}");
                false
            }
        }
    }

    fn transmit(&self, command: &GameCommand) -> SendOutcome {
        let bytes = match codec::encode(command) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(command = %command.label(), "Failed to encode command: {e}");
                return SendOutcome::Failed;
            }
        };
        if bytes.len() - codec::HEADER_LEN > self.max_payload_bytes {
            tracing::warn!(
                command = %command.label(),
                len = bytes.len() - codec::HEADER_LEN,
                "Command payload exceeds the configured maximum"
            );
            return SendOutcome::Failed;
        }

        let broadcast = self.transport.is_host();
        let result = if broadcast {
            self.transport.send_to_all(&bytes)
        } else {
            self.transport.send_to(self.transport.host_peer_id(), &bytes)
        };

        match result {
            Ok(()) => {
                tracing::debug!(command = %command.label(), tick = command.game_tick(), broadcast, "sent");
                self.events.emit(CommandEvent::Sent {
                    command: CommandSummary::from(command),
                    broadcast,
                });
                SendOutcome::Sent
            }
            Err(e) => {
                tracing::warn!(command = %command.label(), "Send failed: {e}");
                SendOutcome::Failed
            }
        }
    }

    // --- Receive path ---

    /// Receive path on the calling thread. See [`InboundHandle::on_data_received`].
    pub fn on_data_received(&self, from: PeerId, bytes: &[u8]) -> ReceiveOutcome {
        self.inbound.on_data_received(from, bytes)
    }

    /// Drain the transport into the receive path (single-threaded loops).
    pub fn pump(&self) -> usize {
        self.inbound.pump()
    }

    // --- Drain path ---

    /// Execute every command queued before this call, in FIFO order. One
    /// command failing never stops the rest of the batch. Handlers first
    /// hear about payloads that failed to decode since the last drain.
    /// Deferred replies are sent afterwards.
    pub fn process_pending_commands(&mut self) -> BatchSummary {
        let malformed = self.dispatcher.drain_malformed();
        let batch = self.dispatcher.drain_pending();
        let mut summary = BatchSummary::default();

        {
            let _batch = FlagGuard::enter(&self.in_batch);
            for report in &malformed {
                self.report_malformed(report);
            }
            for queued in batch {
                match self.execute(&queued) {
                    Execution::Done => {
                        summary.executed += 1;
                        self.dispatcher.record(ExecutedCommand {
                            command: queued.command,
                            origin: queued.origin,
                            executed_at: self.game_tick,
                        });
                    }
                    Execution::Failed => summary.failed += 1,
                    Execution::Unhandled => summary.dropped += 1,
                }
            }
        }

        let replies = self.deferred.take();
        for reply in replies {
            self.send_command(reply);
        }

        if summary != BatchSummary::default() {
            tracing::trace!(?summary, "batch processed");
        }
        summary
    }

    fn execute(&self, queued: &QueuedCommand) -> Execution {
        let command = &queued.command;
        let summary = CommandSummary::from(command);

        let Some(ty) = command.command_type() else {
            tracing::warn!(
                discriminant = command.discriminant(),
                sender = %command.sender_id(),
                "Unhandled command type, dropping"
            );
            self.events.emit(CommandEvent::Dropped {
                discriminant: Some(command.discriminant()),
                reason: "unhandled command type".into(),
            });
            return Execution::Unhandled;
        };

        let Some(handler) = self.handlers.get(ty) else {
            tracing::warn!("No handler registered for {ty:?}, dropping command");
            self.events.emit(CommandEvent::Dropped {
                discriminant: Some(command.discriminant()),
                reason: "no handler registered".into(),
            });
            return Execution::Unhandled;
        };

        let result = {
            let _guard = queued
                .origin
                .is_remote()
                .then(|| FlagGuard::enter(&self.executing_remote));
            panic::catch_unwind(AssertUnwindSafe(|| {
                handler.validate(command).map_err(|e| ("validation", e))?;
                handler.handle(command, self).map_err(|e| ("execution", e))
            }))
        };

        let error = match result {
            Ok(Ok(())) => {
                self.events.emit(CommandEvent::Executed {
                    command: summary,
                    origin: queued.origin,
                });
                return Execution::Done;
            }
            Ok(Err((stage, e))) => {
                tracing::warn!(command = ?ty, sender = %command.sender_id(), stage, "Command rejected: {e}");
                e.to_string()
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(command = ?ty, sender = %command.sender_id(), "Handler panicked: {message}");
                format!("handler panicked: {message}")
            }
        };
        self.events.emit(CommandEvent::Failed {
            command: summary,
            error,
        });
        Execution::Failed
    }

    fn report_malformed(&self, malformed: &MalformedCommand) {
        let Some(handler) = self.handlers.get(malformed.command_type) else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| handler.on_malformed(malformed, self))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                command = ?malformed.command_type,
                from = %malformed.from,
                "Malformed-payload hook failed: {e}"
            ),
            Err(panic) => tracing::error!(
                command = ?malformed.command_type,
                from = %malformed.from,
                "Malformed-payload hook panicked: {}",
                panic_message(&*panic)
            ),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
