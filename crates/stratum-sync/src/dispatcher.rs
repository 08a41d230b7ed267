//! Pending queue and execution history.
//!
//! The ingress side is a multi-producer crossbeam channel: network threads
//! push decoded commands through cloned [`Sender`]s while the tick thread is
//! the single consumer. The history is a bounded ring that evicts the oldest
//! entry first.

use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender};
use stratum_net::PeerId;

use crate::command::{CommandType, GameCommand};

/// Default number of executed commands kept in the history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Where a queued command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Dispatched by this peer.
    Local,
    /// Received over the link from this peer (the host, for clients).
    Remote(PeerId),
}

impl Origin {
    pub fn is_remote(self) -> bool {
        matches!(self, Origin::Remote(_))
    }
}

/// A command waiting for local execution.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: GameCommand,
    pub origin: Origin,
}

/// A message of a known command type whose payload failed to decode.
///
/// Handed to the type's handler on the next drain so protocols can react to
/// a broken transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedCommand {
    pub command_type: CommandType,
    /// Peer the bytes arrived from.
    pub from: PeerId,
    /// Sender claimed by the header.
    pub sender_id: PeerId,
    pub game_tick: i64,
    pub error: String,
}

/// A command that was applied to local state.
#[derive(Debug, Clone)]
pub struct ExecutedCommand {
    pub command: GameCommand,
    pub origin: Origin,
    /// Local tick at which it was executed.
    pub executed_at: i64,
}

/// FIFO pending queue plus bounded execution history.
pub struct CommandDispatcher {
    ingress_tx: Sender<QueuedCommand>,
    ingress_rx: Receiver<QueuedCommand>,
    malformed_tx: Sender<MalformedCommand>,
    malformed_rx: Receiver<MalformedCommand>,
    history: VecDeque<ExecutedCommand>,
    history_capacity: usize,
}

impl CommandDispatcher {
    /// Create a dispatcher keeping at most `history_capacity` executed
    /// commands.
    pub fn new(history_capacity: usize) -> Self {
        let (ingress_tx, ingress_rx) = crossbeam_channel::unbounded();
        let (malformed_tx, malformed_rx) = crossbeam_channel::unbounded();
        Self {
            ingress_tx,
            ingress_rx,
            malformed_tx,
            malformed_rx,
            history: VecDeque::with_capacity(history_capacity.min(DEFAULT_HISTORY_CAPACITY)),
            history_capacity,
        }
    }

    /// A producer handle that can be moved to other threads.
    pub fn ingress(&self) -> Sender<QueuedCommand> {
        self.ingress_tx.clone()
    }

    /// A producer handle for payloads that failed to decode.
    pub fn malformed_ingress(&self) -> Sender<MalformedCommand> {
        self.malformed_tx.clone()
    }

    /// Take every malformed report queued so far, oldest first.
    pub fn drain_malformed(&self) -> Vec<MalformedCommand> {
        let available = self.malformed_rx.len();
        self.malformed_rx.try_iter().take(available).collect()
    }

    /// Queue a command for the next drain.
    pub fn enqueue(&self, command: GameCommand, origin: Origin) {
        // The dispatcher owns a receiver, so the channel cannot be disconnected.
        let _ = self.ingress_tx.send(QueuedCommand { command, origin });
    }

    /// Number of commands waiting.
    pub fn pending_len(&self) -> usize {
        self.ingress_rx.len()
    }

    /// Take every command queued at the time of the call, in FIFO order.
    /// Commands that arrive while the batch executes wait for the next drain.
    pub fn drain_pending(&self) -> Vec<QueuedCommand> {
        let available = self.ingress_rx.len();
        self.ingress_rx.try_iter().take(available).collect()
    }

    /// Append to the history, evicting the oldest entry when full.
    pub fn record(&mut self, executed: ExecutedCommand) {
        if self.history_capacity == 0 {
            return;
        }
        while self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(executed);
    }

    /// Executed commands, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ExecutedCommand> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPayload;

    fn executed(speed: u8, tick: i64) -> ExecutedCommand {
        ExecutedCommand {
            command: GameCommand::set_speed(speed),
            origin: Origin::Local,
            executed_at: tick,
        }
    }

    #[test]
    fn test_malformed_reports_drain_separately() {
        let dispatcher = CommandDispatcher::default();
        let reports = dispatcher.malformed_ingress();
        reports
            .send(MalformedCommand {
                command_type: CommandType::HardSync,
                from: PeerId(1),
                sender_id: PeerId(1),
                game_tick: 40,
                error: "bad enum".into(),
            })
            .unwrap();

        assert_eq!(dispatcher.pending_len(), 0);
        let drained = dispatcher.drain_malformed();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].command_type, CommandType::HardSync);
        assert!(dispatcher.drain_malformed().is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let dispatcher = CommandDispatcher::default();
        for speed in 1..=3 {
            dispatcher.enqueue(GameCommand::set_speed(speed), Origin::Local);
        }
        let drained = dispatcher.drain_pending();
        let speeds: Vec<_> = drained
            .iter()
            .map(|queued| match queued.command.payload() {
                CommandPayload::SetSpeed(body) => body.speed,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert_eq!(speeds, vec![1, 2, 3]);
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[test]
    fn test_drain_is_a_snapshot() {
        let dispatcher = CommandDispatcher::default();
        dispatcher.enqueue(GameCommand::set_pause(true), Origin::Local);
        let ingress = dispatcher.ingress();

        let batch = dispatcher.drain_pending();
        ingress
            .send(QueuedCommand {
                command: GameCommand::set_pause(false),
                origin: Origin::Remote(PeerId(2)),
            })
            .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(dispatcher.pending_len(), 1);
    }

    #[test]
    fn test_producers_on_other_threads() {
        let dispatcher = CommandDispatcher::default();
        let handles: Vec<_> = (0..4)
            .map(|peer| {
                let ingress = dispatcher.ingress();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        ingress
                            .send(QueuedCommand {
                                command: GameCommand::set_pause(true),
                                origin: Origin::Remote(PeerId(peer)),
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(dispatcher.drain_pending().len(), 100);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut dispatcher = CommandDispatcher::new(1000);
        for tick in 0..1500 {
            dispatcher.record(executed(1, tick));
        }

        assert_eq!(dispatcher.history_len(), 1000);
        let ticks: Vec<_> = dispatcher.history().map(|e| e.executed_at).collect();
        assert_eq!(ticks, (500..1500).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut dispatcher = CommandDispatcher::new(0);
        dispatcher.record(executed(2, 0));
        assert_eq!(dispatcher.history_len(), 0);
    }

    #[test]
    fn test_origin_is_remote() {
        assert!(Origin::Remote(PeerId(1)).is_remote());
        assert!(!Origin::Local.is_remote());
    }
}
