//! One peer's view of a running session: command pipeline, world, and the
//! hard-sync schedule, advanced one tick at a time.

use std::sync::{Arc, Mutex, MutexGuard};

use stratum_config::Config;
use stratum_net::{PeerEvent, Transport};
use stratum_sync::{
    BatchSummary, CommandManager, GameCommand, HardSyncScheduler, HardSyncService, SendOutcome,
};

use crate::ledger::{self, ColonyLedger};

/// Per-peer session state driven by the tick loop.
pub struct Session {
    manager: CommandManager,
    ledger: Arc<Mutex<ColonyLedger>>,
    hard_sync: Arc<HardSyncService<ColonyLedger>>,
    scheduler: HardSyncScheduler,
    ticks_per_cycle: u32,
    tick: i64,
}

impl Session {
    /// Build the pipeline on top of an already connected transport.
    pub fn new(transport: Arc<dyn Transport>, config: &Config) -> Self {
        let is_host = transport.is_host();
        let mut manager = CommandManager::new(transport, &config.sync);
        let ledger = Arc::new(Mutex::new(ColonyLedger::new()));

        ledger::register_handlers(&mut manager, &ledger);
        let hard_sync = HardSyncService::install(Arc::clone(&ledger), &mut manager);

        tracing::info!(
            peer = %manager.local_peer_id(),
            is_host,
            handlers = manager.handlers().registered_types().len(),
            "Session ready"
        );

        Self {
            manager,
            ledger,
            hard_sync,
            scheduler: HardSyncScheduler::new(config.hard_sync.clone(), is_host),
            ticks_per_cycle: config.sync.ticks_per_cycle,
            tick: 0,
        }
    }

    pub fn manager(&self) -> &CommandManager {
        &self.manager
    }

    pub fn ledger(&self) -> MutexGuard<'_, ColonyLedger> {
        ledger::lock(&self.ledger)
    }

    pub fn tick(&self) -> i64 {
        self.tick
    }

    /// Issue a local command: broadcast it and apply it here.
    pub fn issue(&self, command: GameCommand) -> SendOutcome {
        self.manager.dispatch(command)
    }

    /// The player saved; the host may distribute a snapshot.
    pub fn manual_save(&self) -> Option<SendOutcome> {
        let reason = self.scheduler.on_manual_save()?;
        Some(self.hard_sync.trigger(&self.manager, reason))
    }

    /// Run one simulation tick.
    pub fn step(&mut self) -> BatchSummary {
        self.manager.pump();
        self.handle_peer_events();

        let summary = self.manager.process_pending_commands();
        if summary.failed > 0 || summary.dropped > 0 {
            tracing::debug!(
                tick = self.tick,
                failed = summary.failed,
                dropped = summary.dropped,
                "Batch had rejected commands"
            );
        }

        self.tick += 1;
        self.manager.set_game_tick(self.tick);
        let cycle = self.ledger().advance(self.tick, self.ticks_per_cycle);
        if let Some(reason) = self.scheduler.on_cycle(cycle) {
            tracing::info!(cycle, "New day");
            self.hard_sync.trigger(&self.manager, reason);
        }

        summary
    }

    fn handle_peer_events(&self) {
        for event in self.manager.transport().drain_peer_events() {
            match event {
                PeerEvent::Joined(peer) => {
                    tracing::info!(%peer, "Peer joined");
                    if let Some(reason) = self.scheduler.on_peer_joined(peer) {
                        self.hard_sync.trigger(&self.manager, reason);
                    }
                }
                PeerEvent::Left(peer) => tracing::info!(%peer, "Peer left"),
            }
        }
    }
}
