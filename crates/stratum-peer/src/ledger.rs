//! In-memory colony world used by the headless peer.
//!
//! The ledger keeps just enough state per command type to make divergence
//! visible: two peers that applied the same commands in the same order hold
//! byte-identical captures.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use stratum_sync::command::{DoorState, PriorityValue, ScheduleBlock};
use stratum_sync::{
    CommandManager, CommandPayload, CommandType, GameCommand, HandlerError, HandlerResult,
    WorldState, WorldStateError,
};

/// Errand a minion is working on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveChore {
    pub minion_id: u64,
    pub chore_type: String,
    pub target_cell: Option<i32>,
}

/// Colony state tracked by the demo peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColonyLedger {
    cycle: i32,
    time_of_day: f32,
    speed: u8,
    paused: bool,
    dig_orders: BTreeSet<i32>,
    buildings: BTreeMap<i32, String>,
    deconstruct_orders: BTreeSet<i32>,
    priorities: BTreeMap<i32, PriorityValue>,
    doors: BTreeMap<i32, DoorState>,
    storage_filters: BTreeMap<i32, Vec<String>>,
    minion_targets: BTreeMap<u64, i32>,
    chores: BTreeMap<u64, ActiveChore>,
    completed_chores: u64,
    entities: BTreeMap<u64, Vec<u8>>,
    research_queue: Vec<String>,
    skills: BTreeMap<u64, Vec<String>>,
    schedules: BTreeMap<u32, Vec<ScheduleBlock>>,
    applied: u64,
}

impl ColonyLedger {
    pub fn new() -> Self {
        Self {
            speed: 1,
            ..Self::default()
        }
    }

    /// Advance the clock to `tick`. Returns the current cycle.
    pub fn advance(&mut self, tick: i64, ticks_per_cycle: u32) -> i32 {
        let per_cycle = i64::from(ticks_per_cycle.max(1));
        self.cycle = (tick / per_cycle) as i32;
        self.time_of_day = (tick % per_cycle) as f32 / per_cycle as f32;
        self.cycle
    }

    /// Number of commands applied since the last restore.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn active_chores(&self) -> usize {
        self.chores.len()
    }

    /// Apply one command to the ledger.
    pub fn apply(&mut self, command: &GameCommand) -> HandlerResult {
        match command.payload() {
            CommandPayload::MoveTo(body) => {
                self.minion_targets.insert(body.minion_id, body.target_cell);
            }
            CommandPayload::Dig(body) => {
                self.dig_orders.extend(body.cells.iter().copied());
                if let Some(priority) = body.priority {
                    for cell in &body.cells {
                        self.priorities.insert(*cell, priority);
                    }
                }
            }
            CommandPayload::Build(body) => {
                if self.buildings.contains_key(&body.cell) {
                    return Err(HandlerError::Apply(format!(
                        "cell {} is already occupied",
                        body.cell
                    )));
                }
                self.buildings.insert(body.cell, body.building_id.clone());
            }
            CommandPayload::Deconstruct(body) => {
                for cell in &body.cells {
                    if self.buildings.contains_key(cell) {
                        self.deconstruct_orders.insert(*cell);
                    }
                }
            }
            CommandPayload::Cancel(body) => {
                for cell in &body.cells {
                    self.dig_orders.remove(cell);
                    self.deconstruct_orders.remove(cell);
                }
            }
            CommandPayload::SetPriority(body) => {
                self.priorities.insert(body.cell, body.priority);
            }
            CommandPayload::SetDoorState(body) => {
                self.doors.insert(body.cell, body.state);
            }
            CommandPayload::SetStorageFilter(body) => {
                self.storage_filters.insert(body.cell, body.tags.clone());
            }
            CommandPayload::SetSpeed(body) => {
                if !(1..=3).contains(&body.speed) {
                    return Err(HandlerError::Rejected(format!(
                        "speed {} out of range",
                        body.speed
                    )));
                }
                self.speed = body.speed;
            }
            CommandPayload::SetPause(body) => self.paused = body.paused,
            CommandPayload::ChoreStart(body) => {
                self.chores.insert(
                    body.chore_id,
                    ActiveChore {
                        minion_id: body.minion_id,
                        chore_type: body.chore_type.clone(),
                        target_cell: body.target_cell,
                    },
                );
            }
            CommandPayload::ChoreEnd(body) => {
                if self.chores.remove(&body.chore_id).is_some() && body.completed {
                    self.completed_chores += 1;
                }
            }
            CommandPayload::EntityState(body) => {
                self.entities.insert(body.entity_id, body.state.clone());
            }
            CommandPayload::ResearchSync(body) => {
                self.research_queue = body.active_tech.iter().chain(&body.queue).cloned().collect();
            }
            CommandPayload::SkillSync(body) => {
                self.skills.insert(body.minion_id, body.mastered.clone());
            }
            CommandPayload::ScheduleSync(body) => {
                self.schedules.insert(body.schedule_id, body.blocks.clone());
            }
            CommandPayload::HardSync(_) | CommandPayload::SyncRequest(_) | CommandPayload::Unknown => {
                return Err(HandlerError::Apply(format!(
                    "{} is not a ledger command",
                    command.label()
                )));
            }
        }
        self.applied += 1;
        Ok(())
    }
}

#[cfg(test)]
impl ColonyLedger {
    pub fn is_dig_ordered(&self, cell: i32) -> bool {
        self.dig_orders.contains(&cell)
    }

    pub fn building_at(&self, cell: i32) -> Option<&str> {
        self.buildings.get(&cell).map(String::as_str)
    }

    pub fn door_state(&self, cell: i32) -> Option<DoorState> {
        self.doors.get(&cell).copied()
    }
}

impl WorldState for ColonyLedger {
    fn capture(&self) -> Result<Vec<u8>, WorldStateError> {
        postcard::to_allocvec(self).map_err(|e| WorldStateError(e.to_string()))
    }

    fn restore(&mut self, state: &[u8]) -> Result<(), WorldStateError> {
        *self = postcard::from_bytes(state).map_err(|e| WorldStateError(e.to_string()))?;
        Ok(())
    }

    fn cycle(&self) -> i32 {
        self.cycle
    }

    fn time_of_day(&self) -> f32 {
        self.time_of_day
    }
}

/// Command types the ledger applies. Hard-sync traffic is handled separately.
pub const LEDGER_COMMANDS: [CommandType; 16] = [
    CommandType::MoveTo,
    CommandType::Dig,
    CommandType::Build,
    CommandType::Deconstruct,
    CommandType::Cancel,
    CommandType::SetPriority,
    CommandType::SetDoorState,
    CommandType::SetStorageFilter,
    CommandType::SetSpeed,
    CommandType::SetPause,
    CommandType::ChoreStart,
    CommandType::ChoreEnd,
    CommandType::EntityState,
    CommandType::ResearchSync,
    CommandType::SkillSync,
    CommandType::ScheduleSync,
];

pub(crate) fn lock(ledger: &Mutex<ColonyLedger>) -> MutexGuard<'_, ColonyLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Route every ledger command type on `manager` into the shared ledger.
pub fn register_handlers(manager: &mut CommandManager, ledger: &Arc<Mutex<ColonyLedger>>) {
    for ty in LEDGER_COMMANDS {
        let ledger = Arc::clone(ledger);
        manager.register_handler(
            ty,
            move |command: &GameCommand, _: &CommandManager| -> HandlerResult {
                lock(&ledger).apply(command)
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_sync::command::PriorityClass;

    #[test]
    fn test_apply_dig_and_cancel() {
        let mut ledger = ColonyLedger::new();
        let priority = PriorityValue {
            class: PriorityClass::High,
            value: 7,
        };
        ledger.apply(&GameCommand::dig(vec![10, 11], Some(priority))).unwrap();
        assert!(ledger.is_dig_ordered(10));
        assert!(ledger.is_dig_ordered(11));

        ledger.apply(&GameCommand::cancel(vec![10], 0)).unwrap();
        assert!(!ledger.is_dig_ordered(10));
        assert_eq!(ledger.applied(), 2);
    }

    #[test]
    fn test_build_on_occupied_cell_fails() {
        let mut ledger = ColonyLedger::new();
        ledger.apply(&GameCommand::build(5, "Tile", 0, Vec::new())).unwrap();
        assert_eq!(ledger.building_at(5), Some("Tile"));

        let result = ledger.apply(&GameCommand::build(5, "Ladder", 0, Vec::new()));
        assert!(matches!(result, Err(HandlerError::Apply(_))));
        assert_eq!(ledger.building_at(5), Some("Tile"));
        assert_eq!(ledger.applied(), 1);
    }

    #[test]
    fn test_speed_out_of_range_rejected() {
        let mut ledger = ColonyLedger::new();
        assert!(ledger.apply(&GameCommand::set_speed(9)).is_err());
        assert_eq!(ledger.speed(), 1);
        ledger.apply(&GameCommand::set_speed(3)).unwrap();
        assert_eq!(ledger.speed(), 3);
    }

    #[test]
    fn test_chore_lifecycle() {
        let mut ledger = ColonyLedger::new();
        ledger
            .apply(&GameCommand::chore_start(1, 40, "Dig", Some(10)))
            .unwrap();
        assert_eq!(ledger.active_chores(), 1);
        ledger.apply(&GameCommand::chore_end(1, 40, true)).unwrap();
        assert_eq!(ledger.active_chores(), 0);
        assert_eq!(ledger.completed_chores, 1);
    }

    #[test]
    fn test_capture_restore_roundtrip() {
        let mut source = ColonyLedger::new();
        source.advance(250, 100);
        source.apply(&GameCommand::set_door_state(3, DoorState::Locked)).unwrap();
        source.apply(&GameCommand::entity_state(9, 3, vec![1, 2, 3])).unwrap();

        let mut target = ColonyLedger::new();
        target.restore(&source.capture().unwrap()).unwrap();
        assert_eq!(target, source);
        assert_eq!(target.cycle(), 2);
        assert_eq!(target.door_state(3), Some(DoorState::Locked));
    }

    #[test]
    fn test_restore_garbage_fails() {
        let mut ledger = ColonyLedger::new();
        assert!(ledger.restore(&[0xFF; 3]).is_err());
        assert_eq!(ledger, ColonyLedger::new());
    }

    #[test]
    fn test_advance_reports_cycle() {
        let mut ledger = ColonyLedger::new();
        assert_eq!(ledger.advance(0, 600), 0);
        assert_eq!(ledger.advance(599, 600), 0);
        assert_eq!(ledger.advance(600, 600), 1);
        assert!((ledger.time_of_day() - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_hard_sync_commands_are_not_ledger_commands() {
        assert!(!LEDGER_COMMANDS.contains(&CommandType::HardSync));
        assert!(!LEDGER_COMMANDS.contains(&CommandType::SyncRequest));
        assert_eq!(LEDGER_COMMANDS.len() + 2, CommandType::ALL.len());
    }
}
