//! Command model: the closed set of synchronizable player actions.
//!
//! Every command is a [`GameCommand`]: a shared [`CommandHeader`] plus one
//! [`CommandPayload`] variant. The payload variant determines the wire
//! discriminant, so a command can never carry a type byte that disagrees with
//! its fields. Header and payload are private; the only mutation allowed after
//! construction is the one-time [`GameCommand::stamp`] at dispatch.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use stratum_net::PeerId;

use crate::hard_sync::{HardSyncSnapshot, SyncReason};

/// `game_tick` value of a command that has not been dispatched yet.
pub const UNSTAMPED_TICK: i64 = -1;

/// First discriminant reserved for non-command traffic (control, chat, pings).
pub const CONTROL_DISCRIMINANT_START: u8 = 0xE0;

// ---------------------------------------------------------------------------
// CommandType
// ---------------------------------------------------------------------------

/// Stable wire discriminant of every built-in command. Never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CommandType {
    MoveTo = 1,
    Dig = 2,
    Build = 3,
    Deconstruct = 4,
    Cancel = 5,
    SetPriority = 6,
    SetDoorState = 7,
    SetStorageFilter = 8,
    SetSpeed = 9,
    SetPause = 10,
    ChoreStart = 11,
    ChoreEnd = 12,
    EntityState = 13,
    HardSync = 14,
    SyncRequest = 15,
    ResearchSync = 16,
    SkillSync = 17,
    ScheduleSync = 18,
}

impl CommandType {
    /// Every built-in command type, in discriminant order.
    pub const ALL: [CommandType; 18] = [
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
        CommandType::HardSync,
        CommandType::SyncRequest,
        CommandType::ResearchSync,
        CommandType::SkillSync,
        CommandType::ScheduleSync,
    ];

    /// The wire discriminant.
    pub fn discriminant(self) -> u8 {
        self as u8
    }

    /// Look up a built-in type. `None` for unassigned or control discriminants.
    pub fn from_discriminant(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|ty| ty.discriminant() == value)
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Fields shared by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Wire discriminant.
    pub discriminant: u8,
    /// Originating peer.
    pub sender_id: PeerId,
    /// Logical time of dispatch, [`UNSTAMPED_TICK`] until stamped.
    pub game_tick: i64,
    /// Wall-clock creation time in Unix milliseconds. Informational only.
    pub timestamp_ms: u64,
}

/// Error returned by [`GameCommand::stamp`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StampError {
    /// The command was already stamped at dispatch.
    #[error("command already stamped at tick {0}")]
    AlreadyStamped(i64),
    /// Game ticks are never negative once assigned.
    #[error("cannot stamp negative game tick {0}")]
    NegativeTick(i64),
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Priority class of an errand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityClass {
    Basic,
    High,
    Emergency,
}

/// Priority class plus level (1..=9 in game).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityValue {
    pub class: PriorityClass,
    pub value: u8,
}

/// Door control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoorState {
    Auto,
    Open,
    Locked,
}

/// Order a minion to walk to a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveToCommand {
    pub minion_id: u64,
    pub target_cell: i32,
    pub x: f32,
    pub y: f32,
}

/// Mark cells for digging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigCommand {
    pub cells: Vec<i32>,
    pub priority: Option<PriorityValue>,
}

/// Place a building blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildCommand {
    pub cell: i32,
    pub building_id: String,
    pub orientation: u8,
    pub materials: Vec<String>,
    pub facade_id: Option<String>,
}

/// Mark buildings in cells for deconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeconstructCommand {
    pub cells: Vec<i32>,
}

/// Cancel pending errands on one object layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelCommand {
    pub cells: Vec<i32>,
    pub layer: u8,
}

/// Change the errand priority of whatever sits in a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPriorityCommand {
    pub cell: i32,
    pub priority: PriorityValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetDoorStateCommand {
    pub cell: i32,
    pub state: DoorState,
}

/// Replace the accepted tags of a storage building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetStorageFilterCommand {
    pub cell: i32,
    pub tags: Vec<String>,
    pub capacity_kg: Option<f32>,
}

/// Simulation speed, 1..=3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSpeedCommand {
    pub speed: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPauseCommand {
    pub paused: bool,
}

/// A minion picked up a chore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoreStartCommand {
    pub minion_id: u64,
    pub chore_id: u64,
    pub chore_type: String,
    pub target_cell: Option<i32>,
}

/// A minion finished or abandoned a chore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoreEndCommand {
    pub minion_id: u64,
    pub chore_id: u64,
    pub completed: bool,
}

/// Full serialized state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStateCommand {
    pub entity_id: u64,
    pub cell: i32,
    pub state: Vec<u8>,
}

/// Ask the host for a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequestCommand {
    pub reason: SyncReason,
    pub last_applied_cycle: Option<i32>,
}

/// Points accumulated towards one technology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchProgress {
    pub tech_id: String,
    pub points: f32,
}

/// Research queue and progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSyncCommand {
    pub active_tech: Option<String>,
    pub queue: Vec<String>,
    pub progress: Vec<ResearchProgress>,
}

/// Skills mastered by one minion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillSyncCommand {
    pub minion_id: u64,
    pub mastered: Vec<String>,
    pub points_available: i32,
}

/// Activity assigned to one hour of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleBlock {
    Work,
    Sleep,
    Recreation,
    Hygiene,
}

/// A schedule and the minions assigned to it. Blocks normally hold 24 entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSyncCommand {
    pub schedule_id: u32,
    pub name: String,
    pub blocks: Vec<ScheduleBlock>,
    pub assigned: Vec<u64>,
}

// ---------------------------------------------------------------------------
// CommandPayload
// ---------------------------------------------------------------------------

/// Variant-specific fields of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    MoveTo(MoveToCommand),
    Dig(DigCommand),
    Build(BuildCommand),
    Deconstruct(DeconstructCommand),
    Cancel(CancelCommand),
    SetPriority(SetPriorityCommand),
    SetDoorState(SetDoorStateCommand),
    SetStorageFilter(SetStorageFilterCommand),
    SetSpeed(SetSpeedCommand),
    SetPause(SetPauseCommand),
    ChoreStart(ChoreStartCommand),
    ChoreEnd(ChoreEndCommand),
    EntityState(EntityStateCommand),
    HardSync(HardSyncSnapshot),
    SyncRequest(SyncRequestCommand),
    ResearchSync(ResearchSyncCommand),
    SkillSync(SkillSyncCommand),
    ScheduleSync(ScheduleSyncCommand),
    /// A discriminant this build does not know. Header only.
    Unknown,
}

impl CommandPayload {
    /// Built-in type of this payload; `None` for [`CommandPayload::Unknown`].
    pub fn command_type(&self) -> Option<CommandType> {
        let ty = match self {
            CommandPayload::MoveTo(_) => CommandType::MoveTo,
            CommandPayload::Dig(_) => CommandType::Dig,
            CommandPayload::Build(_) => CommandType::Build,
            CommandPayload::Deconstruct(_) => CommandType::Deconstruct,
            CommandPayload::Cancel(_) => CommandType::Cancel,
            CommandPayload::SetPriority(_) => CommandType::SetPriority,
            CommandPayload::SetDoorState(_) => CommandType::SetDoorState,
            CommandPayload::SetStorageFilter(_) => CommandType::SetStorageFilter,
            CommandPayload::SetSpeed(_) => CommandType::SetSpeed,
            CommandPayload::SetPause(_) => CommandType::SetPause,
            CommandPayload::ChoreStart(_) => CommandType::ChoreStart,
            CommandPayload::ChoreEnd(_) => CommandType::ChoreEnd,
            CommandPayload::EntityState(_) => CommandType::EntityState,
            CommandPayload::HardSync(_) => CommandType::HardSync,
            CommandPayload::SyncRequest(_) => CommandType::SyncRequest,
            CommandPayload::ResearchSync(_) => CommandType::ResearchSync,
            CommandPayload::SkillSync(_) => CommandType::SkillSync,
            CommandPayload::ScheduleSync(_) => CommandType::ScheduleSync,
            CommandPayload::Unknown => return None,
        };
        Some(ty)
    }
}

macro_rules! payload_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for CommandPayload {
                fn from(value: $ty) -> Self {
                    CommandPayload::$variant(value)
                }
            }

            impl From<$ty> for GameCommand {
                fn from(value: $ty) -> Self {
                    GameCommand::new(CommandPayload::$variant(value))
                }
            }
        )*
    };
}

payload_from!(
    MoveTo(MoveToCommand),
    Dig(DigCommand),
    Build(BuildCommand),
    Deconstruct(DeconstructCommand),
    Cancel(CancelCommand),
    SetPriority(SetPriorityCommand),
    SetDoorState(SetDoorStateCommand),
    SetStorageFilter(SetStorageFilterCommand),
    SetSpeed(SetSpeedCommand),
    SetPause(SetPauseCommand),
    ChoreStart(ChoreStartCommand),
    ChoreEnd(ChoreEndCommand),
    EntityState(EntityStateCommand),
    HardSync(HardSyncSnapshot),
    SyncRequest(SyncRequestCommand),
    ResearchSync(ResearchSyncCommand),
    SkillSync(SkillSyncCommand),
    ScheduleSync(ScheduleSyncCommand),
);

// ---------------------------------------------------------------------------
// GameCommand
// ---------------------------------------------------------------------------

/// A synchronizable player action.
#[derive(Debug, Clone, PartialEq)]
pub struct GameCommand {
    header: CommandHeader,
    payload: CommandPayload,
}

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl GameCommand {
    /// Create an unstamped command from a known payload.
    ///
    /// Passing [`CommandPayload::Unknown`] yields a command with
    /// discriminant 0.
    pub fn new(payload: CommandPayload) -> Self {
        let discriminant = payload.command_type().map_or(0, CommandType::discriminant);
        Self {
            header: CommandHeader {
                discriminant,
                sender_id: PeerId(0),
                game_tick: UNSTAMPED_TICK,
                timestamp_ms: unix_millis(),
            },
            payload,
        }
    }

    /// Reassemble a decoded command. The caller guarantees that `payload`
    /// matches `header.discriminant`.
    pub(crate) fn from_parts(header: CommandHeader, payload: CommandPayload) -> Self {
        Self { header, payload }
    }

    /// Header-only command for a discriminant this build cannot decode.
    pub(crate) fn unknown(header: CommandHeader) -> Self {
        Self {
            header,
            payload: CommandPayload::Unknown,
        }
    }

    // --- Builders ---

    pub fn move_to(minion_id: u64, target_cell: i32, x: f32, y: f32) -> Self {
        MoveToCommand {
            minion_id,
            target_cell,
            x,
            y,
        }
        .into()
    }

    pub fn dig(cells: Vec<i32>, priority: Option<PriorityValue>) -> Self {
        DigCommand { cells, priority }.into()
    }

    /// Place a blueprint with no facade.
    pub fn build(cell: i32, building_id: impl Into<String>, orientation: u8, materials: Vec<String>) -> Self {
        BuildCommand {
            cell,
            building_id: building_id.into(),
            orientation,
            materials,
            facade_id: None,
        }
        .into()
    }

    pub fn deconstruct(cells: Vec<i32>) -> Self {
        DeconstructCommand { cells }.into()
    }

    pub fn cancel(cells: Vec<i32>, layer: u8) -> Self {
        CancelCommand { cells, layer }.into()
    }

    pub fn set_priority(cell: i32, priority: PriorityValue) -> Self {
        SetPriorityCommand { cell, priority }.into()
    }

    pub fn set_door_state(cell: i32, state: DoorState) -> Self {
        SetDoorStateCommand { cell, state }.into()
    }

    pub fn set_storage_filter(cell: i32, tags: Vec<String>, capacity_kg: Option<f32>) -> Self {
        SetStorageFilterCommand {
            cell,
            tags,
            capacity_kg,
        }
        .into()
    }

    pub fn set_speed(speed: u8) -> Self {
        SetSpeedCommand { speed }.into()
    }

    pub fn set_pause(paused: bool) -> Self {
        SetPauseCommand { paused }.into()
    }

    pub fn chore_start(
        minion_id: u64,
        chore_id: u64,
        chore_type: impl Into<String>,
        target_cell: Option<i32>,
    ) -> Self {
        ChoreStartCommand {
            minion_id,
            chore_id,
            chore_type: chore_type.into(),
            target_cell,
        }
        .into()
    }

    pub fn chore_end(minion_id: u64, chore_id: u64, completed: bool) -> Self {
        ChoreEndCommand {
            minion_id,
            chore_id,
            completed,
        }
        .into()
    }

    pub fn entity_state(entity_id: u64, cell: i32, state: Vec<u8>) -> Self {
        EntityStateCommand {
            entity_id,
            cell,
            state,
        }
        .into()
    }

    pub fn hard_sync(snapshot: HardSyncSnapshot) -> Self {
        snapshot.into()
    }

    pub fn sync_request(reason: SyncReason, last_applied_cycle: Option<i32>) -> Self {
        SyncRequestCommand {
            reason,
            last_applied_cycle,
        }
        .into()
    }

    // --- Accessors ---

    /// Shared header fields.
    pub fn header(&self) -> &CommandHeader {
        &self.header
    }

    /// Variant-specific fields.
    pub fn payload(&self) -> &CommandPayload {
        &self.payload
    }

    /// Built-in type, or `None` if the discriminant is unknown to this build.
    pub fn command_type(&self) -> Option<CommandType> {
        self.payload.command_type()
    }

    pub fn discriminant(&self) -> u8 {
        self.header.discriminant
    }

    pub fn sender_id(&self) -> PeerId {
        self.header.sender_id
    }

    pub fn game_tick(&self) -> i64 {
        self.header.game_tick
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.header.timestamp_ms
    }

    /// Whether dispatch has assigned a sender and tick.
    pub fn is_stamped(&self) -> bool {
        self.header.game_tick >= 0
    }

    /// Assign sender and logical tick. Allowed exactly once.
    pub fn stamp(&mut self, sender_id: PeerId, game_tick: i64) -> Result<(), StampError> {
        if self.is_stamped() {
            return Err(StampError::AlreadyStamped(self.header.game_tick));
        }
        if game_tick < 0 {
            return Err(StampError::NegativeTick(game_tick));
        }
        self.header.sender_id = sender_id;
        self.header.game_tick = game_tick;
        Ok(())
    }

    /// Short human-readable label for logs.
    pub fn label(&self) -> String {
        match self.command_type() {
            Some(ty) => format!("{ty:?}"),
            None => format!("Unknown(0x{:02X})", self.header.discriminant),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminants_are_stable() {
        assert_eq!(CommandType::MoveTo.discriminant(), 1);
        assert_eq!(CommandType::Dig.discriminant(), 2);
        assert_eq!(CommandType::HardSync.discriminant(), 14);
        assert_eq!(CommandType::ScheduleSync.discriminant(), 18);
        for (index, ty) in CommandType::ALL.iter().enumerate() {
            assert_eq!(ty.discriminant() as usize, index + 1);
        }
    }

    #[test]
    fn test_from_discriminant() {
        assert_eq!(CommandType::from_discriminant(2), Some(CommandType::Dig));
        assert_eq!(CommandType::from_discriminant(0), None);
        assert_eq!(CommandType::from_discriminant(0x13), None);
        assert_eq!(CommandType::from_discriminant(CONTROL_DISCRIMINANT_START), None);
    }

    #[test]
    fn test_builder_sets_matching_discriminant() {
        let dig = GameCommand::dig(vec![42, 43], None);
        assert_eq!(dig.command_type(), Some(CommandType::Dig));
        assert_eq!(dig.discriminant(), 2);
        assert!(!dig.is_stamped());
        assert_eq!(dig.game_tick(), UNSTAMPED_TICK);
    }

    #[test]
    fn test_stamp_once() {
        let mut command = GameCommand::set_speed(2);
        command.stamp(PeerId(1), 100).unwrap();
        assert_eq!(command.sender_id(), PeerId(1));
        assert_eq!(command.game_tick(), 100);

        assert_eq!(
            command.stamp(PeerId(2), 200),
            Err(StampError::AlreadyStamped(100))
        );
        assert_eq!(command.sender_id(), PeerId(1));
    }

    #[test]
    fn test_stamp_rejects_negative_tick() {
        let mut command = GameCommand::set_pause(true);
        assert_eq!(command.stamp(PeerId(1), -5), Err(StampError::NegativeTick(-5)));
        assert!(!command.is_stamped());
    }

    #[test]
    fn test_tick_zero_counts_as_stamped() {
        let mut command = GameCommand::set_pause(false);
        command.stamp(PeerId(3), 0).unwrap();
        assert!(command.is_stamped());
    }

    #[test]
    fn test_from_payload_struct() {
        let command = GameCommand::from(ScheduleSyncCommand {
            schedule_id: 1,
            name: "Default".into(),
            blocks: vec![ScheduleBlock::Work; 24],
            assigned: vec![10, 11],
        });
        assert_eq!(command.command_type(), Some(CommandType::ScheduleSync));
    }

    #[test]
    fn test_unknown_label() {
        let command = GameCommand::unknown(CommandHeader {
            discriminant: 0x42,
            sender_id: PeerId(2),
            game_tick: 7,
            timestamp_ms: 0,
        });
        assert_eq!(command.command_type(), None);
        assert_eq!(command.label(), "Unknown(0x42)");
    }
}
