//! Command registry: discriminant → payload decoder, and command type →
//! execution handler.
//!
//! [`DecoderTable`] is built once and shared across threads; receive paths
//! consult it before a command can be queued. [`HandlerTable`] lives with the
//! [`CommandManager`] on the tick thread and is consulted on dequeue.

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::codec::{DecodeError, Envelope, MessageKind, Timestamped, decode_payload};
use crate::command::{
    BuildCommand, CancelCommand, ChoreEndCommand, ChoreStartCommand, CommandHeader,
    CommandPayload, CommandType, DeconstructCommand, DigCommand, EntityStateCommand, GameCommand,
    MoveToCommand, ResearchSyncCommand, ScheduleSyncCommand, SetDoorStateCommand,
    SetPauseCommand, SetPriorityCommand, SetSpeedCommand, SetStorageFilterCommand,
    SkillSyncCommand, SyncRequestCommand,
};
use crate::dispatcher::MalformedCommand;
use crate::hard_sync::{HardSyncError, HardSyncSnapshot};
use crate::manager::CommandManager;

// ---------------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------------

/// Turns a validated envelope payload into a concrete command.
pub type DecodeFn = fn(&CommandHeader, &[u8]) -> Result<GameCommand, DecodeError>;

fn decode_as<T>(header: &CommandHeader, payload: &[u8]) -> Result<GameCommand, DecodeError>
where
    T: DeserializeOwned + Into<CommandPayload>,
{
    let decoded: Timestamped<T> = decode_payload(payload)?;
    let header = CommandHeader {
        timestamp_ms: decoded.timestamp_ms,
        ..*header
    };
    Ok(GameCommand::from_parts(header, decoded.body.into()))
}

/// Discriminant → payload decoder.
#[derive(Clone)]
pub struct DecoderTable {
    decoders: HashMap<u8, DecodeFn>,
}

impl DecoderTable {
    /// A table with no decoders; every command decodes as unknown.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// A table with every built-in command type registered.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for ty in CommandType::ALL {
            table.register(ty, builtin_decoder(ty));
        }
        table
    }

    /// Install or replace the decoder for one command type.
    pub fn register(&mut self, ty: CommandType, decoder: DecodeFn) {
        self.decoders.insert(ty.discriminant(), decoder);
    }

    /// Whether a decoder exists for the discriminant.
    pub fn contains(&self, discriminant: u8) -> bool {
        self.decoders.contains_key(&discriminant)
    }

    /// Number of registered decoders.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode a command envelope.
    ///
    /// Discriminants without a decoder yield a header-only command. Control
    /// traffic is refused.
    pub fn decode(&self, envelope: &Envelope) -> Result<GameCommand, DecodeError> {
        if envelope.kind() == MessageKind::Control {
            return Err(DecodeError::NotACommand(envelope.discriminant));
        }
        let header = envelope.header();
        match self.decoders.get(&envelope.discriminant) {
            Some(decoder) => decoder(&header, &envelope.payload),
            None => Ok(GameCommand::unknown(header)),
        }
    }
}

impl Default for DecoderTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_decoder(ty: CommandType) -> DecodeFn {
    match ty {
        CommandType::MoveTo => decode_as::<MoveToCommand>,
        CommandType::Dig => decode_as::<DigCommand>,
        CommandType::Build => decode_as::<BuildCommand>,
        CommandType::Deconstruct => decode_as::<DeconstructCommand>,
        CommandType::Cancel => decode_as::<CancelCommand>,
        CommandType::SetPriority => decode_as::<SetPriorityCommand>,
        CommandType::SetDoorState => decode_as::<SetDoorStateCommand>,
        CommandType::SetStorageFilter => decode_as::<SetStorageFilterCommand>,
        CommandType::SetSpeed => decode_as::<SetSpeedCommand>,
        CommandType::SetPause => decode_as::<SetPauseCommand>,
        CommandType::ChoreStart => decode_as::<ChoreStartCommand>,
        CommandType::ChoreEnd => decode_as::<ChoreEndCommand>,
        CommandType::EntityState => decode_as::<EntityStateCommand>,
        CommandType::HardSync => decode_as::<HardSyncSnapshot>,
        CommandType::SyncRequest => decode_as::<SyncRequestCommand>,
        CommandType::ResearchSync => decode_as::<ResearchSyncCommand>,
        CommandType::SkillSync => decode_as::<SkillSyncCommand>,
        CommandType::ScheduleSync => decode_as::<ScheduleSyncCommand>,
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Errors a handler can report while applying a command.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The validation policy refused the command.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The handler was registered for a different payload.
    #[error("handler for {expected:?} received {actual}")]
    UnexpectedPayload {
        /// Type the handler was written for.
        expected: CommandType,
        /// Label of the command it got.
        actual: String,
    },

    /// Applying the command to local state failed.
    #[error("apply failed: {0}")]
    Apply(String),

    /// A snapshot could not be built or applied.
    #[error(transparent)]
    HardSync(#[from] HardSyncError),
}

/// Result type returned by handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Applies one command type to local state.
///
/// Handlers run on the tick thread. They receive the manager so they can
/// consult session state or queue protocol replies with
/// [`CommandManager::send_after_batch`].
pub trait CommandHandler: Send {
    /// Optional policy check run before [`handle`](Self::handle). Accepts
    /// everything by default.
    fn validate(&self, _command: &GameCommand) -> HandlerResult {
        Ok(())
    }

    /// Apply the command.
    fn handle(&self, command: &GameCommand, manager: &CommandManager) -> HandlerResult;

    /// A message of this type arrived but its payload failed to decode.
    /// Ignored by default.
    fn on_malformed(
        &self,
        _malformed: &MalformedCommand,
        _manager: &CommandManager,
    ) -> HandlerResult {
        Ok(())
    }
}

/// Blanket implementation for closures.
impl<F> CommandHandler for F
where
    F: Fn(&GameCommand, &CommandManager) -> HandlerResult + Send,
{
    fn handle(&self, command: &GameCommand, manager: &CommandManager) -> HandlerResult {
        self(command, manager)
    }
}

/// Command type → execution handler.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<CommandType, Box<dyn CommandHandler>>,
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register<H: CommandHandler + 'static>(&mut self, ty: CommandType, handler: H) {
        if self.handlers.insert(ty, Box::new(handler)).is_some() {
            tracing::debug!("Replaced handler for {ty:?}");
        }
    }

    /// The handler for a command type, if any.
    pub fn get(&self, ty: CommandType) -> Option<&dyn CommandHandler> {
        self.handlers.get(&ty).map(|handler| handler.as_ref())
    }

    /// Registered command types, sorted (useful for startup logging).
    pub fn registered_types(&self) -> Vec<CommandType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};
    use stratum_net::PeerId;

    #[test]
    fn test_builtin_covers_every_type() {
        let table = DecoderTable::builtin();
        assert_eq!(table.len(), CommandType::ALL.len());
        for ty in CommandType::ALL {
            assert!(table.contains(ty.discriminant()), "{ty:?} missing");
        }
    }

    #[test]
    fn test_decode_builtin_command() {
        let mut command = GameCommand::chore_start(4, 99, "Dig", Some(12));
        command.stamp(PeerId(2), 50).unwrap();

        let envelope = decode(&encode(&command).unwrap()).unwrap();
        let decoded = DecoderTable::builtin().decode(&envelope).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_unregistered_discriminant_is_header_only() {
        let mut command = GameCommand::set_speed(1);
        command.stamp(PeerId(2), 3).unwrap();
        let envelope = decode(&encode(&command).unwrap()).unwrap();

        let decoded = DecoderTable::empty().decode(&envelope).unwrap();
        assert_eq!(decoded.command_type(), None);
        assert_eq!(decoded.discriminant(), 9);
        assert_eq!(decoded.sender_id(), PeerId(2));
        assert_eq!(decoded.game_tick(), 3);
    }

    #[test]
    fn test_mismatched_payload_fails_closed() {
        // A Dig header over a SetPause payload must not decode as anything.
        let mut pause = GameCommand::set_pause(true);
        pause.stamp(PeerId(1), 1).unwrap();
        let mut bytes = encode(&pause).unwrap();
        bytes[0] = CommandType::Build.discriminant();

        let envelope = decode(&bytes).unwrap();
        assert!(DecoderTable::builtin().decode(&envelope).is_err());
    }

    #[test]
    fn test_control_envelope_refused() {
        let envelope = Envelope {
            discriminant: 0xF0,
            sender_id: PeerId(1),
            game_tick: 0,
            payload: Vec::new(),
        };
        assert!(matches!(
            DecoderTable::builtin().decode(&envelope),
            Err(DecodeError::NotACommand(0xF0))
        ));
    }

    #[test]
    fn test_handler_table_register_and_lookup() {
        let mut table = HandlerTable::new();
        table.register(CommandType::Dig, |_: &GameCommand, _: &CommandManager| -> HandlerResult { Ok(()) });
        table.register(CommandType::Build, |_: &GameCommand, _: &CommandManager| -> HandlerResult { Ok(()) });

        assert!(table.get(CommandType::Dig).is_some());
        assert!(table.get(CommandType::Cancel).is_none());
        assert_eq!(
            table.registered_types(),
            vec![CommandType::Dig, CommandType::Build]
        );
    }

    #[test]
    fn test_default_validate_accepts() {
        let handler = |_: &GameCommand, _: &CommandManager| -> HandlerResult { Ok(()) };
        assert!(handler.validate(&GameCommand::set_pause(true)).is_ok());
    }
}
