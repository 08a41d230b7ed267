//! Command synchronization for lockstep colony sessions.
//!
//! Player actions become [`GameCommand`]s, travel as 21-byte-header
//! envelopes over a [`stratum_net::Transport`], are relayed by the host, and
//! execute in arrival order on every peer. Full-state recovery goes through
//! the [`hard_sync`] module.

pub mod codec;
pub mod command;
pub mod dispatcher;
pub mod hard_sync;
pub mod manager;
pub mod registry;


pub use codec::{
    CodecError, DecodeError, Envelope, HEADER_LEN, MAX_PAYLOAD_LEN, MessageKind, Timestamped,
    decode, decode_payload, encode, encode_envelope, encode_payload, splice_payload,
};
pub use command::{
    CONTROL_DISCRIMINANT_START, CommandHeader, CommandPayload, CommandType, GameCommand,
    StampError, UNSTAMPED_TICK,
};
pub use dispatcher::{
    CommandDispatcher, DEFAULT_HISTORY_CAPACITY, ExecutedCommand, MalformedCommand, Origin,
    QueuedCommand,
};
pub use hard_sync::{
    HardSyncError, HardSyncScheduler, HardSyncService, HardSyncSnapshot, SyncReason, WorldState,
    WorldStateError,
};
pub use manager::{
    BatchSummary, CommandEvent, CommandManager, CommandSummary, InboundHandle, ReceiveOutcome,
    SendOutcome,
};
pub use registry::{
    CommandHandler, DecodeFn, DecoderTable, HandlerError, HandlerResult, HandlerTable,
};
