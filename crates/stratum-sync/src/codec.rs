//! Wire codec for command messages.
//!
//! ```text
//! offset 0:  1 byte   message type (discriminant)
//! offset 1:  8 bytes  sender peer id (u64)
//! offset 9:  8 bytes  game tick (i64)
//! offset 17: 4 bytes  payload length (i32, bytes that follow)
//! offset 21: N bytes  payload
//! ```
//!
//! All multi-byte header fields are little-endian. The payload is a postcard
//! encoded [`Timestamped`] wrapper around the variant's payload struct.
//! [`decode`] only validates and splits the envelope; turning the payload into
//! a concrete command is the registry's job, via [`decode_payload`].

use serde::Serialize;
use serde::de::DeserializeOwned;
use stratum_net::PeerId;

use crate::command::{CONTROL_DISCRIMINANT_START, CommandHeader, CommandPayload, GameCommand};

/// Size of the fixed envelope header.
pub const HEADER_LEN: usize = 21;

/// Header bytes preserved by [`splice_payload`] (everything before the length).
pub const SPLICE_PREFIX_LEN: usize = 17;

/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Postcard payload of every command: creation time plus the variant fields.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct Timestamped<T> {
    /// Wall-clock creation time in Unix milliseconds.
    pub timestamp_ms: u64,
    /// Variant-specific fields.
    pub body: T,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while decoding an envelope or payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes than the fixed header.
    #[error("truncated header: {len} bytes, need {HEADER_LEN}")]
    TruncatedHeader {
        /// Bytes available.
        len: usize,
    },

    /// The signed length field is negative.
    #[error("negative payload length {0}")]
    NegativePayloadLength(i32),

    /// The length field exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload length {declared} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Length claimed by the header.
        declared: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The length field disagrees with the bytes that follow the header.
    #[error("payload length mismatch: header says {declared}, buffer has {actual}")]
    PayloadLengthMismatch {
        /// Length claimed by the header.
        declared: usize,
        /// Bytes actually present after the header.
        actual: usize,
    },

    /// Postcard rejected the payload structure.
    #[error("malformed payload: {0}")]
    Payload(#[from] postcard::Error),

    /// The payload decoded but left unread bytes behind.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// Non-command traffic handed to the command decoder.
    #[error("discriminant 0x{0:02X} is not a command")]
    NotACommand(u8),
}

/// Errors that can occur while encoding a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Postcard could not serialize the payload.
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] postcard::Error),

    /// The payload does not fit the envelope.
    #[error("payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Payload size.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The message being rewritten is not a valid envelope.
    #[error("invalid envelope: {0}")]
    Decode(#[from] DecodeError),
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Broad class of a message, derived from its discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Any discriminant below the control range, known or not.
    Command,
    /// Transport or session traffic the command core ignores.
    Control,
}

/// A validated message with its header split out and payload still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message type.
    pub discriminant: u8,
    /// Originating peer.
    pub sender_id: PeerId,
    /// Logical tick the message was stamped with.
    pub game_tick: i64,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Whether this is command traffic.
    pub fn kind(&self) -> MessageKind {
        if self.discriminant >= CONTROL_DISCRIMINANT_START {
            MessageKind::Control
        } else {
            MessageKind::Command
        }
    }

    /// Length of the encoded payload.
    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }

    /// Header fields as seen on the wire. The timestamp lives in the payload
    /// and is left at zero.
    pub fn header(&self) -> CommandHeader {
        CommandHeader {
            discriminant: self.discriminant,
            sender_id: self.sender_id,
            game_tick: self.game_tick,
            timestamp_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn payload_len_field(len: usize) -> Result<i32, CodecError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    i32::try_from(len).map_err(|_| CodecError::PayloadTooLarge {
        len,
        max: MAX_PAYLOAD_LEN,
    })
}

fn write_envelope(
    discriminant: u8,
    sender_id: PeerId,
    game_tick: i64,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let len = payload_len_field(payload.len())?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(discriminant);
    out.extend_from_slice(&sender_id.0.to_le_bytes());
    out.extend_from_slice(&game_tick.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

fn timestamped<T: Serialize>(timestamp_ms: u64, body: &T) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_allocvec(&Timestamped { timestamp_ms, body })?)
}

/// Serialize a command's payload (without the envelope header).
pub fn encode_payload(command: &GameCommand) -> Result<Vec<u8>, CodecError> {
    let ts = command.timestamp_ms();
    match command.payload() {
        CommandPayload::MoveTo(body) => timestamped(ts, body),
        CommandPayload::Dig(body) => timestamped(ts, body),
        CommandPayload::Build(body) => timestamped(ts, body),
        CommandPayload::Deconstruct(body) => timestamped(ts, body),
        CommandPayload::Cancel(body) => timestamped(ts, body),
        CommandPayload::SetPriority(body) => timestamped(ts, body),
        CommandPayload::SetDoorState(body) => timestamped(ts, body),
        CommandPayload::SetStorageFilter(body) => timestamped(ts, body),
        CommandPayload::SetSpeed(body) => timestamped(ts, body),
        CommandPayload::SetPause(body) => timestamped(ts, body),
        CommandPayload::ChoreStart(body) => timestamped(ts, body),
        CommandPayload::ChoreEnd(body) => timestamped(ts, body),
        CommandPayload::EntityState(body) => timestamped(ts, body),
        CommandPayload::HardSync(body) => timestamped(ts, body),
        CommandPayload::SyncRequest(body) => timestamped(ts, body),
        CommandPayload::ResearchSync(body) => timestamped(ts, body),
        CommandPayload::SkillSync(body) => timestamped(ts, body),
        CommandPayload::ScheduleSync(body) => timestamped(ts, body),
        CommandPayload::Unknown => Ok(Vec::new()),
    }
}

/// Encode a command into a complete wire message.
pub fn encode(command: &GameCommand) -> Result<Vec<u8>, CodecError> {
    let payload = encode_payload(command)?;
    write_envelope(
        command.discriminant(),
        command.sender_id(),
        command.game_tick(),
        &payload,
    )
}

/// Re-encode an envelope, preserving its payload bytes as-is.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    write_envelope(
        envelope.discriminant,
        envelope.sender_id,
        envelope.game_tick,
        &envelope.payload,
    )
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Validate the header of a wire message and split off its payload.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let truncated = || DecodeError::TruncatedHeader { len: bytes.len() };
    let mut payload = bytes;
    let [discriminant] = take_field::<1>(&mut payload).ok_or_else(truncated)?;
    let sender_id = u64::from_le_bytes(take_field(&mut payload).ok_or_else(truncated)?);
    let game_tick = i64::from_le_bytes(take_field(&mut payload).ok_or_else(truncated)?);
    let raw_len = i32::from_le_bytes(take_field(&mut payload).ok_or_else(truncated)?);

    let declared = usize::try_from(raw_len).map_err(|_| DecodeError::NegativePayloadLength(raw_len))?;
    if declared > MAX_PAYLOAD_LEN {
        return Err(DecodeError::PayloadTooLarge {
            declared,
            max: MAX_PAYLOAD_LEN,
        });
    }
    if declared != payload.len() {
        return Err(DecodeError::PayloadLengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    Ok(Envelope {
        discriminant,
        sender_id: PeerId(sender_id),
        game_tick,
        payload: payload.to_vec(),
    })
}

/// Split the next `N` bytes off `input`.
fn take_field<const N: usize>(input: &mut &[u8]) -> Option<[u8; N]> {
    let (field, rest) = input.split_first_chunk::<N>()?;
    *input = rest;
    Some(*field)
}

/// Decode a payload into a concrete type. Trailing bytes are rejected.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, DecodeError> {
    let (value, rest) = postcard::take_from_bytes::<T>(payload)?;
    if !rest.is_empty() {
        return Err(DecodeError::TrailingBytes(rest.len()));
    }
    Ok(value)
}

/// Replace the payload of an encoded message in place.
///
/// The first [`SPLICE_PREFIX_LEN`] header bytes are kept verbatim and the
/// length field is recomputed. The input must be a valid envelope.
pub fn splice_payload(message: &[u8], new_payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    decode(message)?;
    let len = payload_len_field(new_payload.len())?;

    let mut out = Vec::with_capacity(HEADER_LEN + new_payload.len());
    out.extend_from_slice(&message[..SPLICE_PREFIX_LEN]);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(new_payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{DigCommand, PriorityClass, PriorityValue};

    fn stamped(mut command: GameCommand, sender: u64, tick: i64) -> GameCommand {
        command.stamp(PeerId(sender), tick).unwrap();
        command
    }

    #[test]
    fn test_header_layout() {
        let command = stamped(GameCommand::dig(vec![42, 43], None), 0x0102, 100);
        let bytes = encode(&command).unwrap();

        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..9], &0x0102u64.to_le_bytes());
        assert_eq!(&bytes[9..17], &100i64.to_le_bytes());
        let len = i32::from_le_bytes(bytes[17..21].try_into().unwrap());
        assert_eq!(len as usize, bytes.len() - HEADER_LEN);
    }

    #[test]
    fn test_decode_splits_header() {
        let command = stamped(GameCommand::set_speed(3), 5, 9);
        let envelope = decode(&encode(&command).unwrap()).unwrap();

        assert_eq!(envelope.discriminant, 9);
        assert_eq!(envelope.sender_id, PeerId(5));
        assert_eq!(envelope.game_tick, 9);
        assert_eq!(envelope.kind(), MessageKind::Command);
    }

    #[test]
    fn test_payload_roundtrip_keeps_timestamp() {
        let mut command = GameCommand::dig(
            vec![1, 2, 3],
            Some(PriorityValue {
                class: PriorityClass::High,
                value: 7,
            }),
        );
        command.stamp(PeerId(1), 0).unwrap();

        let envelope = decode(&encode(&command).unwrap()).unwrap();
        let decoded: Timestamped<DigCommand> = decode_payload(&envelope.payload).unwrap();
        assert_eq!(decoded.timestamp_ms, command.timestamp_ms());
        assert_eq!(decoded.body.cells, vec![1, 2, 3]);
        assert_eq!(decoded.body.priority.unwrap().value, 7);
    }

    #[test]
    fn test_truncated_header() {
        for len in [0, 1, 20] {
            let result = decode(&vec![0u8; len]);
            assert!(matches!(result, Err(DecodeError::TruncatedHeader { len: l }) if l == len));
        }
    }

    #[test]
    fn test_header_only_message_with_zero_length() {
        let mut bytes = vec![0x30];
        bytes.extend_from_slice(&7u64.to_le_bytes());
        bytes.extend_from_slice(&1i64.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());

        let envelope = decode(&bytes).unwrap();
        assert_eq!(envelope.payload_length(), 0);
    }

    #[test]
    fn test_header_fields_use_every_byte() {
        let mut bytes = vec![0x11];
        bytes.extend_from_slice(&0x8877_6655_4433_2211u64.to_le_bytes());
        bytes.extend_from_slice(&(-2i64).to_le_bytes());
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.extend_from_slice(&[0xAA, 0xBB]);

        let envelope = decode(&bytes).unwrap();
        assert_eq!(envelope.discriminant, 0x11);
        assert_eq!(envelope.sender_id, PeerId(0x8877_6655_4433_2211));
        assert_eq!(envelope.game_tick, -2);
        assert_eq!(envelope.payload, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut bytes = encode(&stamped(GameCommand::set_pause(true), 1, 1)).unwrap();
        bytes[17..21].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::NegativePayloadLength(-1))
        ));
    }

    #[test]
    fn test_length_beyond_buffer_rejected() {
        let mut bytes = encode(&stamped(GameCommand::set_pause(true), 1, 1)).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::PayloadLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut bytes = encode(&stamped(GameCommand::set_pause(true), 1, 1)).unwrap();
        bytes.push(0xAA);
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::PayloadLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_absurd_length_rejected_before_allocation() {
        let mut bytes = vec![2u8; HEADER_LEN];
        bytes[17..21].copy_from_slice(&i32::MAX.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_payload_rejects_trailing_bytes() {
        let mut payload = postcard::to_allocvec(&Timestamped {
            timestamp_ms: 1,
            body: 5u8,
        })
        .unwrap();
        payload.push(0);
        assert!(matches!(
            decode_payload::<Timestamped<u8>>(&payload),
            Err(DecodeError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_decode_payload_rejects_wrong_shape() {
        // An empty payload cannot hold a timestamp.
        assert!(matches!(
            decode_payload::<Timestamped<DigCommand>>(&[]),
            Err(DecodeError::Payload(_))
        ));
    }

    #[test]
    fn test_control_kind() {
        let envelope = Envelope {
            discriminant: 0xE0,
            sender_id: PeerId(1),
            game_tick: 0,
            payload: Vec::new(),
        };
        assert_eq!(envelope.kind(), MessageKind::Control);
        let bytes = encode_envelope(&envelope).unwrap();
        assert_eq!(decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_splice_preserves_prefix() {
        let original = encode(&stamped(GameCommand::deconstruct(vec![9]), 3, 77)).unwrap();
        let new_payload = vec![0xAB; 300];

        let spliced = splice_payload(&original, &new_payload).unwrap();
        assert_eq!(&spliced[..SPLICE_PREFIX_LEN], &original[..SPLICE_PREFIX_LEN]);

        let envelope = decode(&spliced).unwrap();
        assert_eq!(envelope.payload, new_payload);
        assert_eq!(envelope.game_tick, 77);
    }

    #[test]
    fn test_splice_rejects_invalid_message() {
        assert!(matches!(
            splice_payload(&[1, 2, 3], &[]),
            Err(CodecError::Decode(DecodeError::TruncatedHeader { len: 3 }))
        ));
    }
}
