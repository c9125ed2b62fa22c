//! Wire protocol: variable-length integer codec and the binary message envelope.
//!
//! Every frame on the wire is a binary envelope:
//!
//! ```text
//! ┌─────────────────┬──────────────────────────────────────────┐
//! │ VarUint msgType │ payload                                  │
//! ├─────────────────┼──────────────────────────────────────────┤
//! │ 0 = Sync        │ VarUint syncType, VarByteArray body      │
//! │ 1 = Awareness   │ VarByteArray encoded awareness update    │
//! └─────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Sync sub-types: `0` carries a state vector (step 1), `1` carries the
//! diff answering it (step 2), `2` carries an incremental update. The
//! awareness payload is itself a counted list:
//!
//! ```text
//! VarUint numClients { VarUint clientId, VarUint clock, VarByteArray state }*
//! ```
//!
//! An empty `state` byte array encodes a null (offline) state. Integers use
//! the little-endian base-128 variable-length encoding: seven data bits per
//! byte, high bit set on every byte except the last. Decoding is strict —
//! truncated input, unknown tags, and trailing bytes are all errors, and the
//! peer that sent them is disconnected.

use std::error::Error;
use std::fmt;

// Top-level envelope tags.
const MSG_SYNC: u64 = 0;
const MSG_AWARENESS: u64 = 1;

// Sync sub-message tags.
const SYNC_STEP1: u64 = 0;
const SYNC_STEP2: u64 = 1;
const SYNC_UPDATE: u64 = 2;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors produced while decoding a frame.
///
/// All of these are fatal for the connection that sent the frame: a peer
/// that violates the framing cannot be trusted to stay in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended in the middle of a varint or a counted byte array.
    UnexpectedEnd,
    /// A varint ran past the 64-bit range.
    VarIntTooLong,
    /// Envelope tag outside the known set.
    UnknownMessageType(u64),
    /// Sync sub-tag outside the known set.
    UnknownSyncType(u64),
    /// Bytes left over after a complete message was decoded.
    TrailingBytes(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd => write!(f, "unexpected end of input"),
            Self::VarIntTooLong => write!(f, "variable-length integer exceeds 64 bits"),
            Self::UnknownMessageType(t) => write!(f, "unknown message type: {t}"),
            Self::UnknownSyncType(t) => write!(f, "unknown sync message type: {t}"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after message"),
        }
    }
}

impl Error for ProtocolError {}

// ─────────────────────────────────────────────────────────────────────────────
// Varint codec
// ─────────────────────────────────────────────────────────────────────────────

/// Appends `value` to `buf` as a base-128 varint (1–10 bytes).
pub fn write_var_uint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            buf.push(byte | 0x80);
        } else {
            buf.push(byte);
            return;
        }
    }
}

/// Reads a base-128 varint from `data` starting at `*offset`, advancing it.
pub fn read_var_uint(data: &[u8], offset: &mut usize) -> Result<u64, ProtocolError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *data.get(*offset).ok_or(ProtocolError::UnexpectedEnd)?;
        *offset += 1;
        // The tenth byte can only carry the top bit of a u64; anything
        // more would be shifted out and decode to the wrong value.
        if shift == 63 && byte & 0x7E != 0 {
            return Err(ProtocolError::VarIntTooLong);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(ProtocolError::VarIntTooLong);
        }
    }
}

/// Appends a length-prefixed byte array to `buf`.
pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_uint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Reads a length-prefixed byte array, advancing `*offset` past it.
pub fn read_var_bytes<'a>(data: &'a [u8], offset: &mut usize) -> Result<&'a [u8], ProtocolError> {
    let len = read_var_uint(data, offset)? as usize;
    let end = offset.checked_add(len).ok_or(ProtocolError::UnexpectedEnd)?;
    if end > data.len() {
        return Err(ProtocolError::UnexpectedEnd);
    }
    let slice = &data[*offset..end];
    *offset = end;
    Ok(slice)
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// Document synchronization messages, the three-step handshake plus the
/// steady-state incremental update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// "Here is what I have" — an encoded state vector.
    Step1(Vec<u8>),
    /// "Here is what you are missing" — the diff answering a step 1.
    Step2(Vec<u8>),
    /// An incremental update to relay.
    Update(Vec<u8>),
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// An encoded awareness update, opaque at the envelope level; see
    /// [`decode_awareness_entries`].
    Awareness(Vec<u8>),
}

impl Message {
    /// Builds a step-1 frame from an encoded state vector.
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::Step1(state_vector))
    }

    /// Builds a step-2 frame from an encoded diff.
    pub fn sync_step2(update: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::Step2(update))
    }

    /// Builds an incremental-update frame.
    pub fn sync_update(update: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::Update(update))
    }

    /// Builds an awareness frame from a list of entries.
    pub fn awareness(entries: &[AwarenessEntry]) -> Self {
        Self::Awareness(encode_awareness_entries(entries))
    }

    /// Encodes this message into a wire frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Sync(sync) => {
                let (tag, body) = match sync {
                    SyncMessage::Step1(b) => (SYNC_STEP1, b),
                    SyncMessage::Step2(b) => (SYNC_STEP2, b),
                    SyncMessage::Update(b) => (SYNC_UPDATE, b),
                };
                let mut buf = Vec::with_capacity(body.len() + 7);
                write_var_uint(&mut buf, MSG_SYNC);
                write_var_uint(&mut buf, tag);
                write_var_bytes(&mut buf, body);
                buf
            }
            Self::Awareness(payload) => {
                let mut buf = Vec::with_capacity(payload.len() + 6);
                write_var_uint(&mut buf, MSG_AWARENESS);
                write_var_bytes(&mut buf, payload);
                buf
            }
        }
    }

    /// Decodes a single wire frame. Rejects trailing bytes; one message per
    /// frame is the contract.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut offset = 0;
        let message = match read_var_uint(data, &mut offset)? {
            MSG_SYNC => match read_var_uint(data, &mut offset)? {
                SYNC_STEP1 => {
                    Self::Sync(SyncMessage::Step1(read_var_bytes(data, &mut offset)?.to_vec()))
                }
                SYNC_STEP2 => {
                    Self::Sync(SyncMessage::Step2(read_var_bytes(data, &mut offset)?.to_vec()))
                }
                SYNC_UPDATE => {
                    Self::Sync(SyncMessage::Update(read_var_bytes(data, &mut offset)?.to_vec()))
                }
                other => return Err(ProtocolError::UnknownSyncType(other)),
            },
            MSG_AWARENESS => Self::Awareness(read_var_bytes(data, &mut offset)?.to_vec()),
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        if offset != data.len() {
            return Err(ProtocolError::TrailingBytes(data.len() - offset));
        }
        Ok(message)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Awareness payload
// ─────────────────────────────────────────────────────────────────────────────

/// One client's presence entry in wire form.
///
/// `state` is an opaque byte payload chosen by the application (typically
/// serialized JSON); `None` announces that the client went offline. The
/// clock orders announcements from the same client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<Vec<u8>>,
}

/// Encodes awareness entries into the counted-list payload carried by an
/// awareness frame.
pub fn encode_awareness_entries(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + entries.len() * 16);
    write_var_uint(&mut buf, entries.len() as u64);
    for entry in entries {
        write_var_uint(&mut buf, entry.client_id);
        write_var_uint(&mut buf, entry.clock);
        match &entry.state {
            Some(state) => write_var_bytes(&mut buf, state),
            None => write_var_uint(&mut buf, 0),
        }
    }
    buf
}

/// Decodes the counted-list payload of an awareness frame. Strict like the
/// envelope: leftover bytes after the announced count are an error.
pub fn decode_awareness_entries(data: &[u8]) -> Result<Vec<AwarenessEntry>, ProtocolError> {
    let mut offset = 0;
    let count = read_var_uint(data, &mut offset)? as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let client_id = read_var_uint(data, &mut offset)?;
        let clock = read_var_uint(data, &mut offset)?;
        let state = read_var_bytes(data, &mut offset)?;
        entries.push(AwarenessEntry {
            client_id,
            clock,
            state: if state.is_empty() { None } else { Some(state.to_vec()) },
        });
    }
    if offset != data.len() {
        return Err(ProtocolError::TrailingBytes(data.len() - offset));
    }
    Ok(entries)
}
