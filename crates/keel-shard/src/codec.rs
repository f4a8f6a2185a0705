//! Wire codec for replicated shard operations.
//!
//! A shard operation travels through the PG log as `(header, payload)`. The
//! header is a fixed little-endian frame with a typed opcode and two CRCs;
//! the payload is a self-describing JSON encoding of [`ShardInfo`], padded
//! with zeros to a whole number of device blocks. `payload_size` and
//! `payload_crc` always cover the *padded* bytes, so a replica can verify an
//! entry without knowing the unpadded length.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::Bytes;
use keel_types::{PgId, ShardId, ShardInfo};

/// Encoded size of a [`MessageHeader`].
pub const HEADER_SIZE: usize = 24;

/// Offset of the `header_crc` field; `seal()` CRCs everything before it.
const HEADER_CRC_OFFSET: usize = 20;

/// Errors produced while decoding a header or payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The header blob is shorter than [`HEADER_SIZE`].
    #[error("header too short: {0} bytes")]
    ShortHeader(usize),

    /// The opcode does not name a known operation.
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    /// A header field could not be read.
    #[error("failed to decode header field {0}: {1}")]
    Decode(&'static str, std::io::Error),

    /// The payload is not a valid shard-info document.
    #[error("payload is not valid shard info: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Typed opcode of a replicated shard operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Create a new shard bound to the chunk the entry's blocks live in.
    CreateShard = 1,
    /// Seal an existing shard.
    SealShard = 2,
}

impl MessageType {
    fn from_u16(raw: u16) -> Result<Self, CodecError> {
        match raw {
            1 => Ok(MessageType::CreateShard),
            2 => Ok(MessageType::SealShard),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

/// Fixed header framing a shard operation, persisted out-of-band alongside
/// the payload by the replication device.
///
/// Layout (little-endian): `msg_type:u16, pg_id:u16, shard_id:u64,
/// payload_size:u32, payload_crc:u32, header_crc:u32`. Every wire byte maps
/// to a field, so decode-then-encode reproduces the input exactly and
/// [`corrupted`](Self::corrupted) catches any post-seal tampering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Operation opcode.
    pub msg_type: MessageType,
    /// Target placement group.
    pub pg_id: PgId,
    /// Target shard.
    pub shard_id: ShardId,
    /// Padded payload length in bytes.
    pub payload_size: u32,
    /// CRC32-IEEE over the padded payload.
    pub payload_crc: u32,
    /// CRC32-IEEE over the preceding header bytes, set by [`seal`](Self::seal).
    pub header_crc: u32,
}

impl MessageHeader {
    /// Build an unsealed header over an already padded payload.
    pub fn new(msg_type: MessageType, pg_id: PgId, shard_id: ShardId, payload: &[u8]) -> Self {
        Self {
            msg_type,
            pg_id,
            shard_id,
            payload_size: payload.len() as u32,
            payload_crc: crc32(payload),
            header_crc: 0,
        }
    }

    /// Finalise the header by CRCing all preceding header bytes.
    pub fn seal(mut self) -> Self {
        self.header_crc = crc32(&self.encode()[..HEADER_CRC_OFFSET]);
        self
    }

    /// Whether the stored `header_crc` disagrees with the header contents.
    pub fn corrupted(&self) -> bool {
        crc32(&self.encode()[..HEADER_CRC_OFFSET]) != self.header_crc
    }

    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&(self.msg_type as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&self.pg_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.shard_id.as_u64().to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_crc.to_le_bytes());
        buf[20..24].copy_from_slice(&self.header_crc.to_le_bytes());
        buf
    }

    /// Decode from wire bytes. Extra trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::ShortHeader(bytes.len()));
        }

        let mut cursor = Cursor::new(bytes);
        let msg_type = MessageType::from_u16(
            cursor
                .read_u16::<LittleEndian>()
                .map_err(|e| CodecError::Decode("msg_type", e))?,
        )?;
        let pg_id = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| CodecError::Decode("pg_id", e))?;
        let shard_id = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| CodecError::Decode("shard_id", e))?
            .into();
        let payload_size = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| CodecError::Decode("payload_size", e))?;
        let payload_crc = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| CodecError::Decode("payload_crc", e))?;
        let header_crc = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| CodecError::Decode("header_crc", e))?;

        Ok(Self {
            msg_type,
            pg_id,
            shard_id,
            payload_size,
            payload_crc,
            header_crc,
        })
    }
}

/// CRC32-IEEE (polynomial 0xEDB88320) over a byte slice.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Encode a [`ShardInfo`] as its self-describing JSON payload.
pub fn encode_shard_info(info: &ShardInfo) -> Vec<u8> {
    serde_json::to_vec(info).expect("serialization should not fail")
}

/// Decode a shard-info payload, tolerating the trailing zero padding
/// introduced by block-size round-up.
pub fn decode_shard_info(payload: &[u8]) -> Result<ShardInfo, CodecError> {
    let end = payload
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    Ok(serde_json::from_slice(&payload[..end])?)
}

/// Zero-pad an encoded payload up to a whole number of device blocks.
pub fn pad_to_blocks(encoded: Vec<u8>, block_size: u64) -> Bytes {
    let padded_len = round_up(encoded.len() as u64, block_size) as usize;
    let mut buf = encoded;
    buf.resize(padded_len, 0);
    Bytes::from(buf)
}

/// Round `n` up to the next multiple of `align`.
pub fn round_up(n: u64, align: u64) -> u64 {
    n.div_ceil(align) * align
}
