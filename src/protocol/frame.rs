//! Frame encoding and decoding.
//!
//! Every multi-byte field, the magic sentinel included, is big-endian.
//! A frame is `10 + payload_len` bytes on the wire.

use crate::error::{Corruption, ProtocolError};
use crate::protocol::Command;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame sentinel, `FE FF` on the wire.
pub const MAGIC: u16 = 0xFEFF;

/// Bytes before the payload: magic(2) + length(4) + command(2).
pub const HEADER_LEN: usize = 8;

/// Total framing overhead: header plus the trailing checksum.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + 2;

/// Bytes counted by `length` besides the payload: command(2) + checksum(2).
const LENGTH_OVERHEAD: u32 = 4;

/// Largest payload the 32-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = (u32::MAX - LENGTH_OVERHEAD) as usize;

/// Low 16 bits of the byte-wise sum of `payload`.
pub fn checksum(payload: &[u8]) -> u16 {
    payload
        .iter()
        .fold(0u16, |sum, &byte| sum.wrapping_add(u16::from(byte)))
}

/// One validated protocol unit. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: u16,
    payload: Bytes,
}

impl Frame {
    /// Build a frame, failing only if the payload cannot be described by
    /// the length field.
    pub fn new(command: impl Into<u16>, payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            command: command.into(),
            payload,
        })
    }

    /// Raw command code.
    pub fn command(&self) -> u16 {
        self.command
    }

    /// Command code as a known [`Command`], if it is one.
    pub fn known_command(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Value of the `length` field: payload plus command and checksum.
    pub fn length(&self) -> u32 {
        self.payload.len() as u32 + LENGTH_OVERHEAD
    }

    pub fn checksum(&self) -> u16 {
        checksum(&self.payload)
    }

    /// Size of the encoded frame in bytes.
    pub fn wire_len(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut dst);
        dst.freeze()
    }

    /// Append the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_u16(MAGIC);
        dst.put_u32(self.length());
        dst.put_u16(self.command);
        dst.put_slice(&self.payload);
        dst.put_u16(self.checksum());
    }
}

/// Decode a frame from the front of `buf` with no length limit.
///
/// See [`FrameCodec::decode`].
pub fn decode(buf: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    FrameCodec::new().decode(buf)
}

/// Frame decoder with an optional cap on the declared length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCodec {
    max_length: Option<u32>,
}

impl FrameCodec {
    /// Codec that accepts any declared length.
    pub const fn new() -> Self {
        Self { max_length: None }
    }

    /// Codec that treats a declared `length` above `max_length` as corrupt.
    pub const fn with_max_length(max_length: Option<u32>) -> Self {
        Self { max_length }
    }

    /// Decode one frame.
    ///
    /// Scans forward for the sentinel, then validates the header and the
    /// checksum. On success returns the frame and the number of bytes
    /// consumed, counted from the start of `buf` so that any bytes skipped
    /// while scanning are consumed too. Never consumes on `Incomplete`.
    pub fn decode(&self, buf: &[u8]) -> Result<(Frame, usize), ProtocolError> {
        let start = find_magic(buf).ok_or(ProtocolError::Incomplete)?;
        let mut cursor = &buf[start + 2..];

        // length(4) + command(2) + checksum(2)
        if cursor.len() < 8 {
            return Err(ProtocolError::Incomplete);
        }

        let length = cursor.get_u32();
        if length < LENGTH_OVERHEAD {
            return Err(ProtocolError::Corrupt(Corruption::BadLength(length)));
        }
        if let Some(limit) = self.max_length {
            if length > limit {
                return Err(ProtocolError::Corrupt(Corruption::LengthExceedsLimit {
                    length,
                    limit,
                }));
            }
        }
        if cursor.len() < length as usize {
            return Err(ProtocolError::Incomplete);
        }

        let command = cursor.get_u16();
        let payload_len = (length - LENGTH_OVERHEAD) as usize;
        let payload = Bytes::copy_from_slice(&cursor[..payload_len]);
        cursor.advance(payload_len);
        let declared = cursor.get_u16();

        let actual = checksum(&payload);
        if declared != actual {
            return Err(ProtocolError::Corrupt(Corruption::ChecksumMismatch {
                expected: declared,
                actual,
            }));
        }

        Ok((Frame { command, payload }, start + 6 + length as usize))
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    let magic = MAGIC.to_be_bytes();
    buf.windows(2).position(|w| w == magic)
}
