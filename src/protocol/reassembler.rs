//! Stream reassembly: turns an append-only byte stream into frames.
//!
//! Handles fragmentation (a frame split across reads), coalescing (several
//! frames in one read) and corruption. On a corrupt decode exactly one byte
//! is dropped from the front of the buffer and decoding is retried, which
//! rescans for the next sentinel one byte at a time.

use crate::error::{ProtocolError, RegistryError};
use crate::protocol::{Frame, FrameCodec};
use crate::runtime::{ClientRegistry, ConnectionId};
use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

/// Buffers shorter than this are never handed to the decoder.
pub const MIN_DECODE_LEN: usize = 8;

/// Outcome of one reassembly pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reassembly {
    /// Complete frames in wire order.
    pub frames: Vec<Frame>,
    /// Bytes dropped while resynchronizing after corrupt input.
    pub discarded: usize,
}

/// Extracts frames from per-connection receive buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamReassembler {
    codec: FrameCodec,
}

impl StreamReassembler {
    pub fn new(codec: FrameCodec) -> Self {
        Self { codec }
    }

    /// Extract every complete frame from the front of `buf`.
    ///
    /// Consumed and discarded bytes are removed from `buf`; a trailing
    /// partial frame is left in place. Each loop iteration either removes
    /// at least one byte or stops, so the loop always terminates.
    pub fn extract(&self, buf: &mut BytesMut) -> Reassembly {
        let mut out = Reassembly::default();

        while buf.len() >= MIN_DECODE_LEN {
            match self.codec.decode(buf) {
                Ok((frame, consumed)) => {
                    trace!(
                        command = frame.command(),
                        payload_len = frame.payload().len(),
                        consumed,
                        "Frame decoded"
                    );
                    buf.advance(consumed);
                    out.frames.push(frame);
                }
                Err(ProtocolError::Corrupt(reason)) => {
                    debug!(%reason, buffered = buf.len(), "Corrupt frame, resynchronizing");
                    buf.advance(1);
                    out.discarded += 1;
                }
                Err(_) => break,
            }
        }

        out
    }

    /// Append `bytes` to the connection's receive buffer and extract frames.
    ///
    /// The buffer is taken out of the registry for the pass and put back
    /// with whatever partial frame remains.
    pub fn feed(
        &self,
        registry: &mut ClientRegistry,
        id: ConnectionId,
        bytes: &[u8],
    ) -> Result<Reassembly, RegistryError> {
        registry.append_bytes(id, bytes)?;
        let mut buf = registry.take_buffer(id)?;
        let out = self.extract(&mut buf);
        registry.set_buffer(id, buf)?;
        Ok(out)
    }
}
