//! Wire protocol: frame layout, command codes and stream reassembly.
//!
//! ```text
//! offset  size  field     encoding
//! 0       2     magic     0xFEFF, big-endian
//! 2       4     length    u32 big-endian, = payload_len + 4
//! 6       2     command   u16 big-endian
//! 8       N     payload   N = length - 4
//! 8+N     2     checksum  u16 big-endian, = sum(payload) mod 65536
//! ```

pub mod command;
pub mod frame;
pub mod reassembler;

pub use command::Command;
pub use frame::{checksum, decode, Frame, FrameCodec};
pub use reassembler::{Reassembly, StreamReassembler};
