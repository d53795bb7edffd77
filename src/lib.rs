//! framecast: a binary-frame broadcast server.
//!
//! Clients exchange length-prefixed, checksummed frames over TCP. The server
//! reassembles each byte stream, dispatches every frame by command code and
//! relays the results to connected clients. Dispatched frames are also
//! queued on a mailbox for out-of-band consumers.
//!
//! Features:
//! - Resynchronizing frame decoder tolerant of garbage and fragmentation
//! - Text messages and file transfer relay
//! - Connection registry with stable, never-reused ids
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod error;
pub mod protocol;
pub mod runtime;
