//! Connection runtime.
//!
//! - `registry`: per-connection state keyed by id and transport handle
//! - `dispatch`: command table and handlers
//! - `router`: delivery of dispatched frames over a `Transport`
//! - `mailbox`: thread-safe queue shared with out-of-band consumers
//! - `hub`: the engine the event loop drives
//! - `event_loop`: mio poll loop (epoll on Linux, kqueue on macOS)
//! - `worker`: mailbox consumer threads

pub mod dispatch;
mod event_loop;
pub mod hub;
mod mailbox;
mod registry;
pub mod router;
mod worker;

pub use dispatch::{CommandDispatcher, Outbox};
pub use event_loop::{Server, ShutdownHandle};
pub use hub::{Hub, HubOptions};
pub use mailbox::{Completion, Mailbox, MailboxItem};
pub use registry::{ClientRegistry, Connection, ConnectionId, TransportHandle};
pub use router::Transport;
pub use worker::{MailboxWorkers, WorkerStats};
