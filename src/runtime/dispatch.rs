//! Command dispatch: one inbound frame in, zero or more outbound frames out.
//!
//! The table is built once and never changes. Handlers write to an
//! [`Outbox`], which feeds two independent sinks: an ordered list for the
//! caller to deliver synchronously, and the shared mailbox for any
//! out-of-band consumer.

use crate::error::{DispatchError, RejectReason};
use crate::protocol::{Command, Frame};
use crate::runtime::{ClientRegistry, ConnectionId, Mailbox};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use tracing::{debug, info};

/// Reply payload for `TEST_CONNECT`.
pub const TEST_CONNECT_ACK: &[u8] = b"OK";

/// Sink for frames produced by a handler.
pub struct Outbox<'a> {
    frames: Vec<Frame>,
    mailbox: Option<&'a Mailbox<Frame>>,
}

impl<'a> Outbox<'a> {
    /// Outbox that also enqueues every frame on `mailbox`, if given.
    pub fn new(mailbox: Option<&'a Mailbox<Frame>>) -> Self {
        Self {
            frames: Vec::new(),
            mailbox,
        }
    }

    /// Emit a frame to both sinks. The mailbox tag is the frame's command.
    pub fn emit(&mut self, frame: Frame) {
        if let Some(mailbox) = self.mailbox {
            mailbox.push_tagged(u32::from(frame.command()), frame.clone());
        }
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    TextMessage,
    FileStart,
    FileData,
    FileComplete,
    TestConnect,
}

const HANDLERS: [(Command, Handler); 5] = [
    (Command::TextMessage, Handler::TextMessage),
    (Command::FileStart, Handler::FileStart),
    (Command::FileData, Handler::FileData),
    (Command::FileComplete, Handler::FileComplete),
    (Command::TestConnect, Handler::TestConnect),
];

/// Fixed mapping from command code to handler.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    table: HashMap<u16, Handler>,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        let table = HANDLERS
            .iter()
            .map(|(command, handler)| (command.code(), *handler))
            .collect();
        Self { table }
    }

    /// Whether `code` has a handler.
    pub fn handles(&self, code: u16) -> bool {
        self.table.contains_key(&code)
    }

    /// Run the handler for `frame`. A rejected frame emits nothing.
    pub fn dispatch(
        &self,
        frame: &Frame,
        sender: ConnectionId,
        registry: &ClientRegistry,
        outbox: &mut Outbox<'_>,
    ) -> Result<(), DispatchError> {
        let handler = self.table.get(&frame.command()).ok_or(DispatchError::Rejected(
            RejectReason::UnknownCommand(frame.command()),
        ))?;

        // Unknown senders get their frames passed through untagged.
        let known = registry.contains(sender);

        match handler {
            Handler::TextMessage => {
                if frame.payload().is_empty() {
                    return Err(DispatchError::Rejected(RejectReason::EmptyPayload));
                }
                debug!(
                    connection_id = %sender,
                    len = frame.payload().len(),
                    "Forwarding chat message"
                );
                if known {
                    outbox.emit(Frame::new(
                        Command::TextMessage,
                        tagged(sender, frame.payload()),
                    )?);
                } else {
                    outbox.emit(frame.clone());
                }
            }
            Handler::FileStart => {
                if frame.payload().is_empty() {
                    return Err(DispatchError::Rejected(RejectReason::EmptyFilename));
                }
                let filename = String::from_utf8_lossy(frame.payload());
                info!(connection_id = %sender, %filename, "File transfer started");
                if known {
                    let notice = format!("started file transfer: {filename}");
                    outbox.emit(Frame::new(
                        Command::TextMessage,
                        tagged(sender, notice.as_bytes()),
                    )?);
                }
                outbox.emit(frame.clone());
            }
            Handler::FileData => {
                debug!(connection_id = %sender, chunk = frame.payload().len(), "File data chunk");
                outbox.emit(frame.clone());
            }
            Handler::FileComplete => {
                info!(connection_id = %sender, "File transfer completed");
                if known {
                    outbox.emit(Frame::new(
                        Command::TextMessage,
                        tagged(sender, b"file transfer completed"),
                    )?);
                }
                outbox.emit(frame.clone());
            }
            Handler::TestConnect => {
                debug!(connection_id = %sender, "Test connect");
                outbox.emit(Frame::new(Command::TestConnect, TEST_CONNECT_ACK)?);
            }
        }

        Ok(())
    }
}

/// `"[<id>] "` followed by `body`.
fn tagged(sender: ConnectionId, body: &[u8]) -> BytesMut {
    let prefix = format!("[{sender}] ");
    let mut out = BytesMut::with_capacity(prefix.len() + body.len());
    out.put_slice(prefix.as_bytes());
    out.put_slice(body);
    out
}
