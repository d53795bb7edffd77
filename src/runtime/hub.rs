//! The protocol engine behind the event loop.
//!
//! `Hub` ties the registry, reassembler, dispatcher and mailbox together
//! and exposes the callbacks the I/O layer drives: new connection, bytes
//! received, connection closed. Everything here runs on the network thread
//! and never blocks.

use crate::config::Config;
use crate::error::DispatchError;
use crate::protocol::{Command, Frame, FrameCodec, StreamReassembler};
use crate::runtime::dispatch::{CommandDispatcher, Outbox};
use crate::runtime::router::{self, Transport};
use crate::runtime::{ClientRegistry, Connection, ConnectionId, Mailbox, TransportHandle};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Routing and hardening policy for a [`Hub`].
#[derive(Debug, Clone, Default)]
pub struct HubOptions {
    /// Deliver a sender's own frames back to it.
    pub echo_to_sender: bool,
    /// Answer a rejected frame with a notice to its sender.
    pub notify_rejections: bool,
    /// Maximum declared frame length accepted by the decoder.
    pub max_frame_length: Option<u32>,
    /// Receive buffer size above which a connection is torn down.
    pub max_pending_bytes: Option<usize>,
    /// Enqueue dispatched frames on the mailbox.
    pub mailbox_enabled: bool,
}

impl HubOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            echo_to_sender: config.echo_to_sender,
            notify_rejections: config.notify_rejections,
            max_frame_length: config.max_frame_length,
            max_pending_bytes: config.max_pending_bytes,
            mailbox_enabled: config.mailbox_workers > 0,
        }
    }
}

pub struct Hub {
    registry: ClientRegistry,
    reassembler: StreamReassembler,
    dispatcher: CommandDispatcher,
    mailbox: Arc<Mailbox<Frame>>,
    options: HubOptions,
}

impl Hub {
    pub fn new(options: HubOptions, mailbox: Arc<Mailbox<Frame>>) -> Self {
        Self {
            registry: ClientRegistry::new(),
            reassembler: StreamReassembler::new(FrameCodec::with_max_length(
                options.max_frame_length,
            )),
            dispatcher: CommandDispatcher::new(),
            mailbox,
            options,
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn mailbox(&self) -> &Arc<Mailbox<Frame>> {
        &self.mailbox
    }

    pub fn on_new_connection(&mut self, handle: TransportHandle, peer: SocketAddr) -> ConnectionId {
        let id = self.registry.add(handle, peer);
        info!(connection_id = %id, %peer, clients = self.registry.len(), "Client connected");
        id
    }

    /// Feed bytes read from `id` through reassembly, dispatch and routing.
    ///
    /// Returns connections the caller must tear down: peers whose writes
    /// failed, and `id` itself if its pending buffer exceeds the cap.
    pub fn on_bytes_received<T: Transport>(
        &mut self,
        id: ConnectionId,
        bytes: &[u8],
        transport: &mut T,
    ) -> Vec<ConnectionId> {
        let reassembly = match self.reassembler.feed(&mut self.registry, id, bytes) {
            Ok(reassembly) => reassembly,
            Err(e) => {
                debug!(error = %e, len = bytes.len(), "Ignoring bytes");
                return Vec::new();
            }
        };

        if reassembly.discarded > 0 {
            warn!(
                connection_id = %id,
                discarded = reassembly.discarded,
                "Discarded bytes while resynchronizing"
            );
        }

        let mut teardown = Vec::new();
        for frame in &reassembly.frames {
            let failed = self.handle_frame(id, frame, transport);
            for failed_id in failed {
                if !teardown.contains(&failed_id) {
                    let _ = self.registry.set_connected(failed_id, false);
                    teardown.push(failed_id);
                }
            }
        }

        if let Some(limit) = self.options.max_pending_bytes {
            let pending = self.registry.lookup(id).map_or(0, Connection::pending_bytes);
            if pending > limit && !teardown.contains(&id) {
                warn!(connection_id = %id, pending, limit, "Receive buffer over limit");
                teardown.push(id);
            }
        }

        teardown
    }

    fn handle_frame<T: Transport>(
        &self,
        sender: ConnectionId,
        frame: &Frame,
        transport: &mut T,
    ) -> Vec<ConnectionId> {
        let mailbox = self.options.mailbox_enabled.then_some(&*self.mailbox);
        let mut outbox = Outbox::new(mailbox);

        if let Err(e) = self
            .dispatcher
            .dispatch(frame, sender, &self.registry, &mut outbox)
        {
            warn!(connection_id = %sender, command = frame.command(), error = %e, "Command failed");
            return self.notify_rejection(sender, &e, transport);
        }

        let exclude = (!self.options.echo_to_sender).then_some(sender);
        router::broadcast(outbox.frames(), exclude, &self.registry, transport)
    }

    fn notify_rejection<T: Transport>(
        &self,
        sender: ConnectionId,
        error: &DispatchError,
        transport: &mut T,
    ) -> Vec<ConnectionId> {
        if !self.options.notify_rejections {
            return Vec::new();
        }
        let notice = format!("[server] {error}");
        let Ok(frame) = Frame::new(Command::TextMessage, notice.into_bytes()) else {
            return Vec::new();
        };
        match router::send_to(sender, &frame, &self.registry, transport) {
            Ok(()) => Vec::new(),
            Err(_) => vec![sender],
        }
    }

    /// Broadcast a server-originated text message.
    pub fn send_system_message<T: Transport>(
        &mut self,
        text: &str,
        exclude: Option<ConnectionId>,
        transport: &mut T,
    ) -> Vec<ConnectionId> {
        let Ok(frame) = Frame::new(Command::TextMessage, text.as_bytes().to_vec()) else {
            return Vec::new();
        };
        let failed = router::broadcast(&[frame], exclude, &self.registry, transport);
        for id in &failed {
            let _ = self.registry.set_connected(*id, false);
        }
        failed
    }

    /// Mark `id` disconnected and drop it from the registry.
    pub fn on_connection_closed(&mut self, id: ConnectionId) -> Option<Connection> {
        let _ = self.registry.set_connected(id, false);
        let conn = self.registry.remove(id)?;
        let session = Utc::now() - conn.connected_at();
        info!(
            connection_id = %id,
            peer = %conn.peer(),
            session_secs = session.num_seconds(),
            discarded_pending = conn.pending_bytes(),
            clients = self.registry.len(),
            "Client disconnected"
        );
        Some(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::router::tests::RecordingTransport;

    fn hub(options: HubOptions) -> Hub {
        Hub::new(options, Mailbox::shared())
    }

    fn echoing() -> HubOptions {
        HubOptions {
            echo_to_sender: true,
            mailbox_enabled: true,
            ..HubOptions::default()
        }
    }

    fn connect(hub: &mut Hub, n: usize) -> Vec<ConnectionId> {
        (0..n)
            .map(|i| {
                hub.on_new_connection(TransportHandle(i), SocketAddr::from(([127, 0, 0, 1], 6000)))
            })
            .collect()
    }

    fn encoded(command: Command, payload: &[u8]) -> Vec<u8> {
        Frame::new(command, payload.to_vec()).unwrap().encode().to_vec()
    }

    #[test]
    fn test_text_message_broadcast() {
        let mut hub = hub(echoing());
        let ids = connect(&mut hub, 3);
        let mut transport = RecordingTransport::default();

        let teardown =
            hub.on_bytes_received(ids[2], &encoded(Command::TextMessage, b"hi"), &mut transport);
        assert!(teardown.is_empty());

        for h in 0..3 {
            let frames = transport.frames_for(TransportHandle(h));
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].payload().as_ref(), b"[3] hi");
        }
        assert_eq!(hub.mailbox().size(), 1);
    }

    #[test]
    fn test_sender_excluded_without_echo() {
        let mut hub = hub(HubOptions::default());
        let ids = connect(&mut hub, 2);
        let mut transport = RecordingTransport::default();

        hub.on_bytes_received(ids[0], &encoded(Command::TextMessage, b"yo"), &mut transport);
        assert!(transport.frames_for(TransportHandle(0)).is_empty());
        assert_eq!(transport.frames_for(TransportHandle(1)).len(), 1);
        // Mailbox disabled.
        assert!(hub.mailbox().is_empty());
    }

    #[test]
    fn test_fragmented_and_corrupt_input() {
        let mut hub = hub(echoing());
        let ids = connect(&mut hub, 1);
        let mut transport = RecordingTransport::default();

        let mut stream = vec![0x5A];
        stream.extend(encoded(Command::TextMessage, b"A"));
        stream.extend(encoded(Command::TextMessage, b"B"));

        for chunk in stream.chunks(3) {
            hub.on_bytes_received(ids[0], chunk, &mut transport);
        }

        let payloads: Vec<Vec<u8>> = transport
            .frames_for(TransportHandle(0))
            .iter()
            .map(|f| f.payload().to_vec())
            .collect();
        assert_eq!(payloads, vec![b"[1] A".to_vec(), b"[1] B".to_vec()]);
        assert_eq!(hub.registry().lookup(ids[0]).unwrap().pending_bytes(), 0);
    }

    #[test]
    fn test_rejection_is_silent_by_default() {
        let mut hub = hub(echoing());
        let ids = connect(&mut hub, 2);
        let mut transport = RecordingTransport::default();

        hub.on_bytes_received(ids[0], &encoded(Command::TextMessage, b""), &mut transport);
        assert!(transport.sent.is_empty());
        assert!(hub.mailbox().is_empty());
    }

    #[test]
    fn test_rejection_notice_goes_to_sender_only() {
        let mut hub = hub(HubOptions {
            notify_rejections: true,
            ..echoing()
        });
        let ids = connect(&mut hub, 2);
        let mut transport = RecordingTransport::default();

        let unknown = Frame::new(999u16, b"?".to_vec()).unwrap().encode();
        hub.on_bytes_received(ids[1], &unknown, &mut transport);

        let frames = transport.frames_for(TransportHandle(1));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload().as_ref(), b"[server] rejected: unknown command");
        assert!(transport.frames_for(TransportHandle(0)).is_empty());
    }

    #[test]
    fn test_failed_peer_reported_for_teardown() {
        let mut hub = hub(echoing());
        let ids = connect(&mut hub, 3);
        let mut transport = RecordingTransport::default();
        transport.broken.insert(TransportHandle(1));

        let mut bytes = encoded(Command::TextMessage, b"one");
        bytes.extend(encoded(Command::TextMessage, b"two"));
        let teardown = hub.on_bytes_received(ids[0], &bytes, &mut transport);

        assert_eq!(teardown, vec![ids[1]]);
        assert!(!hub.registry().lookup(ids[1]).unwrap().is_connected());
        assert_eq!(transport.frames_for(TransportHandle(2)).len(), 2);
    }

    #[test]
    fn test_pending_limit() {
        let mut hub = hub(HubOptions {
            max_pending_bytes: Some(16),
            ..echoing()
        });
        let ids = connect(&mut hub, 1);
        let mut transport = RecordingTransport::default();

        let frame = encoded(Command::FileData, &[1u8; 64]);
        assert!(hub.on_bytes_received(ids[0], &frame[..12], &mut transport).is_empty());
        assert_eq!(hub.on_bytes_received(ids[0], &frame[12..30], &mut transport), vec![ids[0]]);
    }

    #[test]
    fn test_unknown_connection_ignored() {
        let mut hub = hub(echoing());
        let mut transport = RecordingTransport::default();
        let teardown = hub.on_bytes_received(
            ConnectionId(77),
            &encoded(Command::TestConnect, b""),
            &mut transport,
        );
        assert!(teardown.is_empty());
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn test_connection_closed() {
        let mut hub = hub(echoing());
        let ids = connect(&mut hub, 2);
        let mut transport = RecordingTransport::default();

        assert!(hub.on_connection_closed(ids[0]).is_some());
        assert!(hub.on_connection_closed(ids[0]).is_none());

        hub.on_bytes_received(ids[1], &encoded(Command::TestConnect, b"x"), &mut transport);
        assert!(transport.frames_for(TransportHandle(0)).is_empty());
        let frames = transport.frames_for(TransportHandle(1));
        assert_eq!(frames[0].payload().as_ref(), b"OK");
    }

    #[test]
    fn test_system_message() {
        let mut hub = hub(echoing());
        let ids = connect(&mut hub, 2);
        let mut transport = RecordingTransport::default();

        hub.send_system_message("maintenance at noon", Some(ids[0]), &mut transport);
        assert!(transport.frames_for(TransportHandle(0)).is_empty());
        assert_eq!(
            transport.frames_for(TransportHandle(1))[0].payload().as_ref(),
            b"maintenance at noon"
        );
    }
}
