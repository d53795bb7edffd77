//! mio event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS. A single thread owns the loop, the stream slab and the [`Hub`];
//! only the mailbox is shared with worker threads.

use crate::config::Config;
use crate::error::TransportError;
use crate::runtime::hub::{Hub, HubOptions};
use crate::runtime::router::Transport;
use crate::runtime::worker::MailboxWorkers;
use crate::runtime::{ConnectionId, Mailbox, TransportHandle};
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Readiness events handled per poll.
const MAX_EVENTS: usize = 1024;

/// Per-connection socket state.
struct MioConnection {
    stream: TcpStream,
    conn_id: ConnectionId,
    /// Bytes accepted by `send` but not yet written.
    outbound: BytesMut,
    /// Whether WRITABLE interest is currently registered.
    write_interest: bool,
}

/// Stops a running [`Server`] from any thread.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Transport over the stream slab. Writes go out immediately when the
/// socket accepts them; the rest waits for a writable event.
struct SlabTransport<'a> {
    registry: &'a Registry,
    connections: &'a mut Slab<MioConnection>,
}

impl Transport for SlabTransport<'_> {
    fn send(&mut self, handle: TransportHandle, bytes: &[u8]) -> Result<(), TransportError> {
        let conn = self
            .connections
            .get_mut(handle.0)
            .ok_or(TransportError::Closed)?;
        conn.outbound.extend_from_slice(bytes);
        flush(conn, self.registry, Token(handle.0))?;
        Ok(())
    }
}

/// Write as much of the outbound buffer as the socket takes and keep the
/// WRITABLE registration in step with whether anything is left.
fn flush(conn: &mut MioConnection, registry: &Registry, token: Token) -> io::Result<()> {
    while !conn.outbound.is_empty() {
        match conn.stream.write(&conn.outbound) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => conn.outbound.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let want_write = !conn.outbound.is_empty();
    if want_write != conn.write_interest {
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.reregister(&mut conn.stream, token, interest)?;
        conn.write_interest = want_write;
    }
    Ok(())
}

/// The network-facing server: one poll loop, one hub.
pub struct Server {
    config: Config,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: Slab<MioConnection>,
    hub: Hub,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Bind the listener and register it with a fresh poll instance.
    pub fn bind(config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let listener = create_listener(config.listen)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        let hub = Hub::new(HubOptions::from_config(&config), Mailbox::shared());

        Ok(Self {
            connections: Slab::with_capacity(config.max_connections),
            config,
            poll,
            listener,
            local_addr,
            hub,
            shutdown: ShutdownHandle::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until the shutdown handle is triggered.
    pub fn run(mut self) -> io::Result<()> {
        let workers = MailboxWorkers::spawn(
            self.config.mailbox_workers,
            self.hub.mailbox(),
            self.config.mailbox_batch_size,
            self.config.mailbox_pop_timeout,
            &self.shutdown.flag,
        )?;

        info!(
            addr = %self.local_addr,
            max_connections = self.config.max_connections,
            mailbox_workers = workers.len(),
            "Server listening"
        );

        let result = self.event_loop();
        self.stop(workers);
        result
    }

    fn event_loop(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut read_buf = vec![0u8; self.config.read_buffer_size];

        while !self.shutdown.is_stopped() {
            match self.poll.poll(&mut events, Some(self.config.poll_timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    return Err(e);
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(key) => self.handle_connection_event(key, event, &mut read_buf),
                }
            }
        }

        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.connections.len() >= self.config.max_connections {
                        warn!(%peer, "Connection limit reached");
                        continue;
                    }

                    let entry = self.connections.vacant_entry();
                    let key = entry.key();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(key),
                        Interest::READABLE,
                    ) {
                        error!(%peer, error = %e, "Failed to register connection");
                        continue;
                    }

                    let conn_id = self.hub.on_new_connection(TransportHandle(key), peer);
                    entry.insert(MioConnection {
                        stream,
                        conn_id,
                        outbound: BytesMut::new(),
                        write_interest: false,
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_connection_event(
        &mut self,
        key: usize,
        event: &mio::event::Event,
        read_buf: &mut [u8],
    ) {
        let Some(conn_id) = self.connections.get(key).map(|c| c.conn_id) else {
            return;
        };

        let mut teardown = Vec::new();

        if event.is_readable() {
            if let Err(e) = self.handle_readable(key, conn_id, read_buf, &mut teardown) {
                debug!(connection_id = %conn_id, error = %e, "Read ended");
                teardown.push(conn_id);
            }
        }

        if event.is_writable() && !teardown.contains(&conn_id) {
            if let Some(conn) = self.connections.get_mut(key) {
                if let Err(e) = flush(conn, self.poll.registry(), Token(key)) {
                    debug!(connection_id = %conn_id, error = %e, "Write failed");
                    teardown.push(conn_id);
                }
            }
        }

        for id in teardown {
            self.close_connection(id);
        }
    }

    /// Drain the socket. Edge-triggered readiness requires reading until
    /// `WouldBlock`; each read is one reassembly pass.
    fn handle_readable(
        &mut self,
        key: usize,
        conn_id: ConnectionId,
        read_buf: &mut [u8],
        teardown: &mut Vec<ConnectionId>,
    ) -> io::Result<()> {
        loop {
            let conn = self
                .connections
                .get_mut(key)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

            let n = match conn.stream.read(read_buf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"));
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            debug!(connection_id = %conn_id, bytes = n, "Received");

            let mut transport = SlabTransport {
                registry: self.poll.registry(),
                connections: &mut self.connections,
            };
            let failed = self.hub.on_bytes_received(conn_id, &read_buf[..n], &mut transport);

            let stop_reading = failed.contains(&conn_id);
            for id in failed {
                if !teardown.contains(&id) {
                    teardown.push(id);
                }
            }
            if stop_reading {
                return Ok(());
            }
        }
    }

    fn close_connection(&mut self, id: ConnectionId) {
        let handle = self.hub.registry().handle_of(id);
        self.hub.on_connection_closed(id);

        if let Some(TransportHandle(key)) = handle {
            if let Some(mut conn) = self.connections.try_remove(key) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                debug!(connection_id = %id, unsent = conn.outbound.len(), "Connection closed");
            }
        }
    }

    /// Close every connection, abandon queued mailbox items and join the
    /// workers.
    fn stop(mut self, workers: MailboxWorkers) {
        info!(clients = self.connections.len(), "Shutting down");

        let ids: Vec<ConnectionId> = self.connections.iter().map(|(_, c)| c.conn_id).collect();
        for id in ids {
            self.close_connection(id);
        }

        let abandoned = self.hub.mailbox().size();
        self.hub.mailbox().clear();

        self.shutdown.stop();
        let stats = workers.join();

        info!(consumed = stats.consumed, abandoned, "Server has stopped");
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Frame};
    use std::net::TcpStream as StdTcpStream;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            poll_timeout: Duration::from_millis(10),
            ..Config::default()
        }
    }

    fn start(config: Config) -> (SocketAddr, ShutdownHandle, JoinHandle<io::Result<()>>) {
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());
        (addr, shutdown, handle)
    }

    fn connect(addr: SocketAddr) -> StdTcpStream {
        let stream = StdTcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn frame(command: Command, payload: &[u8]) -> Frame {
        Frame::new(command, payload.to_vec()).unwrap()
    }

    fn expect_frame(stream: &mut StdTcpStream, expected: &Frame) {
        let want = expected.encode();
        let mut got = vec![0u8; want.len()];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(&got[..], &want[..]);
    }

    /// Send TEST_CONNECT and wait for the acknowledgement, which proves the
    /// server has registered the connection.
    fn handshake(stream: &mut StdTcpStream) {
        stream
            .write_all(&frame(Command::TestConnect, b"hello").encode())
            .unwrap();
        expect_frame(stream, &frame(Command::TestConnect, b"OK"));
    }

    #[test]
    fn test_loopback_broadcast() {
        let (addr, shutdown, handle) = start(test_config());

        let mut alice = connect(addr);
        handshake(&mut alice);

        let mut bob = connect(addr);
        handshake(&mut bob);
        // Bob's handshake reply is broadcast to Alice as well.
        expect_frame(&mut alice, &frame(Command::TestConnect, b"OK"));

        // Garbage, then a message split across writes.
        let encoded = frame(Command::TextMessage, b"hi").encode();
        alice.write_all(&[0x00]).unwrap();
        alice.write_all(&encoded[..5]).unwrap();
        alice.flush().unwrap();
        thread::sleep(Duration::from_millis(20));
        alice.write_all(&encoded[5..]).unwrap();

        let relayed = frame(Command::TextMessage, b"[1] hi");
        expect_frame(&mut alice, &relayed);
        expect_frame(&mut bob, &relayed);

        drop(bob);
        thread::sleep(Duration::from_millis(50));

        alice
            .write_all(&frame(Command::TextMessage, b"bye").encode())
            .unwrap();
        expect_frame(&mut alice, &frame(Command::TextMessage, b"[1] bye"));

        shutdown.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_closes_clients() {
        let (addr, shutdown, handle) = start(test_config());
        let mut client = connect(addr);
        handshake(&mut client);

        shutdown.stop();
        handle.join().unwrap().unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }
}
