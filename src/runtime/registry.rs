//! Client registry: connection identity, metadata and receive buffers.
//!
//! Maps `ConnectionId -> Connection` and `TransportHandle -> ConnectionId`,
//! keeping both directions consistent. Only the network thread mutates it.

use crate::error::RegistryError;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

/// Server-assigned connection identity. Monotonic, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle the transport uses to write back to a peer.
///
/// The event loop uses its slab key, which may be recycled after a
/// disconnect; connection ids are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub usize);

/// One active client session.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    handle: TransportHandle,
    peer: SocketAddr,
    display_name: String,
    connected: bool,
    connected_at: DateTime<Utc>,
    receive_buffer: BytesMut,
}

impl Connection {
    fn new(id: ConnectionId, handle: TransportHandle, peer: SocketAddr) -> Self {
        Self {
            id,
            handle,
            peer,
            display_name: String::new(),
            connected: true,
            connected_at: Utc::now(),
            receive_buffer: BytesMut::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn peer_address(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn peer_port(&self) -> u16 {
        self.peer.port()
    }

    /// Name set after connecting; empty until then.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Bytes received but not yet consumed into a frame.
    pub fn pending_bytes(&self) -> usize {
        self.receive_buffer.len()
    }
}

/// Registry of active connections.
///
/// Provides O(1) lookup in both directions.
#[derive(Debug)]
pub struct ClientRegistry {
    connections: HashMap<ConnectionId, Connection>,
    by_handle: HashMap<TransportHandle, ConnectionId>,
    next_id: u64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// Create an empty registry. The first connection gets id 1.
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            by_handle: HashMap::new(),
            next_id: 1,
        }
    }

    /// Register a newly accepted connection and assign it the next id.
    ///
    /// A handle still mapped to an older connection means the transport
    /// recycled it without reporting the close; that stale entry is removed
    /// first so the two maps stay a bijection.
    pub fn add(&mut self, handle: TransportHandle, peer: SocketAddr) -> ConnectionId {
        if let Some(stale) = self.by_handle.get(&handle).copied() {
            warn!(connection_id = %stale, ?handle, "Handle reused before removal");
            self.remove(stale);
        }

        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        self.connections.insert(id, Connection::new(id, handle, peer));
        self.by_handle.insert(handle, id);

        debug!(connection_id = %id, ?handle, %peer, "Client added");
        id
    }

    /// Remove a connection and its handle mapping. Absent ids are a no-op.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        self.by_handle.remove(&conn.handle);
        debug!(connection_id = %id, handle = ?conn.handle, "Client removed");
        Some(conn)
    }

    pub fn remove_by_handle(&mut self, handle: TransportHandle) -> Option<Connection> {
        let id = self.lookup_by_handle(handle)?;
        self.remove(id)
    }

    pub fn lookup(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn lookup_by_handle(&self, handle: TransportHandle) -> Option<ConnectionId> {
        self.by_handle.get(&handle).copied()
    }

    pub fn handle_of(&self, id: ConnectionId) -> Option<TransportHandle> {
        self.connections.get(&id).map(|c| c.handle)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn append_bytes(&mut self, id: ConnectionId, bytes: &[u8]) -> Result<(), RegistryError> {
        self.get_mut(id)?.receive_buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Take the pending buffer, leaving an empty one in its place.
    pub fn take_buffer(&mut self, id: ConnectionId) -> Result<BytesMut, RegistryError> {
        Ok(std::mem::take(&mut self.get_mut(id)?.receive_buffer))
    }

    pub fn set_buffer(&mut self, id: ConnectionId, buf: BytesMut) -> Result<(), RegistryError> {
        self.get_mut(id)?.receive_buffer = buf;
        Ok(())
    }

    pub fn set_display_name(
        &mut self,
        id: ConnectionId,
        name: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let conn = self.get_mut(id)?;
        conn.display_name = name.into();
        debug!(connection_id = %id, name = %conn.display_name, "Display name updated");
        Ok(())
    }

    pub fn set_connected(
        &mut self,
        id: ConnectionId,
        connected: bool,
    ) -> Result<(), RegistryError> {
        self.get_mut(id)?.connected = connected;
        Ok(())
    }

    /// Ids of connections still marked connected, in ascending order.
    pub fn connected_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.connected)
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Non-empty display names of all registered connections.
    pub fn display_names(&self) -> Vec<String> {
        let mut names: Vec<(ConnectionId, &str)> = self
            .connections
            .values()
            .filter(|c| !c.display_name.is_empty())
            .map(|c| (c.id, c.display_name.as_str()))
            .collect();
        names.sort_unstable();
        names.into_iter().map(|(_, name)| name.to_string()).collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    fn get_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, RegistryError> {
        self.connections
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))
    }
}
