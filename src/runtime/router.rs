//! Outbound routing of dispatched frames.
//!
//! Delivery happens synchronously on the calling thread. A failed send is
//! recorded and delivery continues to the remaining peers.

use crate::error::{RegistryError, TransportError};
use crate::protocol::Frame;
use crate::runtime::{ClientRegistry, ConnectionId, TransportHandle};
use tracing::{debug, trace};

/// Byte sink for a connected peer.
pub trait Transport {
    /// Queue or write `bytes` to the peer behind `handle`.
    fn send(&mut self, handle: TransportHandle, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Send every frame to every connected client except `exclude`.
///
/// Each frame is encoded once. Returns the connections whose send failed.
pub fn broadcast<T: Transport>(
    frames: &[Frame],
    exclude: Option<ConnectionId>,
    registry: &ClientRegistry,
    transport: &mut T,
) -> Vec<ConnectionId> {
    let targets: Vec<(ConnectionId, TransportHandle)> = registry
        .connected_ids()
        .into_iter()
        .filter(|id| Some(*id) != exclude)
        .filter_map(|id| registry.handle_of(id).map(|handle| (id, handle)))
        .collect();

    let mut failed: Vec<ConnectionId> = Vec::new();
    for frame in frames {
        let bytes = frame.encode();
        for &(id, handle) in &targets {
            if failed.contains(&id) {
                continue;
            }
            match transport.send(handle, &bytes) {
                Ok(()) => trace!(connection_id = %id, len = bytes.len(), "Frame sent"),
                Err(e) => {
                    debug!(connection_id = %id, error = %e, "Send failed");
                    failed.push(id);
                }
            }
        }
    }
    failed
}

/// Send one frame to a single connection.
///
/// An id with no registry entry has no transport and reports `Closed`.
pub fn send_to<T: Transport>(
    id: ConnectionId,
    frame: &Frame,
    registry: &ClientRegistry,
    transport: &mut T,
) -> Result<(), TransportError> {
    let handle = registry.handle_of(id).ok_or_else(|| {
        debug!(error = %RegistryError::NotFound(id), "Dropping frame");
        TransportError::Closed
    })?;
    transport.send(handle, &frame.encode())
}
