//! Interface to the transport layer.
//!
//! Transports are point to point packet links between two visors. How they are established,
//! discovered and secured is not a concern of the routing core, which only needs to read the
//! packets arriving on any transport, and to write packets to a specific transport.

use core::fmt;
use std::{io, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{crypto::PublicKey, routing::Packet};

/// Unique identifier of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportId(Uuid);

impl TransportId {
    /// Generate a new random `TransportId`.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    #[inline]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for TransportId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single transport to a remote visor.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The id of this transport.
    fn id(&self) -> TransportId;

    /// The visor on the other end of this transport.
    fn remote(&self) -> PublicKey;

    /// Send a packet to the remote. Packets written to the same transport arrive in order.
    async fn write_packet(&self, packet: Packet) -> io::Result<()>;
}

/// The collection of all transports of a visor.
#[async_trait]
pub trait TransportManager: Send + Sync {
    /// Read the next packet arriving on any transport. An error means the manager stopped and no
    /// more packets will arrive.
    async fn read_packet(&self) -> io::Result<Packet>;

    /// Look up a transport by id.
    fn transport(&self, id: &TransportId) -> Option<Arc<dyn Transport>>;
}
