use core::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, PUBLIC_KEY_SIZE};

/// Size of an encoded [`RouteDescriptor`] in bytes.
pub const ROUTE_DESCRIPTOR_SIZE: usize = 2 * PUBLIC_KEY_SIZE + 2 * 2;

/// Identifier of one direction of one hop of a route, local to the visor which issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(u32);

/// A port on a visor, used to tell apart route groups between the same pair of visors.
pub type Port = u16;

impl RouteId {
    /// Creates a new `RouteId`.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw value of this `RouteId`.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for RouteId {
    #[inline]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The (source, destination) pair of visor addresses which identifies a route group on a visor.
///
/// On the wire, a descriptor is laid out as `[src_pk][dst_pk][src_port][dst_port]`, with both
/// ports encoded as big endian `u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteDescriptor {
    src_pk: PublicKey,
    dst_pk: PublicKey,
    src_port: Port,
    dst_port: Port,
}

impl RouteDescriptor {
    /// Create a new `RouteDescriptor`.
    pub fn new(src_pk: PublicKey, dst_pk: PublicKey, src_port: Port, dst_port: Port) -> Self {
        Self {
            src_pk,
            dst_pk,
            src_port,
            dst_port,
        }
    }

    #[inline]
    pub fn src_pk(&self) -> PublicKey {
        self.src_pk
    }

    #[inline]
    pub fn dst_pk(&self) -> PublicKey {
        self.dst_pk
    }

    #[inline]
    pub fn src_port(&self) -> Port {
        self.src_port
    }

    #[inline]
    pub fn dst_port(&self) -> Port {
        self.dst_port
    }

    /// The source of this descriptor as an [`Addr`].
    pub fn src(&self) -> Addr {
        Addr::new(self.src_pk, self.src_port)
    }

    /// The destination of this descriptor as an [`Addr`].
    pub fn dst(&self) -> Addr {
        Addr::new(self.dst_pk, self.dst_port)
    }

    /// Describe the opposite direction, by swapping source and destination.
    pub fn invert(&self) -> Self {
        Self {
            src_pk: self.dst_pk,
            dst_pk: self.src_pk,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// Write the binary form of this descriptor to the buffer.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(self.src_pk.as_bytes());
        dst.put_slice(self.dst_pk.as_bytes());
        dst.put_u16(self.src_port);
        dst.put_u16(self.dst_port);
    }

    /// Read a descriptor from the buffer. The caller must make sure at least
    /// [`ROUTE_DESCRIPTOR_SIZE`] bytes are remaining.
    pub(crate) fn decode(src: &mut impl Buf) -> Self {
        let mut src_pk = [0; PUBLIC_KEY_SIZE];
        src.copy_to_slice(&mut src_pk);
        let mut dst_pk = [0; PUBLIC_KEY_SIZE];
        src.copy_to_slice(&mut dst_pk);
        let src_port = src.get_u16();
        let dst_port = src.get_u16();
        Self {
            src_pk: src_pk.into(),
            dst_pk: dst_pk.into(),
            src_port,
            dst_port,
        }
    }
}

impl fmt::Display for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rtDesc({}, {})", self.src(), self.dst())
    }
}

/// A network address of an endpoint on a visor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    pub pk: PublicKey,
    pub port: Port,
}

impl Addr {
    pub fn new(pk: PublicKey, port: Port) -> Self {
        Self { pk, port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pk, self.port)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::{RouteDescriptor, ROUTE_DESCRIPTOR_SIZE};
    use crate::crypto::PublicKey;

    #[test]
    fn invert_swaps_both_ends() {
        let a = PublicKey::from([1; 32]);
        let b = PublicKey::from([2; 32]);
        let desc = RouteDescriptor::new(a, b, 1, 2);
        let inv = desc.invert();

        assert_eq!(inv.src_pk(), b);
        assert_eq!(inv.dst_pk(), a);
        assert_eq!(inv.src_port(), 2);
        assert_eq!(inv.dst_port(), 1);
        assert_eq!(inv.invert(), desc);
    }

    #[test]
    fn binary_layout() {
        let desc = RouteDescriptor::new(PublicKey::from([1; 32]), PublicKey::from([2; 32]), 3, 0x0102);
        let mut buf = BytesMut::new();
        desc.encode(&mut buf);

        assert_eq!(buf.len(), ROUTE_DESCRIPTOR_SIZE);
        assert_eq!(&buf[..32], &[1; 32]);
        assert_eq!(&buf[32..64], &[2; 32]);
        assert_eq!(&buf[64..], &[0, 3, 1, 2]);
    }
}
