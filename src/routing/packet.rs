//! Packets carried over transports.
//!
//! Every packet starts with a 7 byte header: `[type: u8][route_id: u32][size: u16]`, followed by
//! exactly `size` bytes of payload. All integers are big endian.

use core::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::descriptor::RouteId;

/// The size of a `Packet` header on the wire, in bytes.
pub const PACKET_HEADER_SIZE: usize = 7;

/// The largest payload a single packet can carry.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

const TYPE_OFFSET: usize = 0;
const ROUTE_ID_OFFSET: usize = 1;
const SIZE_OFFSET: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Close = 1,
    KeepAlive = 2,
    Handshake = 3,
    Ping = 4,
    Pong = 5,
    Error = 6,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, PacketError> {
        Ok(match value {
            0 => PacketType::Data,
            1 => PacketType::Close,
            2 => PacketType::KeepAlive,
            3 => PacketType::Handshake,
            4 => PacketType::Ping,
            5 => PacketType::Pong,
            6 => PacketType::Error,
            t => return Err(PacketError::UnknownType(t)),
        })
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PacketType::Data => "DataPacket",
            PacketType::Close => "ClosePacket",
            PacketType::KeepAlive => "KeepAlivePacket",
            PacketType::Handshake => "HandshakePacket",
            PacketType::Ping => "PingPacket",
            PacketType::Pong => "PongPacket",
            PacketType::Error => "ErrorPacket",
        })
    }
}

/// Reason carried in a close packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseCode {
    CloseRequested = 0,
}

impl TryFrom<u8> for CloseCode {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CloseCode::CloseRequested),
            c => Err(PacketError::UnknownCloseCode(c)),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCode::CloseRequested => f.write_str("closed by request"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet size exceeded: payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("packet declares {declared} payload bytes but carries {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("unknown close code {0}")]
    UnknownCloseCode(u8),
    #[error("malformed {0} payload")]
    MalformedPayload(PacketType),
}

/// A validated packet. The header is guaranteed to be well formed, so the accessors never fail.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet(Bytes);

impl Packet {
    fn build(packet_type: PacketType, id: RouteId, payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        Ok(Self::build_small(packet_type, id, payload))
    }

    /// Build a packet whose payload is statically known to fit.
    fn build_small(packet_type: PacketType, id: RouteId, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + payload.len());
        buf.put_u8(packet_type as u8);
        buf.put_u32(id.as_u32());
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);
        Packet(buf.freeze())
    }

    /// Create a data packet. Fails if the payload does not fit in a single packet.
    pub fn data(id: RouteId, payload: &[u8]) -> Result<Self, PacketError> {
        Self::build(PacketType::Data, id, payload)
    }

    /// Create an error packet. Fails if the payload does not fit in a single packet.
    pub fn error(id: RouteId, payload: &[u8]) -> Result<Self, PacketError> {
        Self::build(PacketType::Error, id, payload)
    }

    pub fn close(id: RouteId, code: CloseCode) -> Self {
        Self::build_small(PacketType::Close, id, &[code as u8])
    }

    pub fn keep_alive(id: RouteId) -> Self {
        Self::build_small(PacketType::KeepAlive, id, &[])
    }

    /// Create a handshake packet, announcing if this side supports encrypting the route.
    pub fn handshake(id: RouteId, supports_encryption: bool) -> Self {
        Self::build_small(PacketType::Handshake, id, &[supports_encryption as u8])
    }

    /// Create a network probe. `timestamp` is in milliseconds since the unix epoch, `throughput`
    /// is the rate at which the sender currently receives data on the route, in bytes per second.
    pub fn ping(id: RouteId, timestamp: u64, throughput: u64) -> Self {
        let mut payload = [0; 16];
        payload[..8].copy_from_slice(&timestamp.to_be_bytes());
        payload[8..].copy_from_slice(&throughput.to_be_bytes());
        Self::build_small(PacketType::Ping, id, &payload)
    }

    /// Create a reply to a network probe, echoing the probe's timestamp.
    pub fn pong(id: RouteId, timestamp: u64) -> Self {
        Self::build_small(PacketType::Pong, id, &timestamp.to_be_bytes())
    }

    /// Parse and validate a packet from its binary form.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, PacketError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::TooShort(bytes.len()));
        }
        PacketType::try_from(bytes[TYPE_OFFSET])?;
        let declared = u16::from_be_bytes([bytes[SIZE_OFFSET], bytes[SIZE_OFFSET + 1]]) as usize;
        let actual = bytes.len() - PACKET_HEADER_SIZE;
        if declared != actual {
            return Err(PacketError::SizeMismatch { declared, actual });
        }
        Ok(Packet(bytes))
    }

    #[inline]
    pub fn packet_type(&self) -> PacketType {
        // Validated when the packet was created.
        PacketType::try_from(self.0[TYPE_OFFSET]).unwrap_or(PacketType::Error)
    }

    #[inline]
    pub fn route_id(&self) -> RouteId {
        let mut id = &self.0[ROUTE_ID_OFFSET..SIZE_OFFSET];
        RouteId::new(id.get_u32())
    }

    /// Size of the payload.
    #[inline]
    pub fn size(&self) -> u16 {
        (self.0.len() - PACKET_HEADER_SIZE) as u16
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.0[PACKET_HEADER_SIZE..]
    }

    /// The payload as a shared buffer, without copying.
    pub fn payload_bytes(&self) -> Bytes {
        self.0.slice(PACKET_HEADER_SIZE..)
    }

    /// The close code of a close packet.
    pub fn close_code(&self) -> Result<CloseCode, PacketError> {
        match (self.packet_type(), self.payload()) {
            (PacketType::Close, [code]) => CloseCode::try_from(*code),
            (pt, _) => Err(PacketError::MalformedPayload(pt)),
        }
    }

    /// The `(timestamp, throughput)` pair of a ping packet.
    pub fn ping_payload(&self) -> Result<(u64, u64), PacketError> {
        let mut payload = self.payload();
        if self.packet_type() != PacketType::Ping || payload.len() != 16 {
            return Err(PacketError::MalformedPayload(self.packet_type()));
        }
        Ok((payload.get_u64(), payload.get_u64()))
    }

    /// The echoed timestamp of a pong packet.
    pub fn pong_timestamp(&self) -> Result<u64, PacketError> {
        let mut payload = self.payload();
        if self.packet_type() != PacketType::Pong || payload.len() != 8 {
            return Err(PacketError::MalformedPayload(self.packet_type()));
        }
        Ok(payload.get_u64())
    }

    /// Copy of this packet addressed to a different route id. Used when relaying a packet to the
    /// next hop.
    pub fn with_route_id(&self, id: RouteId) -> Self {
        let mut buf = BytesMut::from(&self.0[..]);
        buf[ROUTE_ID_OFFSET..SIZE_OFFSET].copy_from_slice(&id.as_u32().to_be_bytes());
        Packet(buf.freeze())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.packet_type())
            .field("route_id", &self.route_id())
            .field("size", &self.size())
            .finish()
    }
}

/// Codec to frame packets on a byte stream.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl PacketCodec {
    pub fn new() -> Self {
        PacketCodec
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let size = u16::from_be_bytes([src[SIZE_OFFSET], src[SIZE_OFFSET + 1]]) as usize;
        let total = PACKET_HEADER_SIZE + size;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total).freeze();
        Packet::from_bytes(frame)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}
