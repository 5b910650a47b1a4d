pub mod connack;
pub mod connect;
pub mod disconnect;
pub mod puback;
pub mod publish;

use crate::encoding::{decode_variable_int, encode_variable_int, variable_int_len};
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};
use serde::Serialize;

pub use connack::ConnAckPacket;
pub use connect::ConnectPacket;
pub use disconnect::DisconnectPacket;
pub use puback::PubAckPacket;
pub use publish::PublishPacket;

/// Protocol revision spoken on the wire
///
/// The only difference this crate cares about is the property block that
/// 5.0 adds to most packets. This client never sends properties, so it writes
/// an empty block under 5.0 and skips whatever the broker sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1 (protocol level 4)
    V311,
    /// MQTT 5.0 (protocol level 5)
    #[default]
    V5,
}

impl ProtocolVersion {
    /// Protocol level byte carried in CONNECT
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            ProtocolVersion::V311 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    #[must_use]
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            4 => Some(ProtocolVersion::V311),
            5 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }

    #[must_use]
    pub fn has_properties(self) -> bool {
        self == ProtocolVersion::V5
    }
}

/// Writes an empty property block (a single zero length byte) under 5.0
pub(crate) fn encode_empty_properties<B: BufMut>(buf: &mut B, version: ProtocolVersion) {
    if version.has_properties() {
        buf.put_u8(0);
    }
}

/// Skips a property block under 5.0; properties are never inspected
pub(crate) fn skip_properties<B: Buf>(buf: &mut B, version: ProtocolVersion) -> Result<()> {
    if !version.has_properties() || !buf.has_remaining() {
        return Ok(());
    }
    let len = decode_variable_int(buf)? as usize;
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "Property length {len} exceeds remaining {}",
            buf.remaining()
        )));
    }
    buf.advance(len);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    /// Converts a u8 to `PacketType`
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        use PacketType::{
            Auth, ConnAck, Connect, Disconnect, PingReq, PingResp, PubAck, PubComp, PubRec, PubRel,
            Publish, SubAck, Subscribe, UnsubAck, Unsubscribe,
        };
        const TYPES: [PacketType; 15] = [
            Connect, ConnAck, Publish, PubAck, PubRec, PubRel, PubComp, Subscribe, SubAck,
            Unsubscribe, UnsubAck, PingReq, PingResp, Disconnect, Auth,
        ];
        (1..=15)
            .contains(&value)
            .then(|| TYPES[usize::from(value) - 1])
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

/// MQTT packet fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: u32) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    /// Encodes the fixed header
    ///
    /// # Errors
    ///
    /// Returns an error if the remaining length is too large
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8((u8::from(self.packet_type) << 4) | (self.flags & 0x0F));
        encode_variable_int(buf, self.remaining_length)
    }

    /// Decodes a fixed header from the buffer
    ///
    /// # Errors
    ///
    /// Returns an error on short input, an unknown packet type or a bad
    /// remaining length encoding
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "No data for fixed header".to_string(),
            ));
        }

        let byte1 = buf.get_u8();
        let type_bits = byte1 >> 4;
        let packet_type =
            PacketType::from_u8(type_bits).ok_or(MqttError::InvalidPacketType(type_bits))?;
        let remaining_length = decode_variable_int(buf)?;

        Ok(Self {
            packet_type,
            flags: byte1 & 0x0F,
            remaining_length,
        })
    }

    /// Validates the reserved flag bits for the packet type
    #[must_use]
    pub fn validate_flags(&self) -> bool {
        match self.packet_type {
            PacketType::Publish => true,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => {
                self.flags == 0x02
            }
            _ => self.flags == 0,
        }
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + variable_int_len(self.remaining_length)
    }
}

/// The packets a telemetry publisher exchanges with a broker
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Box<ConnectPacket>),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(PubAckPacket),
    PingReq,
    PingResp,
    Disconnect(DisconnectPacket),
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect(_) => PacketType::Disconnect,
        }
    }

    /// Encodes the complete packet, fixed header included
    ///
    /// # Errors
    ///
    /// Returns an error if any field cannot be encoded
    pub fn encode<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        match self {
            Packet::Connect(p) => p.encode(buf, version),
            Packet::ConnAck(p) => p.encode(buf, version),
            Packet::Publish(p) => p.encode(buf, version),
            Packet::PubAck(p) => p.encode(buf, version),
            Packet::Disconnect(p) => p.encode(buf, version),
            Packet::PingReq | Packet::PingResp => {
                FixedHeader::new(self.packet_type(), 0, 0).encode(buf)
            }
        }
    }

    /// Decodes a packet body that follows `fixed_header`
    ///
    /// # Errors
    ///
    /// Returns an error if the body is malformed or the packet type is one a
    /// publish-only client never expects
    pub fn decode_from_body<B: Buf>(
        fixed_header: &FixedHeader,
        buf: &mut B,
        version: ProtocolVersion,
    ) -> Result<Self> {
        if !fixed_header.validate_flags() {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid flags {:#04x} for {:?}",
                fixed_header.flags, fixed_header.packet_type
            )));
        }

        match fixed_header.packet_type {
            PacketType::Connect => Ok(Packet::Connect(Box::new(ConnectPacket::decode_body(
                buf,
                fixed_header,
                version,
            )?))),
            PacketType::ConnAck => Ok(Packet::ConnAck(ConnAckPacket::decode_body(
                buf,
                fixed_header,
                version,
            )?)),
            PacketType::Publish => Ok(Packet::Publish(PublishPacket::decode_body(
                buf,
                fixed_header,
                version,
            )?)),
            PacketType::PubAck => Ok(Packet::PubAck(PubAckPacket::decode_body(
                buf,
                fixed_header,
                version,
            )?)),
            PacketType::PingReq => Ok(Packet::PingReq),
            PacketType::PingResp => Ok(Packet::PingResp),
            PacketType::Disconnect => Ok(Packet::Disconnect(DisconnectPacket::decode_body(
                buf,
                fixed_header,
                version,
            )?)),
            other => Err(MqttError::ProtocolError(format!(
                "Unexpected {other:?} packet"
            ))),
        }
    }
}

/// Trait for MQTT packets
pub trait MqttPacket: Sized {
    fn packet_type(&self) -> PacketType;

    /// Returns the fixed header flags
    fn flags(&self) -> u8 {
        0
    }

    /// Encodes the packet body (without fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails
    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()>;

    /// Decodes the packet body (without fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails
    fn decode_body<B: Buf>(
        buf: &mut B,
        fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self>;

    /// Encodes the complete packet (with fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails
    fn encode<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        let mut body = Vec::new();
        self.encode_body(&mut body, version)?;

        let remaining_length = u32::try_from(body.len())
            .map_err(|_| MqttError::ProtocolError("Packet body too large".to_string()))?;
        FixedHeader::new(self.packet_type(), self.flags(), remaining_length).encode(buf)?;
        buf.put_slice(&body);
        Ok(())
    }
}
