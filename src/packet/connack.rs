use crate::error::{MqttError, Result};
use crate::packet::{
    encode_empty_properties, skip_properties, FixedHeader, MqttPacket, PacketType,
    ProtocolVersion,
};
use bytes::{Buf, BufMut};

/// MQTT CONNACK packet
///
/// `return_code` holds the 3.1.1 return code or the 5.0 reason code; zero
/// means accepted in both revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: u8,
}

impl ConnAckPacket {
    #[must_use]
    pub fn new(session_present: bool, return_code: u8) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    #[must_use]
    pub fn accepted() -> Self {
        Self::new(false, 0)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.return_code == 0
    }
}

/// Human readable meaning of a CONNACK code, for either protocol revision
#[must_use]
pub fn describe_return_code(code: u8) -> &'static str {
    match code {
        0x00 => "accepted",
        0x01 => "unacceptable protocol version",
        0x02 => "identifier rejected",
        0x03 => "server unavailable",
        0x04 => "bad user name or password",
        0x05 => "not authorized",
        0x80 => "unspecified error",
        0x81 => "malformed packet",
        0x82 => "protocol error",
        0x84 => "unsupported protocol version",
        0x85 => "client identifier not valid",
        0x86 => "bad user name or password",
        0x87 => "not authorized",
        0x88 => "server unavailable",
        0x89 => "server busy",
        0x8A => "banned",
        0x8C => "bad authentication method",
        0x97 => "quota exceeded",
        0x9F => "connection rate exceeded",
        _ => "unknown reason",
    }
}

impl MqttPacket for ConnAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        buf.put_u8(u8::from(self.session_present));
        buf.put_u8(self.return_code);
        encode_empty_properties(buf, version);
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "CONNACK shorter than 2 bytes".to_string(),
            ));
        }
        let ack_flags = buf.get_u8();
        if ack_flags & 0xFE != 0 {
            return Err(MqttError::MalformedPacket(
                "Reserved CONNACK flags are set".to_string(),
            ));
        }
        let return_code = buf.get_u8();
        skip_properties(buf, version)?;

        Ok(Self {
            session_present: ack_flags & 0x01 != 0,
            return_code,
        })
    }
}
