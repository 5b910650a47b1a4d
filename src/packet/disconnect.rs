use crate::error::Result;
use crate::packet::{skip_properties, FixedHeader, MqttPacket, PacketType, ProtocolVersion};
use bytes::{Buf, BufMut};

/// MQTT DISCONNECT packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisconnectPacket {
    /// 5.0 reason code; zero is a normal disconnect
    pub reason_code: u8,
}

impl DisconnectPacket {
    #[must_use]
    pub fn normal() -> Self {
        Self::default()
    }
}

impl MqttPacket for DisconnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Disconnect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if version.has_properties() && self.reason_code != 0 {
            buf.put_u8(self.reason_code);
            buf.put_u8(0);
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let reason_code = if version.has_properties() && buf.has_remaining() {
            let code = buf.get_u8();
            skip_properties(buf, version)?;
            code
        } else {
            0
        };
        Ok(Self { reason_code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_normal_disconnect_is_empty() {
        for version in [ProtocolVersion::V311, ProtocolVersion::V5] {
            let mut buf = BytesMut::new();
            DisconnectPacket::normal().encode(&mut buf, version).unwrap();
            assert_eq!(&buf[..], &[0xE0, 0x00]);
        }
    }

    #[test]
    fn test_server_disconnect_reason() {
        // 0x8B: server shutting down
        let mut buf = &[0x8B, 0x00][..];
        let header = FixedHeader::new(PacketType::Disconnect, 0, 2);
        let packet = DisconnectPacket::decode_body(&mut buf, &header, ProtocolVersion::V5).unwrap();
        assert_eq!(packet.reason_code, 0x8B);
    }
}
