use crate::error::{MqttError, Result};
use crate::packet::{skip_properties, FixedHeader, MqttPacket, PacketType, ProtocolVersion};
use bytes::{Buf, BufMut};

/// MQTT PUBACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAckPacket {
    pub packet_id: u16,
    /// 5.0 reason code; always zero under 3.1.1
    pub reason_code: u8,
}

impl PubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: 0,
        }
    }

    /// Brokers may acknowledge with 0x10 (no matching subscribers); only
    /// codes of 0x80 and above are failures.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reason_code < 0x80
    }
}

impl MqttPacket for PubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::PubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        buf.put_u16(self.packet_id);
        // The short form (packet id only) means success under 5.0 as well
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
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "PUBACK missing packet identifier".to_string(),
            ));
        }
        let packet_id = buf.get_u16();

        let reason_code = if version.has_properties() && buf.has_remaining() {
            let code = buf.get_u8();
            skip_properties(buf, version)?;
            code
        } else {
            0
        };

        Ok(Self {
            packet_id,
            reason_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_puback_short_form() {
        let mut buf = BytesMut::new();
        PubAckPacket::new(0x1234)
            .encode(&mut buf, ProtocolVersion::V5)
            .unwrap();
        assert_eq!(&buf[..], &[0x40, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn test_puback_v5_reason_code() {
        let packet = PubAckPacket {
            packet_id: 9,
            reason_code: 0x87,
        };
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V5).unwrap();

        let header = FixedHeader::decode(&mut buf).unwrap();
        let decoded = PubAckPacket::decode_body(&mut buf, &header, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded, packet);
        assert!(!decoded.is_success());
    }

    #[test]
    fn test_puback_no_matching_subscribers_is_success() {
        let mut buf = &[0x00, 0x05, 0x10, 0x00][..];
        let header = FixedHeader::new(PacketType::PubAck, 0, 4);
        let decoded = PubAckPacket::decode_body(&mut buf, &header, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded.packet_id, 5);
        assert!(decoded.is_success());
    }
}
