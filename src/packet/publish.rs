use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{
    encode_empty_properties, skip_properties, FixedHeader, MqttPacket, PacketType,
    ProtocolVersion,
};
use crate::QoS;
use bytes::{Buf, BufMut, Bytes};

const FLAG_RETAIN: u8 = 0x01;
const FLAG_DUP: u8 = 0x08;

/// MQTT PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic_name: String,
    /// Packet identifier (required for `QoS` > 0)
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Set on retransmissions of a `QoS` 1 message
    pub dup: bool,
}

impl PublishPacket {
    #[must_use]
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic_name: topic_name.into(),
            packet_id: None,
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
        }
    }

    /// Sets the packet identifier; ignored for `QoS` 0
    #[must_use]
    pub fn with_packet_id(mut self, id: u16) -> Self {
        if self.qos != QoS::AtMostOnce {
            self.packet_id = Some(id);
        }
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }
}

impl MqttPacket for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn flags(&self) -> u8 {
        let mut flags = u8::from(self.qos) << 1;
        if self.dup {
            flags |= FLAG_DUP;
        }
        if self.retain {
            flags |= FLAG_RETAIN;
        }
        flags
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        encode_string(buf, &self.topic_name)?;

        if self.qos != QoS::AtMostOnce {
            let packet_id = self.packet_id.ok_or_else(|| {
                MqttError::MalformedPacket("Packet ID required for QoS > 0".to_string())
            })?;
            buf.put_u16(packet_id);
        }

        encode_empty_properties(buf, version);
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let qos = QoS::from_u8((fixed_header.flags >> 1) & 0x03)?;
        let dup = fixed_header.flags & FLAG_DUP != 0;
        let retain = fixed_header.flags & FLAG_RETAIN != 0;

        let topic_name = decode_string(buf)?;

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            if buf.remaining() < 2 {
                return Err(MqttError::MalformedPacket(
                    "Missing packet identifier".to_string(),
                ));
            }
            Some(buf.get_u16())
        };

        skip_properties(buf, version)?;
        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            topic_name,
            packet_id,
            payload,
            qos,
            retain,
            dup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn decode(buf: &mut BytesMut, version: ProtocolVersion) -> PublishPacket {
        let header = FixedHeader::decode(buf).unwrap();
        PublishPacket::decode_body(buf, &header, version).unwrap()
    }

    #[test]
    fn test_publish_qos0_v311_bytes() {
        let packet = PublishPacket::new("a/b", &b"{}"[..], QoS::AtMostOnce);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V311).unwrap();
        assert_eq!(
            &buf[..],
            &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'{', b'}']
        );
    }

    #[test]
    fn test_publish_qos1_flags() {
        let packet = PublishPacket::new("sensors/air_quality", &b"{\"alert\":true}"[..], QoS::AtLeastOnce)
            .with_packet_id(42)
            .with_retain(true)
            .with_dup(true);
        assert_eq!(packet.flags(), 0x0B);

        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V5).unwrap();
        assert_eq!(buf[0], 0x3B);
        assert_eq!(decode(&mut buf, ProtocolVersion::V5), packet);
    }

    #[test]
    fn test_publish_qos1_requires_packet_id() {
        let packet = PublishPacket::new("t", &b"x"[..], QoS::AtLeastOnce);
        let mut buf = BytesMut::new();
        assert!(packet.encode(&mut buf, ProtocolVersion::V5).is_err());
    }

    #[test]
    fn test_packet_id_ignored_for_qos0() {
        let packet = PublishPacket::new("t", &b"x"[..], QoS::AtMostOnce).with_packet_id(7);
        assert_eq!(packet.packet_id, None);
    }

    #[test]
    fn test_publish_qos2_rejected() {
        let header = FixedHeader::new(PacketType::Publish, 0x04, 5);
        let mut buf = &[0x00, 0x01, b't', 0x00, 0x01][..];
        assert!(matches!(
            PublishPacket::decode_body(&mut buf, &header, ProtocolVersion::V311),
            Err(MqttError::InvalidQoS(2))
        ));
    }
}
