use crate::encoding::{decode_binary, decode_string, encode_binary, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{
    encode_empty_properties, skip_properties, FixedHeader, MqttPacket, PacketType,
    ProtocolVersion,
};
use bytes::{Buf, BufMut};

const PROTOCOL_NAME: &str = "MQTT";

const FLAG_CLEAN_START: u8 = 0x02;
const FLAG_WILL: u8 = 0x04;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

/// MQTT CONNECT packet
///
/// Simulated devices never register a will, so only the clean session flag
/// and credentials are modeled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol_version: ProtocolVersion,
    /// Clean session (3.1.1) / clean start (5.0)
    pub clean_start: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Keep alive as declared in CONNECT: whole seconds, partial seconds rounded
/// up so a short period never turns into 0 (which disables keep alive)
#[must_use]
pub fn keep_alive_secs(keep_alive: std::time::Duration) -> u16 {
    let secs = keep_alive.as_secs() + u64::from(keep_alive.subsec_nanos() > 0);
    u16::try_from(secs).unwrap_or(u16::MAX)
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: impl Into<String>, protocol_version: ProtocolVersion) -> Self {
        Self {
            protocol_version,
            clean_start: true,
            keep_alive: 60,
            client_id: client_id.into(),
            username: None,
            password: None,
        }
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: std::time::Duration) -> Self {
        self.keep_alive = keep_alive_secs(keep_alive);
        self
    }

    #[must_use]
    pub fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<Vec<u8>>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_start {
            flags |= FLAG_CLEAN_START;
        }
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        flags
    }
}

impl MqttPacket for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, _version: ProtocolVersion) -> Result<()> {
        // The packet's own version wins; it is what the broker negotiates on.
        let version = self.protocol_version;

        encode_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(version.level());
        buf.put_u8(self.connect_flags());
        buf.put_u16(self.keep_alive);
        encode_empty_properties(buf, version);

        encode_string(buf, &self.client_id)?;
        if let Some(ref username) = self.username {
            encode_string(buf, username)?;
        }
        if let Some(ref password) = self.password {
            encode_binary(buf, password)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        _version: ProtocolVersion,
    ) -> Result<Self> {
        let name = decode_string(buf)?;
        if name != PROTOCOL_NAME {
            return Err(MqttError::ProtocolError(format!(
                "Invalid protocol name: {name}"
            )));
        }

        if buf.remaining() < 4 {
            return Err(MqttError::MalformedPacket(
                "CONNECT variable header truncated".to_string(),
            ));
        }
        let level = buf.get_u8();
        let protocol_version = ProtocolVersion::from_level(level).ok_or_else(|| {
            MqttError::ProtocolError(format!("Unsupported protocol level: {level}"))
        })?;
        let flags = buf.get_u8();
        let keep_alive = buf.get_u16();

        if flags & 0x01 != 0 {
            return Err(MqttError::MalformedPacket(
                "Reserved CONNECT flag is set".to_string(),
            ));
        }
        if flags & FLAG_WILL != 0 {
            return Err(MqttError::ProtocolError(
                "Will messages are not supported".to_string(),
            ));
        }
        if flags & FLAG_PASSWORD != 0 && flags & FLAG_USERNAME == 0 {
            return Err(MqttError::MalformedPacket(
                "Password flag set without username".to_string(),
            ));
        }

        skip_properties(buf, protocol_version)?;
        let client_id = decode_string(buf)?;
        let username = if flags & FLAG_USERNAME != 0 {
            Some(decode_string(buf)?)
        } else {
            None
        };
        let password = if flags & FLAG_PASSWORD != 0 {
            Some(decode_binary(buf)?.to_vec())
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            clean_start: flags & FLAG_CLEAN_START != 0,
            keep_alive,
            client_id,
            username,
            password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::time::Duration;

    fn decode(buf: &mut BytesMut) -> ConnectPacket {
        let header = FixedHeader::decode(buf).unwrap();
        assert_eq!(header.packet_type, PacketType::Connect);
        ConnectPacket::decode_body(buf, &header, ProtocolVersion::V5).unwrap()
    }

    #[test]
    fn test_connect_v5_layout() {
        let packet = ConnectPacket::new("air-quality", ProtocolVersion::V5)
            .with_keep_alive(Duration::from_secs(30));
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V5).unwrap();

        // fixed header, "MQTT", level 5, clean start, keep alive 30, empty properties
        assert_eq!(
            &buf[..13],
            &[0x10, 0x18, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x1E, 0x00]
        );
        assert_eq!(decode(&mut buf), packet);
    }

    #[test]
    fn test_connect_v311_has_no_properties() {
        let packet = ConnectPacket::new("lamp-1", ProtocolVersion::V311);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V311).unwrap();

        assert_eq!(buf[8], 4);
        // client id length prefix follows the keep alive directly
        assert_eq!(&buf[12..14], &[0x00, 0x06]);
        assert_eq!(decode(&mut buf), packet);
    }

    #[test]
    fn test_connect_with_credentials() {
        let packet = ConnectPacket::new("sim", ProtocolVersion::V5)
            .with_clean_start(false)
            .with_credentials("device", Some(b"secret".to_vec()));
        assert_eq!(packet.connect_flags(), FLAG_USERNAME | FLAG_PASSWORD);

        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V5).unwrap();
        let decoded = decode(&mut buf);
        assert_eq!(decoded.username.as_deref(), Some("device"));
        assert_eq!(decoded.password.as_deref(), Some(&b"secret"[..]));
        assert!(!decoded.clean_start);
    }

    #[test]
    fn test_connect_invalid_protocol_version() {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, "MQTT").unwrap();
        buf.put_u8(99);
        buf.put_u8(0x02);
        buf.put_u16(60);
        let header = FixedHeader::new(PacketType::Connect, 0, 0);
        assert!(ConnectPacket::decode_body(&mut buf, &header, ProtocolVersion::V5).is_err());
    }

    #[test]
    fn test_keep_alive_rounds_partial_seconds_up() {
        assert_eq!(keep_alive_secs(Duration::from_millis(500)), 1);
        assert_eq!(keep_alive_secs(Duration::from_millis(1500)), 2);
        assert_eq!(keep_alive_secs(Duration::from_secs(30)), 30);
        assert_eq!(keep_alive_secs(Duration::ZERO), 0);
        let packet = ConnectPacket::new("c", ProtocolVersion::V5)
            .with_keep_alive(Duration::from_millis(500));
        assert_eq!(packet.keep_alive, 1);
    }

    #[test]
    fn test_keep_alive_saturates() {
        let packet = ConnectPacket::new("sim", ProtocolVersion::V5)
            .with_keep_alive(Duration::from_secs(1_000_000));
        assert_eq!(packet.keep_alive, u16::MAX);
    }
}
