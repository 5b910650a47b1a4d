//! Packet I/O over split transport halves
//!
//! CRITICAL: NO EVENT LOOPS
//! These are direct async methods for reading and writing MQTT packets.

use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, Packet, ProtocolVersion};
use bytes::{BufMut, BytesMut};
use std::future::Future;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest packet accepted from the broker. A publish-only client only
/// receives small control packets, so anything bigger is a framing error.
pub const MAX_INBOUND_PACKET: u32 = 64 * 1024;

fn closed_or_io(err: std::io::Error) -> MqttError {
    if err.kind() == ErrorKind::UnexpectedEof {
        MqttError::ConnectionError("Connection closed".to_string())
    } else {
        MqttError::from(err)
    }
}

/// Reads whole MQTT packets from any async byte source
pub trait PacketReader: AsyncRead + Unpin + Send {
    /// Read a complete MQTT packet
    ///
    /// # Errors
    ///
    /// Returns an error if the stream closes or the packet is malformed
    fn read_packet(
        &mut self,
        version: ProtocolVersion,
    ) -> impl Future<Output = Result<Packet>> + Send + '_ {
        async move {
            let mut header_buf = BytesMut::with_capacity(5);

            let first = self.read_u8().await.map_err(closed_or_io)?;
            header_buf.put_u8(first);

            // Remaining length: at most four bytes, continuation bit 0x80
            loop {
                let byte = self.read_u8().await.map_err(closed_or_io)?;
                header_buf.put_u8(byte);
                if byte & 0x80 == 0 {
                    break;
                }
                if header_buf.len() > 4 {
                    return Err(MqttError::MalformedPacket(
                        "Invalid remaining length encoding".to_string(),
                    ));
                }
            }

            let fixed_header = FixedHeader::decode(&mut header_buf)?;
            if fixed_header.remaining_length > MAX_INBOUND_PACKET {
                return Err(MqttError::MalformedPacket(format!(
                    "Inbound {:?} of {} bytes exceeds limit",
                    fixed_header.packet_type, fixed_header.remaining_length
                )));
            }

            let mut body = vec![0u8; fixed_header.remaining_length as usize];
            self.read_exact(&mut body).await.map_err(closed_or_io)?;

            let mut body = &body[..];
            let packet = Packet::decode_from_body(&fixed_header, &mut body, version)?;
            tracing::trace!(packet_type = ?fixed_header.packet_type, "Packet received");
            Ok(packet)
        }
    }
}

impl<T: AsyncRead + Unpin + Send + ?Sized> PacketReader for T {}

/// Writes whole MQTT packets to any async byte sink
pub trait PacketWriter: AsyncWrite + Unpin + Send {
    /// Encode and write a packet, flushing afterwards
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails
    fn write_packet<'a>(
        &'a mut self,
        packet: &'a Packet,
        version: ProtocolVersion,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        async move {
            let mut buf = BytesMut::new();
            packet.encode(&mut buf, version)?;
            self.write_all(&buf).await?;
            self.flush().await?;
            tracing::trace!(packet_type = ?packet.packet_type(), len = buf.len(), "Packet sent");
            Ok(())
        }
    }
}

impl<T: AsyncWrite + Unpin + Send + ?Sized> PacketWriter for T {}
