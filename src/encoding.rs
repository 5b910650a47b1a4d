//! Primitive MQTT data encodings: variable byte integers, length-prefixed
//! UTF-8 strings and length-prefixed binary data.

use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, Bytes};

/// Maximum value that can be encoded as a variable byte integer (268,435,455)
pub const VARIABLE_INT_MAX: u32 = 268_435_455;

/// Maximum length of a length-prefixed string or binary field
pub const MAX_FIELD_LENGTH: usize = u16::MAX as usize;

/// Encodes a variable byte integer (1 to 4 bytes, 7 bits per byte)
///
/// # Errors
///
/// Returns `MqttError::ProtocolError` if the value exceeds [`VARIABLE_INT_MAX`]
pub fn encode_variable_int<B: BufMut>(buf: &mut B, value: u32) -> Result<()> {
    if value > VARIABLE_INT_MAX {
        return Err(MqttError::ProtocolError(format!(
            "Variable integer value {value} exceeds maximum {VARIABLE_INT_MAX}"
        )));
    }

    let mut val = value;
    loop {
        // Truncation intended: only the low seven bits are kept
        #[allow(clippy::cast_possible_truncation)]
        let mut byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if val == 0 {
            return Ok(());
        }
    }
}

/// Decodes a variable byte integer
///
/// # Errors
///
/// Returns `MqttError::MalformedPacket` if the buffer runs out or more than
/// four bytes carry the continuation bit
pub fn decode_variable_int<B: Buf>(buf: &mut B) -> Result<u32> {
    let mut value = 0u32;
    let mut shift = 0;

    for _ in 0..4 {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Insufficient bytes for variable integer".to_string(),
            ));
        }
        let byte = buf.get_u8();
        value |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }

    Err(MqttError::MalformedPacket(
        "Variable integer exceeds 4 bytes".to_string(),
    ))
}

/// Number of bytes [`encode_variable_int`] writes for `value`
#[must_use]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Encodes a UTF-8 string with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if the string contains a NUL character or is longer than
/// 65,535 bytes
pub fn encode_string<B: BufMut>(buf: &mut B, string: &str) -> Result<()> {
    if string.contains('\0') {
        return Err(MqttError::MalformedPacket(
            "String contains null character".to_string(),
        ));
    }
    encode_binary(buf, string.as_bytes())
}

/// Decodes a UTF-8 string with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error on short input, invalid UTF-8 or an embedded NUL
pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    let raw = decode_binary(buf)?;
    let string = String::from_utf8(raw.to_vec())
        .map_err(|e| MqttError::MalformedPacket(format!("Invalid UTF-8: {e}")))?;

    if string.contains('\0') {
        return Err(MqttError::MalformedPacket(
            "String contains null character".to_string(),
        ));
    }
    Ok(string)
}

/// Encodes binary data with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if the data is longer than 65,535 bytes
pub fn encode_binary<B: BufMut>(buf: &mut B, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| {
        MqttError::MalformedPacket(format!(
            "Field length {} exceeds maximum {MAX_FIELD_LENGTH}",
            data.len()
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Decodes binary data with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if the buffer holds fewer bytes than the prefix announces
pub fn decode_binary<B: Buf>(buf: &mut B) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "Insufficient bytes for length prefix".to_string(),
        ));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "Insufficient bytes for field data: expected {len}, got {}",
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}
