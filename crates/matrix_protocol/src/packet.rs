//! Length-prefixed request/response packets carried in frame bodies.
//!
//! A packet body is `N` big-endian u32 field lengths followed by the field
//! bytes, concatenated in declaration order. Requests carry six fields,
//! responses four. Bodies may be snappy-compressed as flagged in the frame
//! header; compression always applies to the encoded packet, never the other
//! way around.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ProtocolError, Result};
use crate::{now_millis, Header, MAX_PACKET_AGE_MS};

/// Payload kind carried by a request, doubling as the response content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    Ping = 0,
    Json = 1,
    Text = 2,
}

impl PayloadType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PayloadType::Ping),
            1 => Ok(PayloadType::Json),
            2 => Ok(PayloadType::Text),
            other => Err(ProtocolError::InvalidPayloadType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Intranet request packet.
///
/// `x_data` carries the intranet event type for routing; `payload` is the
/// (usually encrypted) application body and therefore raw bytes.
/// `call_chain` is the comma-joined list of event labels accumulated across
/// nested calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    pub payload_type: PayloadType,
    pub x_data: String,
    pub payload: Vec<u8>,
    pub source_ip: String,
    pub call_chain: String,
    pub timestamp: i64,
}

impl RequestPacket {
    pub fn new(payload_type: PayloadType, x_data: impl Into<String>) -> Self {
        Self {
            payload_type,
            x_data: x_data.into(),
            payload: Vec::new(),
            source_ip: String::new(),
            call_chain: String::new(),
            timestamp: 0,
        }
    }

    /// A bare keep-alive probe.
    pub fn ping() -> Self {
        Self::new(PayloadType::Ping, "")
    }

    /// Pack into a full frame (`header || body`), stamping the send time.
    ///
    /// The timestamp is refreshed here so that receivers can enforce
    /// freshness; callers never set it by hand.
    pub fn pack(&mut self, compress: bool) -> Vec<u8> {
        self.timestamp = now_millis();
        frame_body(self.encode(), compress)
    }

    fn encode(&self) -> Vec<u8> {
        let fields: [&[u8]; 6] = [
            &[self.payload_type.as_u8()],
            self.x_data.as_bytes(),
            &self.payload,
            self.source_ip.as_bytes(),
            self.call_chain.as_bytes(),
            &self.timestamp.to_be_bytes(),
        ];
        encode_fields(&fields)
    }

    /// Decode a (decompressed) body, enforcing freshness.
    pub fn unpack(body: &[u8], compressed: bool) -> Result<Self> {
        let plain = maybe_decompress(body, compressed)?;
        let fields = decode_fields::<6>(&plain)?;

        let [kind, x_data, payload, source_ip, call_chain, timestamp] = fields;
        if kind.len() != 1 {
            return Err(ProtocolError::InvalidFieldLength {
                field: "payload_type",
                len: kind.len() as u32,
            });
        }
        if timestamp.len() != 8 {
            return Err(ProtocolError::InvalidFieldLength {
                field: "timestamp",
                len: timestamp.len() as u32,
            });
        }

        let packet = Self {
            payload_type: PayloadType::from_u8(kind[0])?,
            x_data: String::from_utf8(x_data.to_vec())?,
            payload: payload.to_vec(),
            source_ip: String::from_utf8(source_ip.to_vec())?,
            call_chain: String::from_utf8(call_chain.to_vec())?,
            timestamp: BigEndian::read_i64(timestamp),
        };
        check_freshness(packet.timestamp)?;
        Ok(packet)
    }
}

/// Intranet response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    pub status_code: u32,
    pub content_type: PayloadType,
    pub payload: Vec<u8>,
    pub timestamp: i64,
}

impl ResponsePacket {
    pub fn new(status_code: u32, content_type: PayloadType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            content_type,
            payload: payload.into(),
            timestamp: 0,
        }
    }

    /// The static reply to a keep-alive probe.
    pub fn pong() -> Self {
        Self::new(200, PayloadType::Ping, "")
    }

    /// Pack into a full frame (`header || body`), stamping the send time.
    pub fn pack(&mut self, compress: bool) -> Vec<u8> {
        self.timestamp = now_millis();
        frame_body(self.encode(), compress)
    }

    fn encode(&self) -> Vec<u8> {
        let status = self.status_code.to_be_bytes();
        let fields: [&[u8]; 4] = [
            &status,
            &[self.content_type.as_u8()],
            &self.payload,
            &self.timestamp.to_be_bytes(),
        ];
        encode_fields(&fields)
    }

    pub fn unpack(body: &[u8], compressed: bool) -> Result<Self> {
        let plain = maybe_decompress(body, compressed)?;
        let fields = decode_fields::<4>(&plain)?;

        let [status, kind, payload, timestamp] = fields;
        if status.len() != 4 {
            return Err(ProtocolError::InvalidFieldLength {
                field: "status_code",
                len: status.len() as u32,
            });
        }
        if kind.len() != 1 {
            return Err(ProtocolError::InvalidFieldLength {
                field: "content_type",
                len: kind.len() as u32,
            });
        }
        if timestamp.len() != 8 {
            return Err(ProtocolError::InvalidFieldLength {
                field: "timestamp",
                len: timestamp.len() as u32,
            });
        }

        let packet = Self {
            status_code: BigEndian::read_u32(status),
            content_type: PayloadType::from_u8(kind[0])?,
            payload: payload.to_vec(),
            timestamp: BigEndian::read_i64(timestamp),
        };
        check_freshness(packet.timestamp)?;
        Ok(packet)
    }
}

fn encode_fields(fields: &[&[u8]]) -> Vec<u8> {
    let total: usize = fields.iter().map(|f| f.len()).sum();
    let mut buf = Vec::with_capacity(fields.len() * 4 + total);
    for field in fields {
        buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
    }
    for field in fields {
        buf.extend_from_slice(field);
    }
    buf
}

fn decode_fields<const N: usize>(data: &[u8]) -> Result<[&[u8]; N]> {
    let prefix = N * 4;
    if data.len() < prefix {
        return Err(ProtocolError::Truncated {
            expected: prefix,
            got: data.len(),
        });
    }

    let mut lengths = [0usize; N];
    let mut total = prefix;
    for (i, len) in lengths.iter_mut().enumerate() {
        *len = BigEndian::read_u32(&data[i * 4..i * 4 + 4]) as usize;
        total += *len;
    }
    if data.len() != total {
        return Err(ProtocolError::Truncated {
            expected: total,
            got: data.len(),
        });
    }

    let mut fields = [&data[0..0]; N];
    let mut offset = prefix;
    for (field, len) in fields.iter_mut().zip(lengths) {
        *field = &data[offset..offset + len];
        offset += len;
    }
    Ok(fields)
}

/// Optionally compress the encoded packet and prepend the frame header.
///
/// The header's compression flag always matches what was actually written:
/// a (theoretical) snappy failure falls back to sending plain.
fn frame_body(encoded: Vec<u8>, compress: bool) -> Vec<u8> {
    let (body, compressed) = if compress {
        match snap::raw::Encoder::new().compress_vec(&encoded) {
            Ok(packed) => (packed, true),
            Err(_) => (encoded, false),
        }
    } else {
        (encoded, false)
    };

    let mut frame = Vec::with_capacity(crate::HEADER_SIZE + body.len());
    frame.extend_from_slice(&Header::new(body.len() as u32, compressed).pack());
    frame.extend_from_slice(&body);
    frame
}

fn maybe_decompress(body: &[u8], compressed: bool) -> Result<Vec<u8>> {
    if compressed {
        Ok(snap::raw::Decoder::new().decompress_vec(body)?)
    } else {
        Ok(body.to_vec())
    }
}

fn check_freshness(timestamp: i64) -> Result<()> {
    let age_ms = now_millis() - timestamp;
    if age_ms > MAX_PACKET_AGE_MS {
        return Err(ProtocolError::Expired { age_ms });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HEADER_SIZE;

    fn sample_request() -> RequestPacket {
        RequestPacket {
            payload_type: PayloadType::Json,
            x_data: "1".to_string(),
            payload: br#"{"name":"alice"}"#.to_vec(),
            source_ip: "10.0.0.7".to_string(),
            call_chain: "demo.main.user_info->create@0.0.1".to_string(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_request_roundtrip() {
        for compress in [false, true] {
            let mut req = sample_request();
            let frame = req.pack(compress);

            let header = Header::unpack(&frame[..HEADER_SIZE]).unwrap();
            assert_eq!(header.compressed, compress);
            assert_eq!(header.body_len as usize, frame.len() - HEADER_SIZE);

            let decoded = RequestPacket::unpack(&frame[HEADER_SIZE..], compress).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn test_response_roundtrip() {
        for compress in [false, true] {
            let mut resp = ResponsePacket::new(200, PayloadType::Json, r#"{"code":"0"}"#);
            let frame = resp.pack(compress);

            let decoded = ResponsePacket::unpack(&frame[HEADER_SIZE..], compress).unwrap();
            assert_eq!(decoded, resp);
        }
    }

    #[test]
    fn test_ping_is_empty() {
        let mut ping = RequestPacket::ping();
        let frame = ping.pack(false);
        let decoded = RequestPacket::unpack(&frame[HEADER_SIZE..], false).unwrap();
        assert_eq!(decoded.payload_type, PayloadType::Ping);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_expired_packet_rejected() {
        let mut req = sample_request();
        let mut frame = req.pack(false);
        // Rewrite the timestamp field in place: last 8 bytes of the body.
        let len = frame.len();
        let stale = now_millis() - MAX_PACKET_AGE_MS - 1_000;
        frame[len - 8..].copy_from_slice(&stale.to_be_bytes());

        let result = RequestPacket::unpack(&frame[HEADER_SIZE..], false);
        assert!(matches!(result, Err(ProtocolError::Expired { .. })));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let mut req = sample_request();
        let frame = req.pack(false);
        let body = &frame[HEADER_SIZE..frame.len() - 3];
        assert!(matches!(
            RequestPacket::unpack(body, false),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_length_overflow_rejected() {
        let mut req = sample_request();
        let mut frame = req.pack(false);
        // Inflate the second field length so the declared total exceeds the data.
        frame[HEADER_SIZE + 4..HEADER_SIZE + 8].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(RequestPacket::unpack(&frame[HEADER_SIZE..], false).is_err());
    }
}
