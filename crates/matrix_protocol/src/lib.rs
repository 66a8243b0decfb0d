//! Binary intranet protocol for Event Matrix.
//!
//! Wire format for Gateway <-> Worker and Worker <-> Worker RPC.
//!
//! # Frame layout
//!
//! Every message is `Header (8 bytes) || Body`, Network Byte Order:
//! ```text
//! [LEN:4][COMPRESS:1][VER:1][CRC16:2]
//! ```
//!
//! - LEN (u32): body length in bytes
//! - COMPRESS (u8): 0x00 plain, 0x01 snappy-compressed body
//! - VER (u8): protocol version (0x01)
//! - CRC16 (u16): CRC-16/CCITT (poly 0x1021, init 0xFFFF) over bytes [0..6)
//!
//! The CRC covers the header prefix only; body integrity relies on TCP plus
//! the length bound. Receivers must not checksum the body.

pub mod config;
pub mod defaults;
pub mod envelope;
pub mod error;
pub mod event_type;
pub mod packet;
pub mod response;
pub mod types;

pub use config::{WorkMode, WorkerServerConfig};
pub use envelope::{Envelope, SecretAlgorithm};
pub use error::{ProtocolError, Result};
pub use event_type::EventType;
pub use packet::{PayloadType, RequestPacket, ResponsePacket};
pub use response::{EventResponse, ResponseCode};
pub use types::{
    AuthType, Constant, Endpoint, EndpointType, EntityAttribute, EntityEvent, Event, EventParam,
    ExecutorType, FieldType, SharedConfigure, Task, TaskStatus, Worker, WorkerMode,
};

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_16_IBM_3740};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 8;

/// Maximum accepted body size (1 MiB)
pub const MAX_BODY_SIZE: u32 = 1024 * 1024;

/// Packets older than this are rejected as expired.
pub const MAX_PACKET_AGE_MS: i64 = 5_000;

/// CRC-16/CCITT with init 0xFFFF (aka CRC-16/IBM-3740).
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub body_len: u32,
    pub compressed: bool,
    pub version: u8,
}

impl Header {
    /// Create a header for a body of `body_len` bytes.
    pub fn new(body_len: u32, compressed: bool) -> Self {
        Self {
            body_len,
            compressed,
            version: PROTOCOL_VERSION,
        }
    }

    /// Pack header into an 8-byte buffer.
    pub fn pack(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        BigEndian::write_u32(&mut buf[0..4], self.body_len);
        buf[4] = self.compressed as u8;
        buf[5] = self.version;
        let crc = CRC16.checksum(&buf[0..6]);
        BigEndian::write_u16(&mut buf[6..8], crc);
        buf
    }

    /// Unpack and validate a header from an 8-byte buffer.
    ///
    /// Rejects oversized bodies, unknown compression flags, version
    /// mismatches and checksum failures. Callers answer any of these with
    /// the static invalid-header response and close the connection.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let expected_crc = CRC16.checksum(&data[0..6]);
        if BigEndian::read_u16(&data[6..8]) != expected_crc {
            return Err(ProtocolError::CrcMismatch);
        }

        let body_len = BigEndian::read_u32(&data[0..4]);
        if body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLarge(body_len));
        }

        let compressed = match data[4] {
            0x00 => false,
            0x01 => true,
            other => return Err(ProtocolError::UnknownCompression(other)),
        };

        let version = data[5];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        Ok(Self {
            body_len,
            compressed,
            version,
        })
    }
}

/// Current wall clock in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_pack_unpack() {
        let header = Header::new(1024, true);
        let packed = header.pack();

        assert_eq!(packed.len(), HEADER_SIZE);

        let unpacked = Header::unpack(&packed).unwrap();
        assert_eq!(unpacked.body_len, 1024);
        assert!(unpacked.compressed);
        assert_eq!(unpacked.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_header_bit_flip_detected() {
        let packed = Header::new(512, false).pack();

        // Flipping any bit of the covered prefix must fail the checksum;
        // flipping checksum bits must fail as well.
        for byte in 0..HEADER_SIZE {
            for bit in 0..8 {
                let mut corrupted = packed;
                corrupted[byte] ^= 1 << bit;
                assert!(
                    Header::unpack(&corrupted).is_err(),
                    "bit {} of byte {} slipped through",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn test_header_rejects_oversized_body() {
        let header = Header::new(MAX_BODY_SIZE + 1, false);
        let result = Header::unpack(&header.pack());
        assert!(matches!(result, Err(ProtocolError::BodyTooLarge(_))));
    }

    #[test]
    fn test_header_rejects_unknown_compression() {
        let mut buf = [0u8; HEADER_SIZE];
        BigEndian::write_u32(&mut buf[0..4], 16);
        buf[4] = 0x02;
        buf[5] = PROTOCOL_VERSION;
        let crc = CRC16.checksum(&buf[0..6]);
        BigEndian::write_u16(&mut buf[6..8], crc);

        let result = Header::unpack(&buf);
        assert!(matches!(result, Err(ProtocolError::UnknownCompression(0x02))));
    }

    #[test]
    fn test_header_rejects_version_mismatch() {
        let mut buf = [0u8; HEADER_SIZE];
        BigEndian::write_u32(&mut buf[0..4], 16);
        buf[5] = 0x7f;
        let crc = CRC16.checksum(&buf[0..6]);
        BigEndian::write_u16(&mut buf[6..8], crc);

        let result = Header::unpack(&buf);
        assert!(matches!(
            result,
            Err(ProtocolError::VersionMismatch { got: 0x7f, .. })
        ));
    }

    #[test]
    fn test_header_too_short() {
        let result = Header::unpack(&[0u8; 4]);
        assert!(matches!(result, Err(ProtocolError::HeaderTooShort { .. })));
    }
}
