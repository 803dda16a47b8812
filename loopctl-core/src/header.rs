//! Fixed-size frame header.
//!
//! ```text
//! version:  u16  (2)
//! kind:     u8   (1)
//! length:   u32  (4)
//! checksum: u32  (4)
//! ```
//!
//! All fields are little-endian. The checksum covers the payload only.

use crate::error::LoopError;
use crate::message::MessageKind;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;

/// Encoded size of [`FrameHeader`] on the wire.
pub const HEADER_SIZE: usize = 11;

pub type FrameHeaderBytes = [u8; HEADER_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    version: u16,
    kind: MessageKind,
    length: u32,
    checksum: u32,
}

impl FrameHeader {
    /// Build a header describing `payload`.
    ///
    /// Fails if the length does not fit the 32-bit length field.
    pub fn for_payload(kind: MessageKind, payload: &[u8]) -> Result<Self, LoopError> {
        Ok(Self {
            version: PROTOCOL_VERSION,
            kind,
            length: wire_length(payload.len())?,
            checksum: checksum(payload),
        })
    }

    pub fn to_bytes(&self) -> FrameHeaderBytes {
        let mut buf: FrameHeaderBytes = [0; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.version.to_le_bytes());
        buf[2] = self.kind as u8;
        buf[3..7].copy_from_slice(&self.length.to_le_bytes());
        buf[7..11].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Parse a header, rejecting versions this build does not know.
    pub fn from_bytes(bytes: &FrameHeaderBytes) -> Result<Self, LoopError> {
        let version = u16::from_le_bytes([bytes[0], bytes[1]]);
        if version != PROTOCOL_VERSION {
            return Err(LoopError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            kind: MessageKind::try_from(bytes[2])?,
            length: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
            checksum: u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]),
        })
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload_length(&self) -> usize {
        self.length as usize
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Returns `true` if `payload` hashes to this header's checksum.
    pub fn verify(&self, payload: &[u8]) -> bool {
        payload.len() == self.payload_length() && checksum(payload) == self.checksum
    }
}

fn wire_length(len: usize) -> Result<u32, LoopError> {
    u32::try_from(len).map_err(|_| LoopError::PayloadTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

/// First four bytes of the BLAKE3 hash of `payload`, little-endian.
pub fn checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let header = FrameHeader::for_payload(MessageKind::Command, b"abc").unwrap();
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..2], &PROTOCOL_VERSION.to_le_bytes());
        assert_eq!(bytes[2], MessageKind::Command as u8);
        assert_eq!(&bytes[3..7], &3u32.to_le_bytes());
        assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = FrameHeader::for_payload(MessageKind::Ping, &[]).unwrap().to_bytes();
        bytes[0..2].copy_from_slice(&9u16.to_le_bytes());
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(LoopError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut bytes = FrameHeader::for_payload(MessageKind::Ping, &[]).unwrap().to_bytes();
        bytes[2] = 0xEE;
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(LoopError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn verify_detects_tampering() {
        let header = FrameHeader::for_payload(MessageKind::Command, b"payload").unwrap();
        assert!(header.verify(b"payload"));
        assert!(!header.verify(b"paylaod"));
        assert!(!header.verify(b"payload+"));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn length_field_overflow_is_an_error() {
        assert_eq!(wire_length(7).unwrap(), 7);
        assert_eq!(wire_length(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            wire_length(u32::MAX as usize + 1),
            Err(LoopError::PayloadTooLarge { .. })
        ));
    }
}
