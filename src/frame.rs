//! MS/TP Frame Codec
//!
//! This module builds and parses single MS/TP frames as defined in ASHRAE 135
//! Clause 9. A frame on the wire is:
//!
//! - Preamble (2 octets): 0x55, 0xFF
//! - Frame Type (1 octet)
//! - Destination Address (1 octet)
//! - Source Address (1 octet)
//! - Data Length (2 octets, big-endian)
//! - Header CRC (1 octet)
//! - Data (0-501 octets)
//! - Data CRC (2 octets, little-endian) - only if data length > 0
//!
//! Frame types 128-255 are reserved for vendors and pass through the codec
//! unmodified.

use crate::crc::{data_crc, header_crc};

/// First MS/TP preamble octet
pub const PREAMBLE_55: u8 = 0x55;
/// Second MS/TP preamble octet
pub const PREAMBLE_FF: u8 = 0xFF;

/// Maximum number of data octets in one frame
pub const MAX_DATA_LENGTH: usize = 501;

/// Frame size without data: preamble, header and header CRC
pub const HEADER_SIZE: usize = 8;

/// Largest possible frame: header + data + data CRC
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_DATA_LENGTH + 2;

/// MS/TP broadcast station address
pub const BROADCAST_ADDRESS: u8 = 255;

/// MS/TP frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Token frame
    Token,
    /// Poll For Master frame
    PollForMaster,
    /// Reply To Poll For Master frame
    ReplyToPollForMaster,
    /// Test Request frame
    TestRequest,
    /// Test Response frame
    TestResponse,
    /// BACnet Data Expecting Reply frame
    BacnetDataExpectingReply,
    /// BACnet Data Not Expecting Reply frame
    BacnetDataNotExpectingReply,
    /// Reply Postponed frame
    ReplyPostponed,
    /// Vendor proprietary frame (128-255)
    Proprietary(u8),
}

impl FrameType {
    /// Decode a frame type octet. Returns `None` for the reserved range 8-127.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Token),
            1 => Some(Self::PollForMaster),
            2 => Some(Self::ReplyToPollForMaster),
            3 => Some(Self::TestRequest),
            4 => Some(Self::TestResponse),
            5 => Some(Self::BacnetDataExpectingReply),
            6 => Some(Self::BacnetDataNotExpectingReply),
            7 => Some(Self::ReplyPostponed),
            8..=127 => None,
            128..=255 => Some(Self::Proprietary(value)),
        }
    }

    /// The wire encoding of this frame type.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Token => 0,
            Self::PollForMaster => 1,
            Self::ReplyToPollForMaster => 2,
            Self::TestRequest => 3,
            Self::TestResponse => 4,
            Self::BacnetDataExpectingReply => 5,
            Self::BacnetDataNotExpectingReply => 6,
            Self::ReplyPostponed => 7,
            Self::Proprietary(value) => value,
        }
    }

    /// True for the two BACnet data frame types.
    pub fn is_data(self) -> bool {
        matches!(
            self,
            Self::BacnetDataExpectingReply | Self::BacnetDataNotExpectingReply
        )
    }
}

/// Encode one MS/TP frame into `out`.
///
/// Returns the number of octets written, or 0 when the data is longer than
/// [`MAX_DATA_LENGTH`] or `out` cannot hold the whole frame. The zero return
/// mirrors the datalink convention of "nothing transmitted".
pub fn create_frame(
    out: &mut [u8],
    frame_type: FrameType,
    destination: u8,
    source: u8,
    data: &[u8],
) -> usize {
    if data.len() > MAX_DATA_LENGTH {
        return 0;
    }
    let frame_len = if data.is_empty() {
        HEADER_SIZE
    } else {
        HEADER_SIZE + data.len() + 2
    };
    if out.len() < frame_len {
        return 0;
    }

    let length = data.len() as u16;
    out[0] = PREAMBLE_55;
    out[1] = PREAMBLE_FF;
    out[2] = frame_type.to_u8();
    out[3] = destination;
    out[4] = source;
    out[5] = (length >> 8) as u8;
    out[6] = (length & 0xFF) as u8;
    out[7] = header_crc(&[out[2], out[3], out[4], out[5], out[6]]);

    if !data.is_empty() {
        out[HEADER_SIZE..HEADER_SIZE + data.len()].copy_from_slice(data);
        let crc = data_crc(data);
        out[HEADER_SIZE + data.len()] = (crc & 0xFF) as u8;
        out[HEADER_SIZE + data.len() + 1] = (crc >> 8) as u8;
    }

    frame_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_round_trip() {
        for value in 0u8..=255 {
            match FrameType::from_u8(value) {
                Some(frame_type) => assert_eq!(frame_type.to_u8(), value),
                None => assert!((8..=127).contains(&value)),
            }
        }
    }

    #[test]
    fn test_create_token_frame() {
        let mut out = [0u8; MAX_FRAME_SIZE];
        let len = create_frame(&mut out, FrameType::Token, 0x01, 0x00, &[]);
        assert_eq!(len, HEADER_SIZE);
        assert_eq!(&out[..len], &[0x55, 0xFF, 0x00, 0x01, 0x00, 0x00, 0x00, 0x73]);
    }

    #[test]
    fn test_create_data_frame() {
        let pdu = [0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF, 0x10, 0x08];
        let mut out = [0u8; MAX_FRAME_SIZE];
        let len = create_frame(
            &mut out,
            FrameType::BacnetDataNotExpectingReply,
            BROADCAST_ADDRESS,
            0x00,
            &pdu,
        );
        assert_eq!(len, HEADER_SIZE + pdu.len() + 2);
        assert_eq!(&out[..HEADER_SIZE], &[0x55, 0xFF, 0x06, 0xFF, 0x00, 0x00, 0x08, 0x1D]);
        assert_eq!(&out[HEADER_SIZE..HEADER_SIZE + pdu.len()], &pdu);
        // data CRC 0xB615 transmitted low octet first
        assert_eq!(out[len - 2], 0x15);
        assert_eq!(out[len - 1], 0xB6);
    }

    #[test]
    fn test_create_frame_oversize() {
        let data = [0u8; MAX_DATA_LENGTH + 1];
        let mut out = [0u8; MAX_FRAME_SIZE + 8];
        assert_eq!(
            create_frame(&mut out, FrameType::BacnetDataNotExpectingReply, 1, 2, &data),
            0
        );

        let data = [0u8; MAX_DATA_LENGTH];
        assert_ne!(
            create_frame(&mut out, FrameType::BacnetDataNotExpectingReply, 1, 2, &data),
            0
        );
    }

    #[test]
    fn test_create_frame_short_buffer() {
        let data = [1, 2, 3, 4];
        let mut out = [0u8; HEADER_SIZE + 4 + 1];
        assert_eq!(
            create_frame(&mut out, FrameType::BacnetDataNotExpectingReply, 1, 2, &data),
            0
        );
    }

    #[test]
    fn test_proprietary_type_passes_through() {
        let mut out = [0u8; MAX_FRAME_SIZE];
        let len = create_frame(&mut out, FrameType::Proprietary(0xC3), 5, 6, &[0xAA]);
        assert_eq!(out[2], 0xC3);
        assert_eq!(len, HEADER_SIZE + 1 + 2);
    }
}
