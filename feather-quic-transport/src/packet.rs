use anyhow::{anyhow, Result};
use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;
use tracing::{span, trace, Level};

use crate::connection::{QuicEncryptionLevel, QuicLevel};
use crate::frame::QuicWriteFrame;
use crate::utils::{encode_variable_length, encode_variable_length_force_two_bytes};

// Fixed Bit:
// The next bit (0x40) of byte 0 is set to 1, unless the packet is a Version Negotiation packet.
const FIXED_BIT: u8 = 0x40;
// Endpoints that receive a version 1 long header with a value larger than 20 MUST drop the packet.
const QUIC_MAX_CONNECTION_ID_LENGTH: usize = 20;
// Header Form:
// The most significant bit (0x80) of byte 0 (the first byte) is set to 1 for long headers.
const LONG_HEADER_FORM: u8 = 0x80;
const SHORT_HEADER_FORM: u8 = 0x00;
const KEY_PHASE: u8 = 0x04;

pub const QUIC_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderForm {
    Long,
    Short,
}

// Long Packet Type:
// The next two bits (those with a mask of 0x30) of byte 0 contain a packet type.
// Type	Name	Section
// 0x00	Initial	Section 17.2.2
// 0x01	0-RTT	Section 17.2.3
// 0x02	Handshake	Section 17.2.4
// 0x03	Retry	Section 17.2.5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongHeaderType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl From<LongHeaderType> for u8 {
    fn from(val: LongHeaderType) -> Self {
        match val {
            LongHeaderType::Initial => 0x00,
            LongHeaderType::ZeroRtt => 0x01,
            LongHeaderType::Handshake => 0x02,
            LongHeaderType::Retry => 0x03,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicProtectionType {
    Initial,
    Handshake,
    ZeroRtt,
    KeyPhaseZero,
    KeyPhaseOne,
}

impl QuicProtectionType {
    pub(crate) fn encryption_level(&self) -> QuicEncryptionLevel {
        match self {
            QuicProtectionType::Initial => QuicEncryptionLevel::Initial,
            QuicProtectionType::Handshake => QuicEncryptionLevel::Handshake,
            QuicProtectionType::ZeroRtt => QuicEncryptionLevel::EarlyData,
            QuicProtectionType::KeyPhaseZero | QuicProtectionType::KeyPhaseOne => {
                QuicEncryptionLevel::AppData
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicLongHeader {
    pub header_type: LongHeaderType,
    pub version: u32,
    pub dcid: Vec<u8>,
    pub scid: Vec<u8>,
    pub token: Vec<u8>,
    pub packet_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicShortHeader {
    pub protection_type: QuicProtectionType,
    pub dcid: Vec<u8>,
    pub packet_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuicPacketHeader {
    Long(QuicLongHeader),
    Short(QuicShortHeader),
}

impl QuicPacketHeader {
    pub fn packet_number(&self) -> u64 {
        match self {
            QuicPacketHeader::Long(h) => h.packet_number,
            QuicPacketHeader::Short(h) => h.packet_number,
        }
    }

    pub fn header_form(&self) -> HeaderForm {
        match self {
            QuicPacketHeader::Long(_) => HeaderForm::Long,
            QuicPacketHeader::Short(_) => HeaderForm::Short,
        }
    }

    pub fn protection_type(&self) -> QuicProtectionType {
        match self {
            QuicPacketHeader::Long(h) => match h.header_type {
                LongHeaderType::Initial | LongHeaderType::Retry => QuicProtectionType::Initial,
                LongHeaderType::Handshake => QuicProtectionType::Handshake,
                LongHeaderType::ZeroRtt => QuicProtectionType::ZeroRtt,
            },
            QuicPacketHeader::Short(h) => h.protection_type,
        }
    }

    /// The packet number space this header belongs to
    pub fn level(&self) -> QuicLevel {
        match self.protection_type() {
            QuicProtectionType::Initial => QuicLevel::Initial,
            QuicProtectionType::Handshake => QuicLevel::Handshake,
            _ => QuicLevel::Application,
        }
    }

    pub(crate) fn is_initial(&self) -> bool {
        matches!(
            self,
            QuicPacketHeader::Long(QuicLongHeader {
                header_type: LongHeaderType::Initial,
                ..
            })
        )
    }
}

/// Knows how to stamp out the header of the next packet for one write entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBuilder {
    Long(LongHeaderType),
    Short(QuicProtectionType),
}

impl HeaderBuilder {
    pub fn build(
        &self,
        scid: &[u8],
        dcid: &[u8],
        packet_number: u64,
        version: u32,
        token: &[u8],
    ) -> QuicPacketHeader {
        match *self {
            HeaderBuilder::Long(header_type) => QuicPacketHeader::Long(QuicLongHeader {
                header_type,
                version,
                dcid: dcid.to_vec(),
                scid: scid.to_vec(),
                token: if header_type == LongHeaderType::Initial {
                    token.to_vec()
                } else {
                    vec![]
                },
                packet_number,
            }),
            HeaderBuilder::Short(protection_type) => QuicPacketHeader::Short(QuicShortHeader {
                protection_type,
                dcid: dcid.to_vec(),
                packet_number,
            }),
        }
    }
}

/// Identifies the original packet a clone was made from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketEvent {
    pub level: QuicLevel,
    pub packet_number: u64,
}

/// The frame level description of a packet that went through a builder
#[derive(Debug, Clone, PartialEq)]
pub struct RegularQuicWritePacket {
    pub header: QuicPacketHeader,
    pub frames: Vec<QuicWriteFrame>,
}

impl RegularQuicWritePacket {
    pub(crate) fn new(header: QuicPacketHeader) -> Self {
        Self {
            header,
            frames: vec![],
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct QuicPacketNumber {
    pub(crate) truncated_pn: u32,
    pub(crate) packet_size: u8,
}

pub(crate) fn encode_packet_number_field_size(
    packet_number: u64,
    largest_acked: u64,
) -> Result<QuicPacketNumber> {
    // https://www.rfc-editor.org/rfc/rfc9000.html#section-17.1
    // https://www.rfc-editor.org/rfc/rfc9000.html#section-a.2

    let delta = packet_number.checked_sub(largest_acked).ok_or_else(|| {
        anyhow!("Invalid packet_number {packet_number}, largest_acked {largest_acked}")
    })?;

    let packet_size = if delta <= 0x7f {
        1
    } else if delta <= 0x7fff {
        2
    } else if delta <= 0x7fffff {
        3
    } else {
        4
    };
    let truncated_pn = (packet_number & (u64::MAX >> (64 - 8 * packet_size as u32))) as u32;

    Ok(QuicPacketNumber {
        truncated_pn,
        packet_size,
    })
}

/// Wire bytes of a header, with the positions a builder patches later
#[derive(Debug)]
pub(crate) struct EncodedHeader {
    pub(crate) bytes: Vec<u8>,
    /// Offset of the two bytes length placeholder, long headers only
    pub(crate) length_field_pos: Option<usize>,
    pub(crate) packet_number_length: u8,
}

pub(crate) fn encode_packet_header(
    header: &QuicPacketHeader,
    largest_acked: u64,
) -> Result<EncodedHeader> {
    let span = span!(
        Level::TRACE,
        "encode_packet_header",
        pn = header.packet_number(),
        header_size = tracing::field::Empty
    );
    let _enter = span.enter();

    let pn = encode_packet_number_field_size(header.packet_number(), largest_acked)?;
    let mut bytes = Vec::with_capacity(64);
    let mut length_field_pos = None;

    match header {
        // https://www.rfc-editor.org/rfc/rfc9000.html#name-long-header-packets
        // Long Header Packet {
        //   Header Form (1) = 1,
        //   Fixed Bit (1) = 1,
        //   Long Packet Type (2),
        //   Type-Specific Bits (4),
        //   Version (32),
        //   Destination Connection ID Length (8),
        //   Destination Connection ID (0..160),
        //   Source Connection ID Length (8),
        //   Source Connection ID (0..160),
        //   Token Length (i), Token (..),  # Initial only
        //   Length (i),
        //   Packet Number (8..32),
        // }
        QuicPacketHeader::Long(h) => {
            if h.dcid.len() > QUIC_MAX_CONNECTION_ID_LENGTH
                || h.scid.len() > QUIC_MAX_CONNECTION_ID_LENGTH
            {
                return Err(anyhow!(
                    "Connection id too long, dcid {} scid {}",
                    h.dcid.len(),
                    h.scid.len()
                ));
            }
            let flag = LONG_HEADER_FORM
                | FIXED_BIT
                | (u8::from(h.header_type) << 4)
                | (pn.packet_size - 1);
            bytes.write_u8(flag)?;
            bytes.write_u32::<BigEndian>(h.version)?;
            bytes.write_u8(h.dcid.len() as u8)?;
            bytes.write_all(&h.dcid)?;
            bytes.write_u8(h.scid.len() as u8)?;
            bytes.write_all(&h.scid)?;
            if h.header_type == LongHeaderType::Initial {
                encode_variable_length(&mut bytes, h.token.len() as u64)?;
                bytes.write_all(&h.token)?;
            }
            length_field_pos = Some(bytes.len());
            encode_variable_length_force_two_bytes(&mut bytes, 0)?;
        }
        // 1-RTT Packet {
        //   Header Form (1) = 0,
        //   Fixed Bit (1) = 1,
        //   Spin Bit (1),
        //   Reserved Bits (2),
        //   Key Phase (1),
        //   Packet Number Length (2),
        //   Destination Connection ID (0..160),
        //   Packet Number (8..32),
        // }
        QuicPacketHeader::Short(h) => {
            let mut flag = SHORT_HEADER_FORM | FIXED_BIT | (pn.packet_size - 1);
            if h.protection_type == QuicProtectionType::KeyPhaseOne {
                flag |= KEY_PHASE;
            }
            bytes.write_u8(flag)?;
            bytes.write_all(&h.dcid)?;
        }
    }

    match pn.packet_size {
        1 => bytes.write_u8(pn.truncated_pn as u8)?,
        2 => bytes.write_u16::<BigEndian>(pn.truncated_pn as u16)?,
        3 => bytes.write_u24::<BigEndian>(pn.truncated_pn)?,
        4 => bytes.write_u32::<BigEndian>(pn.truncated_pn)?,
        _ => return Err(anyhow!("Bad packet field size {}", pn.packet_size)),
    }

    span.record("header_size", bytes.len());
    trace!(
        "Encoded {:?} header, pn length {}",
        header.header_form(),
        pn.packet_size
    );

    Ok(EncodedHeader {
        bytes,
        length_field_pos,
        packet_number_length: pn.packet_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_packet_number_field_size() -> Result<()> {
        // https://www.rfc-editor.org/rfc/rfc9000.html#section-a.2
        assert_eq!(
            encode_packet_number_field_size(0xac5c02, 0xabe8b3)?,
            QuicPacketNumber {
                truncated_pn: 0x5c02,
                packet_size: 2
            }
        );
        assert_eq!(
            encode_packet_number_field_size(0xace8fe, 0xabe8b3)?,
            QuicPacketNumber {
                truncated_pn: 0xace8fe,
                packet_size: 3
            }
        );
        assert_eq!(encode_packet_number_field_size(5, 0)?.packet_size, 1);
        assert_eq!(
            encode_packet_number_field_size(0x1_0000_0000, 0)?.packet_size,
            4
        );
        assert!(encode_packet_number_field_size(1, 2).is_err());
        Ok(())
    }

    #[test]
    fn test_encode_long_header() -> Result<()> {
        let header = HeaderBuilder::Long(LongHeaderType::Initial).build(
            &[0x01, 0x02],
            &[0x0a, 0x0b, 0x0c],
            2,
            QUIC_VERSION,
            &[0xee],
        );
        assert_eq!(header.level(), QuicLevel::Initial);
        assert!(header.is_initial());

        let encoded = encode_packet_header(&header, 0)?;
        assert_eq!(
            encoded.bytes,
            vec![
                0xc0, 0x00, 0x00, 0x00, 0x01, 0x03, 0x0a, 0x0b, 0x0c, 0x02, 0x01, 0x02, 0x01, 0xee,
                0x40, 0x00, 0x02
            ]
        );
        assert_eq!(encoded.length_field_pos, Some(14));
        assert_eq!(encoded.packet_number_length, 1);
        Ok(())
    }

    #[test]
    fn test_encode_short_header() -> Result<()> {
        let header = HeaderBuilder::Short(QuicProtectionType::KeyPhaseOne).build(
            &[],
            &[0x0a, 0x0b],
            0x1234,
            QUIC_VERSION,
            &[],
        );
        assert_eq!(header.level(), QuicLevel::Application);
        assert_eq!(header.header_form(), HeaderForm::Short);

        let encoded = encode_packet_header(&header, 0x1200)?;
        assert_eq!(encoded.bytes, vec![0x44, 0x0a, 0x0b, 0x34]);
        assert_eq!(encoded.length_field_pos, None);
        Ok(())
    }

    #[test]
    fn test_handshake_header_drops_token() {
        let header = HeaderBuilder::Long(LongHeaderType::Handshake).build(
            &[1],
            &[2],
            0,
            QUIC_VERSION,
            &[9, 9],
        );
        match header {
            QuicPacketHeader::Long(ref h) => assert!(h.token.is_empty()),
            _ => panic!("Expect long header"),
        }
        assert_eq!(header.protection_type(), QuicProtectionType::Handshake);
        assert_eq!(header.level(), QuicLevel::Handshake);
    }
}
