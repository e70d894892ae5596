use anyhow::Result;
use byteorder::WriteBytesExt;
use std::io::Write;
use std::time::Duration;
use tracing::{trace, trace_span, warn};

use crate::ack::QuicIntervalSet;
use crate::builder::QuicPacketBuilder;
use crate::utils::{encode_variable_length, get_variable_length};

const QUIC_STATELESS_RESET_TOKEN_LENGTH: usize = 16;
const QUIC_STREAM_FRAME_OFF_BIT: u8 = 0x04;
const QUIC_STREAM_FRAME_LEN_BIT: u8 = 0x02;
const QUIC_STREAM_FRAME_FIN_BIT: u8 = 0x01;

// The "Pkts" column in Table 3 lists the types of packets that each frame type could appear in,
// indicated by the following characters:
// I: Initial (Section 17.2.2)
// H: Handshake (Section 17.2.4)
// 0: 0-RTT (Section 17.2.3)
// 1: 1-RTT (Section 17.3.1)
// ih: Only a CONNECTION_CLOSE frame of type 0x1c can appear in Initial or Handshake packets.
//
// The "Spec" column in Table 3 summarizes any special rules governing the processing or
// generation of the frame type, as indicated by the following characters:
// N: Packets containing only frames with this marking are not ack-eliciting; see Section 13.2.
// C: Packets containing only frames with this marking do not count toward bytes in flight
//    for congestion control purposes; see [QUIC-RECOVERY].
// P: Packets containing only frames with this marking can be sent on new network paths
//    during connection migration; see Section 9.1.
// F: The contents of frames with this marking are flow controlled; see Section 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QuicFrameType {
    /// Pkts: IH01, Spec: NP
    Padding = 0x00,
    /// Pkts: IH01
    Ping = 0x01,
    /// Pkts: IH_1, Spec: NC
    Ack = 0x02,
    /// Pkts: __01
    ResetStream = 0x04,
    /// Pkts: __01
    StopSending = 0x05,
    /// Pkts: IH_1
    Crypto = 0x06,
    /// Pkts: __01, Spec: F
    Stream = 0x08,
    /// Pkts: __01
    MaxData = 0x10,
    /// Pkts: __01
    MaxStreamData = 0x11,
    /// Pkts: __01
    MaxStreamsBidi = 0x12,
    /// Pkts: __01
    MaxStreamsUni = 0x13,
    /// Pkts: __01
    DataBlocked = 0x14,
    /// Pkts: __01
    StreamDataBlocked = 0x15,
    /// Pkts: __01, Spec: P
    NewConnectionId = 0x18,
    /// Pkts: __01
    RetireConnectionId = 0x19,
    /// Pkts: __01, Spec: P
    PathChallenge = 0x1a,
    /// Pkts: ___1, Spec: P
    PathResponse = 0x1b,
    /// Pkts: ih01, Spec: N
    ConnectionClose = 0x1c,
    /// Pkts: __01, Spec: N
    ConnectionCloseApp = 0x1d,
    /// Pkts: ___1
    HandshakeDone = 0x1e,
}

impl From<QuicFrameType> for u64 {
    fn from(val: QuicFrameType) -> Self {
        val as u8 as u64
    }
}

/// Control frames without special send side bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuicSimpleFrame {
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    PathChallenge {
        data: u64,
    },
    PathResponse {
        data: u64,
    },
    NewConnectionId {
        sequence_number: u64,
        retire_prior_to: u64,
        connection_id: Vec<u8>,
        stateless_reset_token: [u8; QUIC_STATELESS_RESET_TOKEN_LENGTH],
    },
    RetireConnectionId {
        sequence_number: u64,
    },
    MaxStreams {
        max_streams: u64,
        is_bidirectional: bool,
    },
    HandshakeDone,
}

/// One inclusive range of acknowledged packet numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBlock {
    pub start: u64,
    pub end: u64,
}

/// Ack frame as written, blocks ordered from the largest packet number down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAckFrame {
    pub ack_blocks: Vec<AckBlock>,
    pub ack_delay: Duration,
}

impl WriteAckFrame {
    pub fn largest_acked(&self) -> Option<u64> {
        self.ack_blocks.first().map(|b| b.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuicWriteFrame {
    Padding {
        num_bytes: usize,
    },
    Ping,
    Ack(WriteAckFrame),
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    Crypto {
        offset: u64,
        len: u64,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        len: u64,
        fin: bool,
    },
    MaxData {
        maximum_data: u64,
    },
    MaxStreamData {
        stream_id: u64,
        maximum_data: u64,
    },
    DataBlocked {
        data_limit: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        data_limit: u64,
    },
    Simple(QuicSimpleFrame),
    ConnectionClose {
        error_code: u64,
        frame_type: u64,
        reason_phrase: String,
    },
    ApplicationClose {
        error_code: u64,
        reason_phrase: String,
    },
}

impl QuicWriteFrame {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            QuicWriteFrame::Padding { .. } => "PADDING",
            QuicWriteFrame::Ping => "PING",
            QuicWriteFrame::Ack(_) => "ACK",
            QuicWriteFrame::ResetStream { .. } => "RESET_STREAM",
            QuicWriteFrame::Crypto { .. } => "CRYPTO",
            QuicWriteFrame::Stream { .. } => "STREAM",
            QuicWriteFrame::MaxData { .. } => "MAX_DATA",
            QuicWriteFrame::MaxStreamData { .. } => "MAX_STREAM_DATA",
            QuicWriteFrame::DataBlocked { .. } => "DATA_BLOCKED",
            QuicWriteFrame::StreamDataBlocked { .. } => "STREAM_DATA_BLOCKED",
            QuicWriteFrame::Simple(_) => "SIMPLE",
            QuicWriteFrame::ConnectionClose { .. } => "CONNECTION_CLOSE",
            QuicWriteFrame::ApplicationClose { .. } => "CONNECTION_CLOSE_APP",
        }
    }
}

fn encode_simple_frame(frame: &QuicSimpleFrame, out: &mut Vec<u8>) -> Result<()> {
    match frame {
        // STOP_SENDING Frame {
        //   Type (i) = 0x05,
        //   Stream ID (i),
        //   Application Protocol Error Code (i),
        // }
        QuicSimpleFrame::StopSending {
            stream_id,
            error_code,
        } => {
            encode_variable_length(out, QuicFrameType::StopSending.into())?;
            encode_variable_length(out, *stream_id)?;
            encode_variable_length(out, *error_code)?;
        }
        QuicSimpleFrame::PathChallenge { data } => {
            encode_variable_length(out, QuicFrameType::PathChallenge.into())?;
            out.write_all(&data.to_be_bytes())?;
        }
        QuicSimpleFrame::PathResponse { data } => {
            encode_variable_length(out, QuicFrameType::PathResponse.into())?;
            out.write_all(&data.to_be_bytes())?;
        }
        // NEW_CONNECTION_ID Frame {
        //   Type (i) = 0x18,
        //   Sequence Number (i),
        //   Retire Prior To (i),
        //   Length (8),
        //   Connection ID (8..160),
        //   Stateless Reset Token (128),
        // }
        QuicSimpleFrame::NewConnectionId {
            sequence_number,
            retire_prior_to,
            connection_id,
            stateless_reset_token,
        } => {
            encode_variable_length(out, QuicFrameType::NewConnectionId.into())?;
            encode_variable_length(out, *sequence_number)?;
            encode_variable_length(out, *retire_prior_to)?;
            out.write_u8(connection_id.len() as u8)?;
            out.write_all(connection_id)?;
            out.write_all(stateless_reset_token)?;
        }
        QuicSimpleFrame::RetireConnectionId { sequence_number } => {
            encode_variable_length(out, QuicFrameType::RetireConnectionId.into())?;
            encode_variable_length(out, *sequence_number)?;
        }
        QuicSimpleFrame::MaxStreams {
            max_streams,
            is_bidirectional,
        } => {
            let frame_type = if *is_bidirectional {
                QuicFrameType::MaxStreamsBidi
            } else {
                QuicFrameType::MaxStreamsUni
            };
            encode_variable_length(out, frame_type.into())?;
            encode_variable_length(out, *max_streams)?;
        }
        QuicSimpleFrame::HandshakeDone => {
            encode_variable_length(out, QuicFrameType::HandshakeDone.into())?;
        }
    }
    Ok(())
}

/// Wire image of a frame that carries no stream payload
fn encode_frame(frame: &QuicWriteFrame) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(16);
    match frame {
        QuicWriteFrame::Padding { num_bytes } => out.resize(*num_bytes, 0),
        QuicWriteFrame::Ping => {
            encode_variable_length(&mut out, QuicFrameType::Ping.into())?;
        }
        // RESET_STREAM Frame {
        //   Type (i) = 0x04,
        //   Stream ID (i),
        //   Application Protocol Error Code (i),
        //   Final Size (i),
        // }
        QuicWriteFrame::ResetStream {
            stream_id,
            error_code,
            final_size,
        } => {
            encode_variable_length(&mut out, QuicFrameType::ResetStream.into())?;
            encode_variable_length(&mut out, *stream_id)?;
            encode_variable_length(&mut out, *error_code)?;
            encode_variable_length(&mut out, *final_size)?;
        }
        QuicWriteFrame::MaxData { maximum_data } => {
            encode_variable_length(&mut out, QuicFrameType::MaxData.into())?;
            encode_variable_length(&mut out, *maximum_data)?;
        }
        QuicWriteFrame::MaxStreamData {
            stream_id,
            maximum_data,
        } => {
            encode_variable_length(&mut out, QuicFrameType::MaxStreamData.into())?;
            encode_variable_length(&mut out, *stream_id)?;
            encode_variable_length(&mut out, *maximum_data)?;
        }
        QuicWriteFrame::DataBlocked { data_limit } => {
            encode_variable_length(&mut out, QuicFrameType::DataBlocked.into())?;
            encode_variable_length(&mut out, *data_limit)?;
        }
        QuicWriteFrame::StreamDataBlocked {
            stream_id,
            data_limit,
        } => {
            encode_variable_length(&mut out, QuicFrameType::StreamDataBlocked.into())?;
            encode_variable_length(&mut out, *stream_id)?;
            encode_variable_length(&mut out, *data_limit)?;
        }
        QuicWriteFrame::Simple(simple) => encode_simple_frame(simple, &mut out)?,
        // CONNECTION_CLOSE Frame {
        //   Type (i) = 0x1c..0x1d,
        //   Error Code (i),
        //   [Frame Type (i)],
        //   Reason Phrase Length (i),
        //   Reason Phrase (..),
        // }
        QuicWriteFrame::ConnectionClose {
            error_code,
            frame_type,
            reason_phrase,
        } => {
            encode_variable_length(&mut out, QuicFrameType::ConnectionClose.into())?;
            encode_variable_length(&mut out, *error_code)?;
            encode_variable_length(&mut out, *frame_type)?;
            encode_variable_length(&mut out, reason_phrase.len() as u64)?;
            out.write_all(reason_phrase.as_bytes())?;
        }
        QuicWriteFrame::ApplicationClose {
            error_code,
            reason_phrase,
        } => {
            encode_variable_length(&mut out, QuicFrameType::ConnectionCloseApp.into())?;
            encode_variable_length(&mut out, *error_code)?;
            encode_variable_length(&mut out, reason_phrase.len() as u64)?;
            out.write_all(reason_phrase.as_bytes())?;
        }
        QuicWriteFrame::Ack(_) | QuicWriteFrame::Crypto { .. } | QuicWriteFrame::Stream { .. } => {
            unreachable!("{} frames are written by their own writers", frame.name())
        }
    }
    Ok(out)
}

/// Writes a control frame when it fits, returning the bytes consumed (0 when it does not fit)
pub(crate) fn write_frame(
    frame: QuicWriteFrame,
    builder: &mut dyn QuicPacketBuilder,
) -> Result<usize> {
    let _span = trace_span!("write_frame", frame_type = frame.name()).entered();
    let encoded = encode_frame(&frame)?;
    if encoded.len() > builder.remaining_space() {
        trace!(
            "No room for frame, need {} bytes, remaining {}",
            encoded.len(),
            builder.remaining_space()
        );
        return Ok(0);
    }

    builder.write_bytes(&encoded);
    // Consecutive padding is accounted as one frame
    if let QuicWriteFrame::Padding { num_bytes } = frame {
        if let Some(QuicWriteFrame::Padding { num_bytes: last }) = builder.last_frame_mut() {
            *last += num_bytes;
            return Ok(encoded.len());
        }
    }
    builder.append_frame(frame);
    Ok(encoded.len())
}

/// Writes the header of a STREAM frame and reports how many payload bytes
/// the caller has to write right after it, along with the final fin bit.
pub(crate) fn write_stream_frame_header(
    builder: &mut dyn QuicPacketBuilder,
    stream_id: u64,
    offset: u64,
    write_buffer_len: u64,
    flow_control_len: u64,
    fin: bool,
) -> Result<Option<(u64, bool)>> {
    // STREAM Frame {
    //   Type (i) = 0x08..0x0f,
    //   Stream ID (i),
    //   [Offset (i)],
    //   [Length (i)],
    //   Stream Data (..),
    // }
    let remaining = builder.remaining_space() as u64;
    let mut data_len = write_buffer_len.min(flow_control_len);
    let mut header_len = 1 + get_variable_length(stream_id)? as u64;
    if offset != 0 {
        header_len += get_variable_length(offset)? as u64;
    }
    header_len += get_variable_length(data_len.min(remaining))? as u64;
    if remaining < header_len || (remaining == header_len && !fin) {
        return Ok(None);
    }
    data_len = data_len.min(remaining - header_len);
    let fin = fin && data_len == write_buffer_len;
    if data_len == 0 && !fin {
        return Ok(None);
    }

    let mut frame_type = QuicFrameType::Stream as u8 | QUIC_STREAM_FRAME_LEN_BIT;
    if offset != 0 {
        frame_type |= QUIC_STREAM_FRAME_OFF_BIT;
    }
    if fin {
        frame_type |= QUIC_STREAM_FRAME_FIN_BIT;
    }
    let mut header = Vec::with_capacity(header_len as usize);
    header.write_u8(frame_type)?;
    encode_variable_length(&mut header, stream_id)?;
    if offset != 0 {
        encode_variable_length(&mut header, offset)?;
    }
    encode_variable_length(&mut header, data_len)?;
    builder.write_bytes(&header);

    Ok(Some((data_len, fin)))
}

/// Writes a CRYPTO frame with as much of `data` as fits, returning the payload length
pub(crate) fn write_crypto_frame(
    builder: &mut dyn QuicPacketBuilder,
    offset: u64,
    data: &[u8],
) -> Result<Option<u64>> {
    // CRYPTO Frame {
    //   Type (i) = 0x06,
    //   Offset (i),
    //   Length (i),
    //   Crypto Data (..),
    // }
    let remaining = builder.remaining_space() as u64;
    let header_len = 1
        + get_variable_length(offset)? as u64
        + get_variable_length((data.len() as u64).min(remaining))? as u64;
    if remaining <= header_len || data.is_empty() {
        return Ok(None);
    }
    let data_len = (data.len() as u64).min(remaining - header_len);

    let mut header = Vec::with_capacity(header_len as usize);
    encode_variable_length(&mut header, QuicFrameType::Crypto.into())?;
    encode_variable_length(&mut header, offset)?;
    encode_variable_length(&mut header, data_len)?;
    builder.write_bytes(&header);
    builder.write_bytes(&data[..data_len as usize]);
    builder.append_frame(QuicWriteFrame::Crypto {
        offset,
        len: data_len,
    });

    Ok(Some(data_len))
}

pub(crate) struct AckFrameMetaData<'a> {
    pub(crate) ack_blocks: &'a QuicIntervalSet,
    pub(crate) ack_delay: Duration,
    pub(crate) ack_delay_exponent: u8,
}

// Bound so the range count always fits a one byte varint
const MAX_ADDITIONAL_ACK_BLOCKS: usize = 63;

/// Writes as many ack ranges as fit, largest first
pub(crate) fn write_ack_frame(
    meta: &AckFrameMetaData,
    builder: &mut dyn QuicPacketBuilder,
) -> Result<Option<WriteAckFrame>> {
    // ACK Frame {
    //   Type (i) = 0x02..0x03,
    //   Largest Acknowledged (i),
    //   ACK Delay (i),
    //   ACK Range Count (i),
    //   First ACK Range (i),
    //   ACK Range (..) ...,
    // }
    let mut intervals = meta.ack_blocks.iter().rev();
    let first = match intervals.next() {
        Some(first) => *first,
        None => return Ok(None),
    };

    let encoded_delay = (meta.ack_delay.as_micros() as u64) >> meta.ack_delay_exponent;
    let mut prefix = Vec::with_capacity(32);
    encode_variable_length(&mut prefix, QuicFrameType::Ack.into())?;
    encode_variable_length(&mut prefix, first.end)?;
    encode_variable_length(&mut prefix, encoded_delay)?;

    let mut ranges = Vec::with_capacity(32);
    encode_variable_length(&mut ranges, first.end - first.start)?;

    let remaining = builder.remaining_space();
    // One byte for the range count
    if prefix.len() + 1 + ranges.len() > remaining {
        warn!(
            "Should provide more buffer for Ack frame, only got {} bytes",
            remaining
        );
        return Ok(None);
    }

    let mut ack_blocks = vec![first];
    let mut previous = first;
    for block in intervals.take(MAX_ADDITIONAL_ACK_BLOCKS) {
        // ACK Range {
        //   Gap (i),
        //   ACK Range Length (i),
        // }
        let mut encoded = Vec::with_capacity(16);
        encode_variable_length(&mut encoded, previous.start - block.end - 2)?;
        encode_variable_length(&mut encoded, block.end - block.start)?;
        if prefix.len() + 1 + ranges.len() + encoded.len() > remaining {
            break;
        }
        ranges.extend_from_slice(&encoded);
        ack_blocks.push(*block);
        previous = *block;
    }

    encode_variable_length(&mut prefix, (ack_blocks.len() - 1) as u64)?;
    builder.write_bytes(&prefix);
    builder.write_bytes(&ranges);

    let ack_frame = WriteAckFrame {
        ack_blocks,
        ack_delay: meta.ack_delay,
    };
    builder.append_frame(QuicWriteFrame::Ack(ack_frame.clone()));
    Ok(Some(ack_frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RegularPacketBuilder;
    use crate::packet::{HeaderBuilder, QuicProtectionType, QUIC_VERSION};

    fn short_builder(limit: usize) -> RegularPacketBuilder {
        let header = HeaderBuilder::Short(QuicProtectionType::KeyPhaseZero).build(
            &[],
            &[1, 2],
            1,
            QUIC_VERSION,
            &[],
        );
        let mut builder = RegularPacketBuilder::new(limit, header, 0);
        builder.encode_packet_header().unwrap();
        builder
    }

    #[test]
    fn test_write_control_frames() -> Result<()> {
        let mut builder = short_builder(1200);
        let header_size = 1200 - builder.remaining_space();

        assert_eq!(write_frame(QuicWriteFrame::Ping, &mut builder)?, 1);
        assert_eq!(
            write_frame(
                QuicWriteFrame::MaxStreamData {
                    stream_id: 4,
                    maximum_data: 1 << 20,
                },
                &mut builder
            )?,
            6
        );
        assert_eq!(
            write_frame(
                QuicWriteFrame::Simple(QuicSimpleFrame::PathChallenge { data: 7 }),
                &mut builder
            )?,
            9
        );
        assert_eq!(builder.frames().len(), 3);
        assert_eq!(1200 - builder.remaining_space(), header_size + 16);
        Ok(())
    }

    #[test]
    fn test_padding_frames_are_merged() -> Result<()> {
        let mut builder = short_builder(100);
        write_frame(QuicWriteFrame::Padding { num_bytes: 1 }, &mut builder)?;
        write_frame(QuicWriteFrame::Padding { num_bytes: 1 }, &mut builder)?;
        assert_eq!(
            builder.frames(),
            &[QuicWriteFrame::Padding { num_bytes: 2 }]
        );
        Ok(())
    }

    #[test]
    fn test_frame_does_not_fit() -> Result<()> {
        let mut builder = short_builder(8);
        let remaining = builder.remaining_space();
        let written = write_frame(
            QuicWriteFrame::ConnectionClose {
                error_code: 0,
                frame_type: 0,
                reason_phrase: "No error".to_string(),
            },
            &mut builder,
        )?;
        assert_eq!(written, 0);
        assert_eq!(builder.remaining_space(), remaining);
        assert!(builder.frames().is_empty());
        Ok(())
    }

    #[test]
    fn test_stream_frame_header_limited_by_space() -> Result<()> {
        let mut builder = short_builder(30);
        let remaining = builder.remaining_space() as u64;
        let (len, fin) = write_stream_frame_header(&mut builder, 0, 1000, 5000, 5000, true)?
            .unwrap();
        assert!(!fin);
        // type + id + offset(2) + length(1)
        assert_eq!(len, remaining - 5);
        Ok(())
    }

    #[test]
    fn test_stream_frame_fin_only() -> Result<()> {
        let mut builder = short_builder(30);
        let (len, fin) = write_stream_frame_header(&mut builder, 4, 10, 0, 0, true)?.unwrap();
        assert_eq!(len, 0);
        assert!(fin);

        let mut builder = short_builder(30);
        assert!(write_stream_frame_header(&mut builder, 4, 10, 0, 0, false)?.is_none());
        Ok(())
    }

    #[test]
    fn test_write_ack_frame_blocks() -> Result<()> {
        let mut builder = short_builder(1200);
        let mut acks = QuicIntervalSet::default();
        acks.insert(1, 3);
        acks.insert(6, 9);
        acks.insert(12, 12);

        let meta = AckFrameMetaData {
            ack_blocks: &acks,
            ack_delay: Duration::from_micros(800),
            ack_delay_exponent: 3,
        };
        let ack = write_ack_frame(&meta, &mut builder)?.unwrap();
        assert_eq!(ack.largest_acked(), Some(12));
        assert_eq!(
            ack.ack_blocks,
            vec![
                AckBlock { start: 12, end: 12 },
                AckBlock { start: 6, end: 9 },
                AckBlock { start: 1, end: 3 },
            ]
        );
        // type, largest, delay(100 -> 2 bytes), count, first, 2 * (gap, len)
        assert_eq!(builder.frames().len(), 1);
        Ok(())
    }

    #[test]
    fn test_ack_frame_without_room() -> Result<()> {
        let mut builder = short_builder(5);
        let mut acks = QuicIntervalSet::default();
        acks.insert(1, 3);
        let meta = AckFrameMetaData {
            ack_blocks: &acks,
            ack_delay: Duration::ZERO,
            ack_delay_exponent: 3,
        };
        assert!(write_ack_frame(&meta, &mut builder)?.is_none());
        Ok(())
    }
}
