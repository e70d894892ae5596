use anyhow::Result;
use tracing::{debug, trace};

use crate::buf_accessor::{ArenaBuf, BufAccessor};
use crate::crypto::{MAX_PACKET_NUMBER_LENGTH, QUIC_SAMPLE_LENGTH};
use crate::frame::QuicWriteFrame;
use crate::packet::{encode_packet_header, EncodedHeader, QuicPacketHeader, RegularQuicWritePacket};
use crate::utils::patch_variable_length_two_bytes;

/// Sink for the frames of one packet, used by the frame writers and schedulers
pub(crate) trait QuicPacketBuilder {
    fn remaining_space(&self) -> usize;

    /// Appends raw frame bytes, the caller has checked `remaining_space`
    fn write_bytes(&mut self, data: &[u8]);

    fn append_frame(&mut self, frame: QuicWriteFrame);

    fn last_frame_mut(&mut self) -> Option<&mut QuicWriteFrame>;

    fn frames(&self) -> &[QuicWriteFrame];

    fn packet_header(&self) -> &QuicPacketHeader;

    /// Pads past the packet size limit, bounded only by the backing storage.
    /// Only path MTU probes are allowed to do this.
    fn write_probe_padding(&mut self, len: usize) -> usize;
}

/// Where the bytes of a built packet live
#[derive(Debug)]
pub(crate) enum PacketBuffers {
    Chained { header: Vec<u8>, body: Vec<u8> },
    Inplace { header_len: usize, body_len: usize },
    /// The header did not fit, there is no payload region at all
    NoBody,
}

#[derive(Debug)]
pub(crate) struct BuiltPacket {
    pub(crate) packet: RegularQuicWritePacket,
    pub(crate) buffers: PacketBuffers,
}

impl BuiltPacket {
    pub(crate) fn has_body(&self) -> bool {
        !matches!(self.buffers, PacketBuffers::NoBody)
    }
}

fn minimum_body_size(packet_number_length: u8) -> usize {
    // The header protection sample starts at 4 bytes past the packet number
    MAX_PACKET_NUMBER_LENGTH - packet_number_length as usize + QUIC_SAMPLE_LENGTH
}

/// Builds each packet into buffers of its own
pub(crate) struct RegularPacketBuilder {
    packet: RegularQuicWritePacket,
    largest_acked: u64,
    remaining: usize,
    cipher_overhead: usize,
    header: Option<EncodedHeader>,
    body: Vec<u8>,
}

impl RegularPacketBuilder {
    pub(crate) fn new(
        packet_size_limit: usize,
        header: QuicPacketHeader,
        largest_acked: u64,
    ) -> Self {
        Self {
            packet: RegularQuicWritePacket::new(header),
            largest_acked,
            remaining: packet_size_limit,
            cipher_overhead: 0,
            header: None,
            body: Vec::with_capacity(packet_size_limit),
        }
    }

    pub(crate) fn encode_packet_header(&mut self) -> Result<()> {
        let encoded = encode_packet_header(&self.packet.header, self.largest_acked)?;
        if encoded.bytes.len() > self.remaining {
            debug!(
                "Header of {} bytes does not fit in {} bytes",
                encoded.bytes.len(),
                self.remaining
            );
            self.remaining = 0;
            return Ok(());
        }
        self.remaining -= encoded.bytes.len();
        self.header = Some(encoded);
        Ok(())
    }

    pub(crate) fn account_for_cipher_overhead(&mut self, overhead: usize) {
        self.cipher_overhead = overhead;
        self.remaining = self.remaining.saturating_sub(overhead);
    }

    pub(crate) fn header_bytes(&self) -> usize {
        self.header.as_ref().map_or(0, |h| h.bytes.len())
    }

    pub(crate) fn build(mut self) -> Result<BuiltPacket> {
        let mut header = match self.header.take() {
            Some(header) => header,
            None => {
                return Ok(BuiltPacket {
                    packet: self.packet,
                    buffers: PacketBuffers::NoBody,
                })
            }
        };

        let min_body = minimum_body_size(header.packet_number_length);
        if !self.packet.frames.is_empty() {
            while self.body.len() + self.cipher_overhead < min_body && self.remaining > 0 {
                self.body.push(0);
                self.remaining -= 1;
            }
        }

        if let Some(pos) = header.length_field_pos {
            let length =
                header.packet_number_length as usize + self.body.len() + self.cipher_overhead;
            patch_variable_length_two_bytes(&mut header.bytes, pos, length as u64)?;
        }
        trace!(
            "Built packet {}, header {} bytes, body {} bytes",
            self.packet.header.packet_number(),
            header.bytes.len(),
            self.body.len()
        );

        Ok(BuiltPacket {
            packet: self.packet,
            buffers: PacketBuffers::Chained {
                header: header.bytes,
                body: self.body,
            },
        })
    }
}

impl QuicPacketBuilder for RegularPacketBuilder {
    fn remaining_space(&self) -> usize {
        self.remaining
    }

    fn write_bytes(&mut self, data: &[u8]) {
        assert!(data.len() <= self.remaining, "Frame overflows the packet");
        self.body.extend_from_slice(data);
        self.remaining -= data.len();
    }

    fn append_frame(&mut self, frame: QuicWriteFrame) {
        self.packet.frames.push(frame);
    }

    fn last_frame_mut(&mut self) -> Option<&mut QuicWriteFrame> {
        self.packet.frames.last_mut()
    }

    fn frames(&self) -> &[QuicWriteFrame] {
        &self.packet.frames
    }

    fn packet_header(&self) -> &QuicPacketHeader {
        &self.packet.header
    }

    fn write_probe_padding(&mut self, len: usize) -> usize {
        self.body.resize(self.body.len() + len, 0);
        self.remaining = self.remaining.saturating_sub(len);
        self.append_frame(QuicWriteFrame::Padding { num_bytes: len });
        len
    }
}

/// Builds the packet straight into the connection arena, after whatever
/// packets are already batched there.
pub(crate) struct InplacePacketBuilder {
    accessor: BufAccessor,
    buf: Option<ArenaBuf>,
    packet: RegularQuicWritePacket,
    largest_acked: u64,
    remaining: usize,
    cipher_overhead: usize,
    header_start: usize,
    header: Option<EncodedHeader>,
}

impl InplacePacketBuilder {
    pub(crate) fn new(
        accessor: BufAccessor,
        packet_size_limit: usize,
        header: QuicPacketHeader,
        largest_acked: u64,
    ) -> Self {
        let buf = accessor.obtain();
        let header_start = buf.len();
        let remaining = packet_size_limit.min(buf.tailroom());
        Self {
            accessor,
            buf: Some(buf),
            packet: RegularQuicWritePacket::new(header),
            largest_acked,
            remaining,
            cipher_overhead: 0,
            header_start,
            header: None,
        }
    }

    fn arena(&mut self) -> &mut ArenaBuf {
        match self.buf.as_mut() {
            Some(buf) => buf,
            None => unreachable!("Inplace builder only gives the arena back when built"),
        }
    }

    pub(crate) fn encode_packet_header(&mut self) -> Result<()> {
        let encoded = encode_packet_header(&self.packet.header, self.largest_acked)?;
        if encoded.bytes.len() > self.remaining {
            self.remaining = 0;
            return Ok(());
        }
        self.remaining -= encoded.bytes.len();
        self.arena().append(&encoded.bytes);
        self.header = Some(encoded);
        Ok(())
    }

    pub(crate) fn account_for_cipher_overhead(&mut self, overhead: usize) {
        self.cipher_overhead = overhead;
        self.remaining = self.remaining.saturating_sub(overhead);
    }

    pub(crate) fn header_bytes(&self) -> usize {
        self.header.as_ref().map_or(0, |h| h.bytes.len())
    }

    pub(crate) fn build(mut self) -> Result<BuiltPacket> {
        let header = self.header.take();
        let mut buf = match self.buf.take() {
            Some(buf) => buf,
            None => unreachable!("Inplace builder built twice"),
        };

        let result = match header {
            None => Ok(PacketBuffers::NoBody),
            Some(header) => {
                let header_len = header.bytes.len();
                let body_start = self.header_start + header_len;
                let mut body_len = buf.len() - body_start;
                let min_body = minimum_body_size(header.packet_number_length);
                if !self.packet.frames.is_empty() {
                    while body_len + self.cipher_overhead < min_body && self.remaining > 0 {
                        buf.append(&[0]);
                        body_len += 1;
                        self.remaining -= 1;
                    }
                }
                match header.length_field_pos {
                    Some(pos) => {
                        let length =
                            header.packet_number_length as usize + body_len + self.cipher_overhead;
                        let window = &mut buf.data_mut()[self.header_start..body_start];
                        patch_variable_length_two_bytes(window, pos, length as u64)
                            .map(|_| PacketBuffers::Inplace {
                                header_len,
                                body_len,
                            })
                    }
                    None => Ok(PacketBuffers::Inplace {
                        header_len,
                        body_len,
                    }),
                }
            }
        };

        self.accessor.release(buf);
        let placeholder = RegularQuicWritePacket::new(self.packet.header.clone());
        let packet = std::mem::replace(&mut self.packet, placeholder);
        Ok(BuiltPacket {
            packet,
            buffers: result?,
        })
    }
}

impl Drop for InplacePacketBuilder {
    fn drop(&mut self) {
        // Never built, whatever was written for this packet goes away
        if let Some(mut buf) = self.buf.take() {
            let written = buf.len() - self.header_start;
            buf.trim_end(written);
            self.accessor.release(buf);
        }
    }
}

impl QuicPacketBuilder for InplacePacketBuilder {
    fn remaining_space(&self) -> usize {
        self.remaining
    }

    fn write_bytes(&mut self, data: &[u8]) {
        assert!(data.len() <= self.remaining, "Frame overflows the packet");
        self.arena().append(data);
        self.remaining -= data.len();
    }

    fn append_frame(&mut self, frame: QuicWriteFrame) {
        self.packet.frames.push(frame);
    }

    fn last_frame_mut(&mut self) -> Option<&mut QuicWriteFrame> {
        self.packet.frames.last_mut()
    }

    fn frames(&self) -> &[QuicWriteFrame] {
        &self.packet.frames
    }

    fn packet_header(&self) -> &QuicPacketHeader {
        &self.packet.header
    }

    fn write_probe_padding(&mut self, len: usize) -> usize {
        let overhead = self.cipher_overhead;
        let arena = self.arena();
        let len = len.min(arena.tailroom().saturating_sub(overhead));
        let padding = vec![0u8; len];
        arena.append(&padding);
        self.remaining = self.remaining.saturating_sub(len);
        self.append_frame(QuicWriteFrame::Padding { num_bytes: len });
        len
    }
}

/// Either builder, picked once per connection by its data path
pub(crate) enum PacketBuilder {
    Regular(RegularPacketBuilder),
    Inplace(InplacePacketBuilder),
}

impl PacketBuilder {
    pub(crate) fn encode_packet_header(&mut self) -> Result<()> {
        match self {
            PacketBuilder::Regular(b) => b.encode_packet_header(),
            PacketBuilder::Inplace(b) => b.encode_packet_header(),
        }
    }

    pub(crate) fn account_for_cipher_overhead(&mut self, overhead: usize) {
        match self {
            PacketBuilder::Regular(b) => b.account_for_cipher_overhead(overhead),
            PacketBuilder::Inplace(b) => b.account_for_cipher_overhead(overhead),
        }
    }

    /// Zero until a header has been encoded into the packet
    pub(crate) fn header_bytes(&self) -> usize {
        match self {
            PacketBuilder::Regular(b) => b.header_bytes(),
            PacketBuilder::Inplace(b) => b.header_bytes(),
        }
    }

    pub(crate) fn build(self) -> Result<BuiltPacket> {
        match self {
            PacketBuilder::Regular(b) => b.build(),
            PacketBuilder::Inplace(b) => b.build(),
        }
    }

    fn inner(&self) -> &dyn QuicPacketBuilder {
        match self {
            PacketBuilder::Regular(b) => b,
            PacketBuilder::Inplace(b) => b,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn QuicPacketBuilder {
        match self {
            PacketBuilder::Regular(b) => b,
            PacketBuilder::Inplace(b) => b,
        }
    }
}

impl QuicPacketBuilder for PacketBuilder {
    fn remaining_space(&self) -> usize {
        self.inner().remaining_space()
    }

    fn write_bytes(&mut self, data: &[u8]) {
        self.inner_mut().write_bytes(data)
    }

    fn append_frame(&mut self, frame: QuicWriteFrame) {
        self.inner_mut().append_frame(frame)
    }

    fn last_frame_mut(&mut self) -> Option<&mut QuicWriteFrame> {
        self.inner_mut().last_frame_mut()
    }

    fn frames(&self) -> &[QuicWriteFrame] {
        self.inner().frames()
    }

    fn packet_header(&self) -> &QuicPacketHeader {
        self.inner().packet_header()
    }

    fn write_probe_padding(&mut self, len: usize) -> usize {
        self.inner_mut().write_probe_padding(len)
    }
}

/// Caps what frame writers see at the writable byte budget, while the
/// underlying builder keeps its own packet size limit.
pub(crate) struct PacketBuilderWrapper<'a> {
    builder: &'a mut dyn QuicPacketBuilder,
    diff: usize,
}

impl<'a> PacketBuilderWrapper<'a> {
    pub(crate) fn new(builder: &'a mut dyn QuicPacketBuilder, writable_bytes: u64) -> Self {
        let remaining = builder.remaining_space() as u64;
        let diff = remaining.saturating_sub(writable_bytes) as usize;
        Self { builder, diff }
    }
}

impl QuicPacketBuilder for PacketBuilderWrapper<'_> {
    fn remaining_space(&self) -> usize {
        self.builder.remaining_space().saturating_sub(self.diff)
    }

    fn write_bytes(&mut self, data: &[u8]) {
        assert!(data.len() <= self.remaining_space(), "Frame overflows the budget");
        self.builder.write_bytes(data)
    }

    fn append_frame(&mut self, frame: QuicWriteFrame) {
        self.builder.append_frame(frame)
    }

    fn last_frame_mut(&mut self) -> Option<&mut QuicWriteFrame> {
        self.builder.last_frame_mut()
    }

    fn frames(&self) -> &[QuicWriteFrame] {
        self.builder.frames()
    }

    fn packet_header(&self) -> &QuicPacketHeader {
        self.builder.packet_header()
    }

    fn write_probe_padding(&mut self, len: usize) -> usize {
        self.builder.write_probe_padding(len)
    }
}
