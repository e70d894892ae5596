use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::ack::has_acks_to_schedule;
use crate::builder::{
    BuiltPacket, InplacePacketBuilder, PacketBuilder, PacketBuilderWrapper, QuicPacketBuilder,
    RegularPacketBuilder,
};
use crate::config::DEFAULT_ACK_DELAY_EXPONENT;
use crate::connection::{
    D6DProbePacket, QuicConnectionState, QuicEncryptionLevel, QuicLevel, QuicNodeType,
};
use crate::flow_control::{
    generate_max_data_frame, generate_max_stream_data_frame, send_conn_flow_control_bytes_wire,
};
use crate::frame::{
    write_ack_frame, write_crypto_frame, write_frame, write_stream_frame_header, AckFrameMetaData,
    QuicSimpleFrame, QuicWriteFrame,
};
use crate::packet::{HeaderForm, PacketEvent, QuicPacketHeader, RegularQuicWritePacket};

pub(crate) struct SchedulingResult {
    /// Set when the packet is a clone of an outstanding one
    pub(crate) packet_event: Option<PacketEvent>,
    pub(crate) packet: Option<BuiltPacket>,
}

impl SchedulingResult {
    fn nothing() -> Self {
        Self {
            packet_event: None,
            packet: None,
        }
    }
}

/// Fills one packet builder with frames
pub(crate) trait QuicPacketScheduler {
    fn has_data(&self, conn: &QuicConnectionState) -> bool;

    fn schedule_frames_for_packet(
        &mut self,
        conn: &mut QuicConnectionState,
        builder: PacketBuilder,
        writable_bytes: u64,
    ) -> Result<SchedulingResult>;

    fn name(&self) -> &'static str;
}

fn ack_delay_exponent(conn: &QuicConnectionState, header: &QuicPacketHeader) -> u8 {
    match header.header_form() {
        HeaderForm::Long => DEFAULT_ACK_DELAY_EXPONENT,
        HeaderForm::Short => conn.config.get_ack_delay_exponent(),
    }
}

/// Writes an ack of everything `level` has to ack, returning the largest acked
fn write_next_acks(
    conn: &QuicConnectionState,
    level: QuicLevel,
    builder: &mut dyn QuicPacketBuilder,
) -> Result<Option<u64>> {
    let ack_state = conn.ack_state(level);
    let ack_delay = ack_state
        .largest_recvd_packet_time
        .map_or(Duration::ZERO, |t| Instant::now().saturating_duration_since(t));
    let meta = AckFrameMetaData {
        ack_blocks: &ack_state.acks,
        ack_delay,
        ack_delay_exponent: ack_delay_exponent(conn, builder.packet_header()),
    };
    Ok(write_ack_frame(&meta, builder)?.and_then(|frame| frame.largest_acked()))
}

fn pad_client_initial(conn: &QuicConnectionState, builder: &mut PacketBuilder) -> Result<()> {
    if conn.node_type != QuicNodeType::Client || !builder.packet_header().is_initial() {
        return Ok(());
    }
    let remaining = builder.remaining_space();
    if remaining > 0 {
        write_frame(QuicWriteFrame::Padding { num_bytes: remaining }, builder)?;
    }
    Ok(())
}

/// The budget limited view of `builder`, `diff` being how far the packet
/// limit is above the writable bytes
fn capped(builder: &mut PacketBuilder, diff: usize) -> PacketBuilderWrapper<'_> {
    let budget = builder.remaining_space().saturating_sub(diff) as u64;
    PacketBuilderWrapper::new(builder, budget)
}

/// Which frame types a scheduler may write, assembled per write entry point
pub(crate) struct FrameSchedulerBuilder {
    level: QuicEncryptionLevel,
    name: &'static str,
    stream: bool,
    ack: bool,
    reset: bool,
    window_update: bool,
    blocked: bool,
    simple: bool,
    ping: bool,
    crypto: bool,
}

impl FrameSchedulerBuilder {
    pub(crate) fn new(level: QuicEncryptionLevel, name: &'static str) -> Self {
        Self {
            level,
            name,
            stream: false,
            ack: false,
            reset: false,
            window_update: false,
            blocked: false,
            simple: false,
            ping: false,
            crypto: false,
        }
    }

    pub(crate) fn stream_frames(mut self) -> Self {
        self.stream = true;
        self
    }

    pub(crate) fn ack_frames(mut self) -> Self {
        self.ack = true;
        self
    }

    pub(crate) fn reset_frames(mut self) -> Self {
        self.reset = true;
        self
    }

    pub(crate) fn window_update_frames(mut self) -> Self {
        self.window_update = true;
        self
    }

    pub(crate) fn blocked_frames(mut self) -> Self {
        self.blocked = true;
        self
    }

    pub(crate) fn simple_frames(mut self) -> Self {
        self.simple = true;
        self
    }

    pub(crate) fn ping_frames(mut self) -> Self {
        self.ping = true;
        self
    }

    pub(crate) fn crypto_frames(mut self) -> Self {
        self.crypto = true;
        self
    }

    pub(crate) fn build(self) -> QuicFrameScheduler {
        trace!(
            "Frame scheduler {} for {:?}, stream {} ack {} reset {} window {}",
            self.name,
            self.level,
            self.stream,
            self.ack,
            self.reset,
            self.window_update
        );
        trace!(
            "Frame scheduler {} blocked {} simple {} ping {} crypto {}",
            self.name,
            self.blocked,
            self.simple,
            self.ping,
            self.crypto
        );
        QuicFrameScheduler { config: self }
    }
}

/// Writes pending frames in priority order: crypto, resets, acks, window
/// updates, blocked, simple frames, ping and finally stream data.
pub(crate) struct QuicFrameScheduler {
    config: FrameSchedulerBuilder,
}

impl QuicFrameScheduler {
    fn level(&self) -> QuicLevel {
        self.config.level.level()
    }

    fn has_crypto_data(&self, conn: &QuicConnectionState) -> bool {
        self.config.crypto
            && conn
                .crypto
                .stream(self.config.level)
                .is_some_and(|stream| stream.has_pending_data())
    }

    fn has_pending_acks(&self, conn: &QuicConnectionState) -> bool {
        self.config.ack && has_acks_to_schedule(conn.ack_state(self.level()))
    }

    fn has_pending_resets(&self, conn: &QuicConnectionState) -> bool {
        self.config.reset && !conn.pending_events.resets.is_empty()
    }

    fn has_pending_window_updates(&self, conn: &QuicConnectionState) -> bool {
        self.config.window_update
            && (conn.pending_events.conn_window_update || conn.stream_manager.has_window_updates())
    }

    fn has_pending_blocked(&self, conn: &QuicConnectionState) -> bool {
        self.config.blocked
            && (conn.pending_events.send_data_blocked || conn.stream_manager.has_blocked())
    }

    fn has_pending_simple_frames(&self, conn: &QuicConnectionState) -> bool {
        self.config.simple
            && (conn.pending_events.path_challenge.is_some()
                || !conn.pending_events.frames.is_empty())
    }

    fn has_ping(&self, conn: &QuicConnectionState) -> bool {
        self.config.ping && conn.pending_events.send_ping
    }

    fn has_pending_stream_data(&self, conn: &QuicConnectionState) -> bool {
        let manager = &conn.stream_manager;
        self.config.stream
            && (manager.has_loss()
                || (manager.has_writable() && send_conn_flow_control_bytes_wire(conn) > 0))
    }

    fn has_immediate_data(&self, conn: &QuicConnectionState) -> bool {
        self.has_crypto_data(conn)
            || self.has_pending_stream_data(conn)
            || self.has_pending_resets(conn)
            || self.has_pending_window_updates(conn)
            || self.has_pending_blocked(conn)
            || self.has_pending_simple_frames(conn)
            || self.has_ping(conn)
    }

    fn write_crypto_data(
        &self,
        conn: &QuicConnectionState,
        builder: &mut dyn QuicPacketBuilder,
    ) -> Result<bool> {
        let Some(stream) = conn.crypto.stream(self.config.level) else {
            return Ok(false);
        };
        let mut written = 0;
        if let Some(lost) = stream.loss_buffer.first() {
            match write_crypto_frame(builder, lost.offset, &lost.data)? {
                Some(len) => written += len,
                None => return Ok(false),
            }
        }
        if !stream.write_buffer.is_empty() {
            let data = stream.write_buffer.peek(builder.remaining_space());
            if let Some(len) = write_crypto_frame(builder, stream.current_write_offset, &data)? {
                written += len;
            }
        }
        Ok(written > 0)
    }

    fn write_resets(
        &self,
        conn: &QuicConnectionState,
        builder: &mut dyn QuicPacketBuilder,
    ) -> Result<bool> {
        let mut written = false;
        for (stream_id, reset) in conn.pending_events.resets.iter() {
            let frame = QuicWriteFrame::ResetStream {
                stream_id: *stream_id,
                error_code: reset.error_code,
                final_size: reset.final_size,
            };
            if write_frame(frame, builder)? == 0 {
                break;
            }
            written = true;
        }
        Ok(written)
    }

    fn write_window_updates(
        &self,
        conn: &QuicConnectionState,
        builder: &mut dyn QuicPacketBuilder,
    ) -> Result<()> {
        if conn.pending_events.conn_window_update
            && write_frame(generate_max_data_frame(conn), builder)? == 0
        {
            return Ok(());
        }
        for stream_id in conn.stream_manager.window_update_stream_ids() {
            let Some(frame) = generate_max_stream_data_frame(conn, stream_id) else {
                continue;
            };
            if write_frame(frame, builder)? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn write_blocked_frames(
        &self,
        conn: &QuicConnectionState,
        builder: &mut dyn QuicPacketBuilder,
    ) -> Result<()> {
        if conn.pending_events.send_data_blocked {
            let data_limit =
                conn.flow_control.get_sent_offset() + conn.flow_control.get_sent_available_bytes();
            if write_frame(QuicWriteFrame::DataBlocked { data_limit }, builder)? == 0 {
                return Ok(());
            }
        }
        for (stream_id, data_limit) in conn.stream_manager.blocked_streams() {
            let frame = QuicWriteFrame::StreamDataBlocked {
                stream_id,
                data_limit,
            };
            if write_frame(frame, builder)? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn write_simple_frames(
        &self,
        conn: &QuicConnectionState,
        builder: &mut dyn QuicPacketBuilder,
    ) -> Result<()> {
        if let Some(challenge) = conn.pending_events.path_challenge.as_ref() {
            if write_frame(QuicWriteFrame::Simple(challenge.clone()), builder)? == 0 {
                return Ok(());
            }
        }
        for frame in conn.pending_events.frames.iter() {
            // Not enough room
            if write_frame(QuicWriteFrame::Simple(frame.clone()), builder)? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn write_streams(
        &self,
        conn: &QuicConnectionState,
        builder: &mut dyn QuicPacketBuilder,
    ) -> Result<()> {
        let manager = &conn.stream_manager;

        // Lost data is under flow control already
        for stream_id in manager.loss_stream_ids() {
            let Some(stream) = manager.get_stream(stream_id) else {
                continue;
            };
            for lost in stream.send.loss_buffer.iter() {
                let header = write_stream_frame_header(
                    builder,
                    stream_id,
                    lost.offset,
                    lost.len(),
                    u64::MAX,
                    lost.eof,
                )?;
                let Some((len, fin)) = header else {
                    return Ok(());
                };
                builder.write_bytes(&lost.data[..len as usize]);
                builder.append_frame(QuicWriteFrame::Stream {
                    stream_id,
                    offset: lost.offset,
                    len,
                    fin,
                });
            }
        }

        let mut conn_flow_control = send_conn_flow_control_bytes_wire(conn);
        for stream_id in manager.writable_stream_ids() {
            if builder.remaining_space() == 0 {
                break;
            }
            let Some(stream) = manager.get_stream(stream_id) else {
                continue;
            };
            let send = &stream.send;
            let buffer_len = send.write_buffer_len();
            let flow_control = stream.send_flow_control_bytes().min(conn_flow_control);
            let fin = send.final_write_offset == Some(send.current_write_offset + buffer_len);
            let header = write_stream_frame_header(
                builder,
                stream_id,
                send.current_write_offset,
                buffer_len,
                flow_control,
                fin,
            )?;
            let Some((len, fin)) = header else {
                continue;
            };
            builder.write_bytes(&send.write_buffer.peek(len as usize));
            builder.append_frame(QuicWriteFrame::Stream {
                stream_id,
                offset: send.current_write_offset,
                len,
                fin,
            });
            conn_flow_control -= len;
        }
        Ok(())
    }
}

impl QuicPacketScheduler for QuicFrameScheduler {
    fn has_data(&self, conn: &QuicConnectionState) -> bool {
        self.has_pending_acks(conn) || self.has_immediate_data(conn)
    }

    fn schedule_frames_for_packet(
        &mut self,
        conn: &mut QuicConnectionState,
        mut builder: PacketBuilder,
        writable_bytes: u64,
    ) -> Result<SchedulingResult> {
        let conn: &QuicConnectionState = conn;
        builder.encode_packet_header()?;
        // Pure acks may go past the writable bytes, so no early return on a zero budget
        let writable_bytes = writable_bytes.saturating_sub(builder.header_bytes() as u64);
        let diff = (builder.remaining_space() as u64).saturating_sub(writable_bytes) as usize;

        let mut crypto_written = false;
        let mut reset_written = false;
        if self.has_crypto_data(conn) {
            crypto_written = self.write_crypto_data(conn, &mut capped(&mut builder, diff))?;
        }
        if self.has_pending_resets(conn) {
            reset_written = self.write_resets(conn, &mut capped(&mut builder, diff))?;
        }
        if self.has_pending_acks(conn) {
            // With congestion controlled data in the packet the ack respects the budget
            if crypto_written || reset_written {
                write_next_acks(conn, self.level(), &mut capped(&mut builder, diff))?;
            } else {
                write_next_acks(conn, self.level(), &mut builder)?;
            }
        }
        if self.has_pending_window_updates(conn) {
            self.write_window_updates(conn, &mut capped(&mut builder, diff))?;
        }
        if self.has_pending_blocked(conn) {
            self.write_blocked_frames(conn, &mut capped(&mut builder, diff))?;
        }
        // Ahead of stream data, which could take up all the room
        if self.has_pending_simple_frames(conn) {
            self.write_simple_frames(conn, &mut capped(&mut builder, diff))?;
        }
        if self.has_ping(conn) {
            write_frame(QuicWriteFrame::Ping, &mut capped(&mut builder, diff))?;
        }
        if self.has_pending_stream_data(conn) {
            self.write_streams(conn, &mut capped(&mut builder, diff))?;
        }

        if !builder.frames().is_empty() {
            pad_client_initial(conn, &mut builder)?;
        }
        Ok(SchedulingResult {
            packet_event: None,
            packet: Some(builder.build()?),
        })
    }

    fn name(&self) -> &'static str {
        self.config.name
    }
}

fn update_simple_frame_on_packet_clone(
    conn: &QuicConnectionState,
    frame: &QuicSimpleFrame,
) -> Option<QuicSimpleFrame> {
    match frame {
        // A stale challenge is of no use to anybody
        QuicSimpleFrame::PathChallenge { .. } => conn
            .outstanding_path_validation
            .as_ref()
            .filter(|outstanding| *outstanding == frame)
            .cloned(),
        _ => Some(frame.clone()),
    }
}

/// Writes the frames of `packet` again, with current values where they go stale.
/// Returns false when the packet can not be cloned into `builder`.
fn rebuild_from_packet(
    conn: &QuicConnectionState,
    packet: &RegularQuicWritePacket,
    builder: &mut PacketBuilder,
) -> Result<bool> {
    let encryption_level = packet.header.protection_type().encryption_level();
    let mut not_pure_ack = false;
    let mut should_write_window_update = false;
    let mut window_update_written = false;

    for frame in packet.frames.iter() {
        let write_success = match frame {
            QuicWriteFrame::Ack(_) => {
                let level = packet.header.level();
                conn.ack_state(level).acks.is_empty()
                    || write_next_acks(conn, level, builder)?.is_some()
            }
            QuicWriteFrame::Stream {
                stream_id,
                offset,
                len,
                fin,
            } => {
                let retransmission = conn
                    .stream_manager
                    .get_stream(*stream_id)
                    .and_then(|stream| stream.send.retransmission_buffer.get(offset));
                match retransmission {
                    // Acked or reset meanwhile
                    None => true,
                    Some(buf) => {
                        let header = write_stream_frame_header(
                            builder,
                            *stream_id,
                            *offset,
                            buf.len(),
                            buf.len(),
                            *fin,
                        )?;
                        match header {
                            Some((data_len, _)) if data_len == *len => {
                                builder.write_bytes(&buf.data[..data_len as usize]);
                                builder.append_frame(frame.clone());
                                not_pure_ack = true;
                                true
                            }
                            _ => false,
                        }
                    }
                }
            }
            QuicWriteFrame::Crypto { offset, len } => {
                let retransmission = conn
                    .crypto
                    .stream(encryption_level)
                    .and_then(|stream| stream.retransmission_buffer.get(offset));
                match retransmission {
                    None => true,
                    Some(buf) => {
                        let written =
                            write_crypto_frame(builder, *offset, &buf.data)? == Some(*len);
                        not_pure_ack |= written;
                        written
                    }
                }
            }
            QuicWriteFrame::MaxData { .. } => {
                should_write_window_update = true;
                let written = write_frame(generate_max_data_frame(conn), builder)? != 0;
                window_update_written |= written;
                not_pure_ack |= written;
                true
            }
            QuicWriteFrame::MaxStreamData { stream_id, .. } => {
                match generate_max_stream_data_frame(conn, *stream_id) {
                    None => true,
                    Some(update) => {
                        should_write_window_update = true;
                        let written = write_frame(update, builder)? != 0;
                        window_update_written |= written;
                        not_pure_ack |= written;
                        true
                    }
                }
            }
            QuicWriteFrame::Padding { .. } => write_frame(frame.clone(), builder)? != 0,
            QuicWriteFrame::Simple(simple) => {
                match update_simple_frame_on_packet_clone(conn, simple) {
                    None => true,
                    Some(updated) => {
                        let written = write_frame(QuicWriteFrame::Simple(updated), builder)? != 0;
                        not_pure_ack |= written;
                        written
                    }
                }
            }
            _ => {
                let written = write_frame(frame.clone(), builder)? != 0;
                not_pure_ack |= written;
                written
            }
        };
        if !write_success {
            trace!("Failed to clone {} frame", frame.name());
            return Ok(false);
        }
    }

    if should_write_window_update && !window_update_written {
        return Ok(false);
    }
    if !not_pure_ack {
        return Ok(false);
    }
    pad_client_initial(conn, builder)?;
    Ok(true)
}

fn clone_outstanding_packet(
    conn: &mut QuicConnectionState,
    level: QuicLevel,
    index: usize,
) -> PacketEvent {
    let packet = &mut conn.outstandings.packets_mut(level)[index];
    if let Some(event) = packet.associated_event {
        return event;
    }
    let event = PacketEvent {
        level,
        packet_number: packet.packet.header.packet_number(),
    };
    packet.associated_event = Some(event);
    let inserted = conn.outstandings.packet_events.insert(event);
    debug_assert!(inserted, "Packet event {:?} already recorded", event);
    event
}

/// Probe scheduling: new data first, otherwise a copy of the newest
/// outstanding packet that fits.
pub(crate) struct CloningScheduler {
    frame_scheduler: QuicFrameScheduler,
    name: &'static str,
    cipher_overhead: usize,
}

impl CloningScheduler {
    pub(crate) fn new(
        frame_scheduler: QuicFrameScheduler,
        name: &'static str,
        cipher_overhead: usize,
    ) -> Self {
        Self {
            frame_scheduler,
            name,
            cipher_overhead,
        }
    }
}

impl QuicPacketScheduler for CloningScheduler {
    fn has_data(&self, conn: &QuicConnectionState) -> bool {
        self.frame_scheduler.has_data(conn) || conn.outstandings.num_outstanding() > 0
    }

    fn schedule_frames_for_packet(
        &mut self,
        conn: &mut QuicConnectionState,
        builder: PacketBuilder,
        writable_bytes: u64,
    ) -> Result<SchedulingResult> {
        // There may be no room left for a clone then, new data wins anyway
        if self.frame_scheduler.has_data(conn) {
            return self
                .frame_scheduler
                .schedule_frames_for_packet(conn, builder, writable_bytes);
        }

        let header = builder.packet_header().clone();
        let accessor = match builder {
            PacketBuilder::Inplace(_) => conn.buf_accessor.clone(),
            PacketBuilder::Regular(_) => None,
        };
        drop(builder);

        let level = header.level();
        let largest_acked = conn.ack_state(level).largest_acked_by_peer.unwrap_or(0);
        let packet_limit = conn.udp_send_packet_len as usize;
        let size_limit = writable_bytes.saturating_add(self.cipher_overhead as u64);
        let outstandings = &conn.outstandings;
        let candidates: Vec<usize> = outstandings
            .packets(level)
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, packet)| {
                // A copy of it got acked already
                let processed = packet
                    .associated_event
                    .is_some_and(|event| !outstandings.packet_events.contains(&event));
                !processed && packet.metadata.encoded_size <= size_limit
            })
            .map(|(index, _)| index)
            .collect();

        for index in candidates {
            let original = conn.outstandings.packets(level)[index].packet.clone();
            let (mut builder, prev_size) = match accessor.as_ref() {
                Some(accessor) => {
                    let prev_size = accessor.scoped().len();
                    let builder = InplacePacketBuilder::new(
                        accessor.clone(),
                        packet_limit,
                        header.clone(),
                        largest_acked,
                    );
                    (PacketBuilder::Inplace(builder), prev_size)
                }
                None => {
                    let builder =
                        RegularPacketBuilder::new(packet_limit, header.clone(), largest_acked);
                    (PacketBuilder::Regular(builder), 0)
                }
            };
            builder.account_for_cipher_overhead(self.cipher_overhead);
            builder.encode_packet_header()?;

            if rebuild_from_packet(conn, &original, &mut builder)? {
                let event = clone_outstanding_packet(conn, level, index);
                debug!(
                    "{} cloned packet {} into {}",
                    self.name,
                    original.header.packet_number(),
                    header.packet_number()
                );
                return Ok(SchedulingResult {
                    packet_event: Some(event),
                    packet: Some(builder.build()?),
                });
            }

            drop(builder);
            // Whatever the failed attempt wrote stays out of the batch
            if let Some(accessor) = accessor.as_ref() {
                let mut buf = accessor.scoped();
                let written = buf.len() - prev_size;
                buf.trim_end(written);
            }
        }
        Ok(SchedulingResult::nothing())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// A single PING padded to the probe size, larger than what the path is known to carry
pub(crate) struct D6DProbeScheduler {
    name: &'static str,
    cipher_overhead: usize,
    probe_size: u16,
    probe_sent: bool,
}

impl D6DProbeScheduler {
    pub(crate) fn new(name: &'static str, cipher_overhead: usize, probe_size: u16) -> Self {
        Self {
            name,
            cipher_overhead,
            probe_size,
            probe_sent: false,
        }
    }
}

impl QuicPacketScheduler for D6DProbeScheduler {
    fn has_data(&self, _conn: &QuicConnectionState) -> bool {
        !self.probe_sent
    }

    fn schedule_frames_for_packet(
        &mut self,
        conn: &mut QuicConnectionState,
        mut builder: PacketBuilder,
        _writable_bytes: u64,
    ) -> Result<SchedulingResult> {
        builder.encode_packet_header()?;
        if write_frame(QuicWriteFrame::Ping, &mut builder)? == 0 {
            return Ok(SchedulingResult::nothing());
        }
        // One byte went to the ping
        let padding = (self.probe_size as usize)
            .saturating_sub(builder.header_bytes() + self.cipher_overhead + 1);
        builder.write_probe_padding(padding);
        self.probe_sent = true;

        let packet_number = builder.packet_header().packet_number();
        conn.d6d.last_probe = Some(D6DProbePacket {
            packet_number,
            probe_size: self.probe_size,
        });
        debug!(
            "{} built probe {} of {} bytes",
            self.name, packet_number, self.probe_size
        );
        Ok(SchedulingResult {
            packet_event: None,
            packet: Some(builder.build()?),
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
