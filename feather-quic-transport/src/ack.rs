use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::connection::{OutstandingPacket, QuicConnectionState, QuicLevel};
use crate::frame::{AckBlock, QuicSimpleFrame, QuicWriteFrame, WriteAckFrame};
use crate::packet::RegularQuicWritePacket;
use crate::stream::QuicStreamLike;

// Ranges this far below the largest acked packet are never sent again
const ACK_PURGING_THRESH: u64 = 10;
// https://www.rfc-editor.org/rfc/rfc9002.html#name-packet-threshold
const REORDERING_THRESHOLD: u64 = 3;

/// Disjoint, non adjacent inclusive ranges kept in ascending order
#[derive(Default, Clone, PartialEq, Eq)]
pub struct QuicIntervalSet {
    intervals: Vec<AckBlock>,
}

impl std::fmt::Debug for QuicIntervalSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.intervals
            .iter()
            .try_for_each(|b| write!(f, "[{}, {}], ", b.start, b.end))
    }
}

impl QuicIntervalSet {
    pub fn insert(&mut self, start: u64, end: u64) {
        assert!(start <= end, "Bad interval [{start}, {end}]");
        let mut merged = AckBlock { start, end };
        let mut out = Vec::with_capacity(self.intervals.len() + 1);
        let mut placed = false;
        for block in self.intervals.drain(..) {
            if block.end.saturating_add(1) < merged.start {
                out.push(block);
            } else if merged.end.saturating_add(1) < block.start {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(block);
            } else {
                merged.start = merged.start.min(block.start);
                merged.end = merged.end.max(block.end);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.intervals = out;
    }

    /// Removes every packet number in `[start, end]`
    pub fn withdraw(&mut self, start: u64, end: u64) {
        let mut out = Vec::with_capacity(self.intervals.len() + 1);
        for block in self.intervals.drain(..) {
            if block.end < start || block.start > end {
                out.push(block);
                continue;
            }
            if block.start < start {
                out.push(AckBlock {
                    start: block.start,
                    end: start - 1,
                });
            }
            if block.end > end {
                out.push(AckBlock {
                    start: end + 1,
                    end: block.end,
                });
            }
        }
        self.intervals = out;
    }

    pub fn contains(&self, pn: u64) -> bool {
        self.intervals.iter().any(|b| b.start <= pn && pn <= b.end)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AckBlock> {
        self.intervals.iter()
    }

    pub fn last(&self) -> Option<&AckBlock> {
        self.intervals.last()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }
}

/// Per packet number space ack bookkeeping
#[derive(Debug, Default)]
pub struct AckState {
    /// Received packet numbers that still have to be acked
    pub(crate) acks: QuicIntervalSet,
    pub(crate) largest_acked_by_peer: Option<u64>,
    pub(crate) largest_ack_scheduled: Option<u64>,
    pub(crate) largest_recvd_packet_time: Option<Instant>,
    pub(crate) next_packet_num: u64,
    pub(crate) needs_to_send_ack_immediately: bool,
    pub(crate) num_rx_packets_recvd: u64,
    pub(crate) num_non_rx_packets_recvd: u64,
}

impl AckState {
    /// Records a received packet that has to be acked
    pub fn on_packet_received(&mut self, pn: u64, retransmittable: bool, now: Instant) {
        self.acks.insert(pn, pn);
        if self.acks.last().is_some_and(|b| b.end == pn) {
            self.largest_recvd_packet_time = Some(now);
        }
        if retransmittable {
            self.num_rx_packets_recvd += 1;
        } else {
            self.num_non_rx_packets_recvd += 1;
        }
    }

    pub fn set_needs_to_send_ack_immediately(&mut self, immediately: bool) {
        self.needs_to_send_ack_immediately = immediately;
    }

    pub fn largest_acked_by_peer(&self) -> Option<u64> {
        self.largest_acked_by_peer
    }

    pub fn largest_ack_scheduled(&self) -> Option<u64> {
        self.largest_ack_scheduled
    }

    pub fn next_packet_num(&self) -> u64 {
        self.next_packet_num
    }

    pub fn needs_to_send_ack_immediately(&self) -> bool {
        self.needs_to_send_ack_immediately
    }

    pub fn acks(&self) -> &QuicIntervalSet {
        &self.acks
    }
}

pub(crate) fn largest_ack_to_send(ack_state: &AckState) -> Option<u64> {
    ack_state.acks.last().map(|b| b.end)
}

pub(crate) fn has_acks_to_schedule(ack_state: &AckState) -> bool {
    match (largest_ack_to_send(ack_state), ack_state.largest_ack_scheduled) {
        (None, _) => false,
        // Never scheduled an ack, need to send
        (Some(_), None) => true,
        (Some(largest), Some(scheduled)) => largest > scheduled,
    }
}

pub(crate) fn update_ack_send_state_on_sent_packet_with_acks(
    ack_state: &mut AckState,
    largest_ack_scheduled: u64,
) {
    ack_state.needs_to_send_ack_immediately = false;
    ack_state.num_rx_packets_recvd = 0;
    ack_state.num_non_rx_packets_recvd = 0;
    ack_state.largest_ack_scheduled = Some(largest_ack_scheduled);
}

/// Purges ack ranges the peer has confirmed receiving
pub(crate) fn common_ack_visitor_for_ack_frame(ack_state: &mut AckState, frame: &WriteAckFrame) {
    if let Some(largest) = frame.largest_acked() {
        if largest > ACK_PURGING_THRESH {
            ack_state.acks.withdraw(0, largest - ACK_PURGING_THRESH);
        }
    }
}

/// Drops acked bytes from the retransmission buffer
pub(crate) fn process_stream_ack(stream: &mut QuicStreamLike, offset: u64, len: u64, fin: bool) {
    match stream.retransmission_buffer.get(&offset) {
        Some(buf) if buf.len() == len && buf.eof == fin => {
            stream.retransmission_buffer.remove(&offset);
        }
        // Data acked through another copy of the packet, or reset meanwhile
        _ => trace!("Acked stream data at {} is gone, len {}", offset, len),
    }
}

pub(crate) fn process_crypto_stream_ack(stream: &mut QuicStreamLike, offset: u64, len: u64) {
    match stream.retransmission_buffer.get(&offset) {
        Some(buf) if buf.len() == len => {
            stream.retransmission_buffer.remove(&offset);
        }
        // It's possible retransmissions of crypto data were canceled
        _ => trace!("Acked crypto data at {} is gone, len {}", offset, len),
    }
}

/// The ack frame as a peer would have sent it
#[derive(Debug, Clone)]
pub struct ReadAckFrame {
    pub largest_acked: u64,
    pub ack_delay: Duration,
    /// Inclusive ranges, largest first
    pub ack_blocks: Vec<AckBlock>,
    pub implicit: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AckEvent {
    pub acked_packets: u64,
    pub acked_bytes: u64,
    pub lost_packets: u64,
}

fn on_packet_removed(conn: &mut QuicConnectionState, level: QuicLevel, packet: &OutstandingPacket) {
    conn.loss_state.inflight_bytes = conn
        .loss_state
        .inflight_bytes
        .saturating_sub(packet.metadata.encoded_size);
    if packet.metadata.is_handshake && packet.associated_event.is_none() {
        let counter = match level {
            QuicLevel::Initial => &mut conn.outstandings.initial_packets_count,
            _ => &mut conn.outstandings.handshake_packets_count,
        };
        *counter = counter.saturating_sub(1);
    }
    if packet.associated_event.is_some() {
        conn.outstandings.cloned_packets_count =
            conn.outstandings.cloned_packets_count.saturating_sub(1);
    }
    if packet.metadata.is_d6d_probe {
        conn.d6d.outstanding_probes = conn.d6d.outstanding_probes.saturating_sub(1);
    }
}

/// Consumes an ack for `level`: acked packets leave the outstanding set and
/// have their frames visited once per packet event, packets far enough
/// below the largest acked are declared lost.
pub fn process_ack_frame<A, L>(
    conn: &mut QuicConnectionState,
    level: QuicLevel,
    frame: &ReadAckFrame,
    mut ack_visitor: A,
    mut loss_visitor: L,
    now: Instant,
) -> AckEvent
where
    A: FnMut(&mut QuicConnectionState, &OutstandingPacket, &QuicWriteFrame),
    L: FnMut(&mut QuicConnectionState, &RegularQuicWritePacket, bool),
{
    let mut ack_event = AckEvent::default();
    let is_acked = |pn: u64| frame.ack_blocks.iter().any(|b| b.start <= pn && pn <= b.end);

    let outstanding = std::mem::take(conn.outstandings.packets_mut(level));
    let (acked, remaining): (VecDeque<_>, VecDeque<_>) = outstanding
        .into_iter()
        .partition(|p| is_acked(p.packet.header.packet_number()));
    *conn.outstandings.packets_mut(level) = remaining;

    let ack_state = conn.ack_state_mut(level);
    ack_state.largest_acked_by_peer = Some(
        ack_state
            .largest_acked_by_peer
            .map_or(frame.largest_acked, |l| l.max(frame.largest_acked)),
    );

    for packet in acked {
        on_packet_removed(conn, level, &packet);
        ack_event.acked_packets += 1;
        ack_event.acked_bytes += packet.metadata.encoded_size;

        // Only the first copy of a cloned packet to be acked gets its frames visited
        let visit = match packet.associated_event {
            Some(event) => conn.outstandings.packet_events.remove(&event),
            None => true,
        };
        if visit {
            for frame in packet.packet.frames.iter() {
                ack_visitor(conn, &packet, frame);
            }
        }
    }
    conn.loss_state.total_bytes_acked += ack_event.acked_bytes;

    // Packet threshold loss detection
    let outstanding = std::mem::take(conn.outstandings.packets_mut(level));
    let (lost, remaining): (VecDeque<_>, VecDeque<_>) = outstanding.into_iter().partition(|p| {
        let pn = p.packet.header.packet_number();
        pn < frame.largest_acked && frame.largest_acked - pn >= REORDERING_THRESHOLD
    });
    *conn.outstandings.packets_mut(level) = remaining;

    for packet in lost {
        on_packet_removed(conn, level, &packet);
        ack_event.lost_packets += 1;
        let processed = packet
            .associated_event
            .is_some_and(|event| !conn.outstandings.packet_events.contains(&event));
        debug!(
            "Packet {} in {:?} is lost, processed {}",
            packet.packet.header.packet_number(),
            level,
            processed
        );
        loss_visitor(conn, &packet.packet, processed);
    }

    trace!(
        "Processed {}ack for {:?}: {:?}",
        if frame.implicit { "implicit " } else { "" },
        level,
        ack_event
    );
    ack_event
}

/// The ack visitor for acks that arrive from the peer
pub fn default_ack_visitor(
    conn: &mut QuicConnectionState,
    packet: &OutstandingPacket,
    frame: &QuicWriteFrame,
) {
    match frame {
        QuicWriteFrame::Stream {
            stream_id,
            offset,
            len,
            fin,
        } => {
            if let Some(stream) = conn.stream_manager.get_stream_mut(*stream_id) {
                process_stream_ack(&mut stream.send, *offset, *len, *fin);
            }
        }
        QuicWriteFrame::Crypto { offset, len } => {
            let level = packet.packet.header.protection_type().encryption_level();
            if let Some(stream) = conn.crypto.stream_mut(level) {
                process_crypto_stream_ack(stream, *offset, *len);
            }
        }
        QuicWriteFrame::Ack(ack) => {
            let level = packet.packet.header.level();
            common_ack_visitor_for_ack_frame(conn.ack_state_mut(level), ack);
        }
        _ => {}
    }
}

fn update_simple_frame_on_packet_loss(conn: &mut QuicConnectionState, frame: &QuicSimpleFrame) {
    match frame {
        QuicSimpleFrame::PathChallenge { .. } => {
            if conn.outstanding_path_validation.as_ref() == Some(frame) {
                conn.pending_events.path_challenge = Some(frame.clone());
            }
        }
        // Responses are only good for the challenge they answered
        QuicSimpleFrame::PathResponse { .. } => {}
        _ => conn.pending_events.frames.push(frame.clone()),
    }
}

/// Moves the data of a lost packet back to where the schedulers pick it up again
pub fn mark_packet_loss(
    conn: &mut QuicConnectionState,
    packet: &RegularQuicWritePacket,
    processed: bool,
) {
    for frame in packet.frames.iter() {
        match frame {
            QuicWriteFrame::Stream {
                stream_id, offset, ..
            } => {
                let stream = match conn.stream_manager.get_stream_mut(*stream_id) {
                    Some(stream) => stream,
                    None => continue,
                };
                // The stream might have been reset after the packet was sent
                if let Some(buf) = stream.send.retransmission_buffer.remove(offset) {
                    stream.send.insert_into_loss_buffer(buf);
                }
                conn.stream_manager.update_loss_streams(*stream_id);
            }
            QuicWriteFrame::Crypto { offset, .. } => {
                let level = packet.header.protection_type().encryption_level();
                if let Some(stream) = conn.crypto.stream_mut(level) {
                    if let Some(buf) = stream.retransmission_buffer.remove(offset) {
                        stream.insert_into_loss_buffer(buf);
                    }
                }
            }
            QuicWriteFrame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                if processed || conn.stream_manager.get_stream(*stream_id).is_none() {
                    continue;
                }
                conn.pending_events
                    .resets
                    .entry(*stream_id)
                    .or_insert(crate::connection::PendingReset {
                        error_code: *error_code,
                        final_size: *final_size,
                    });
            }
            QuicWriteFrame::MaxData { .. } => {
                if !processed {
                    conn.pending_events.conn_window_update = true;
                }
            }
            QuicWriteFrame::MaxStreamData { stream_id, .. } => {
                if !processed && conn.stream_manager.get_stream(*stream_id).is_some() {
                    conn.stream_manager.queue_window_update(*stream_id);
                }
            }
            QuicWriteFrame::Simple(simple) => {
                if !processed {
                    update_simple_frame_on_packet_loss(conn, simple);
                }
            }
            _ => {}
        }
    }
    info!(
        "Marked packet {} lost, {} frames",
        packet.header.packet_number(),
        packet.frames.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_connection, send_stream_packet, TestTransport};

    #[test]
    fn test_interval_set_insert_merges() {
        let mut set = QuicIntervalSet::default();
        set.insert(5, 6);
        set.insert(1, 2);
        set.insert(9, 9);
        assert_eq!(set.len(), 3);

        set.insert(3, 4);
        assert_eq!(
            set.iter().copied().collect::<Vec<_>>(),
            vec![AckBlock { start: 1, end: 6 }, AckBlock { start: 9, end: 9 }]
        );
        set.insert(7, 8);
        assert_eq!(set.len(), 1);
        assert!(set.contains(8));
    }

    #[test]
    fn test_interval_set_withdraw() {
        let mut set = QuicIntervalSet::default();
        set.insert(0, 20);
        set.withdraw(5, 9);
        assert_eq!(
            set.iter().copied().collect::<Vec<_>>(),
            vec![AckBlock { start: 0, end: 4 }, AckBlock { start: 10, end: 20 }]
        );
        set.withdraw(0, 15);
        assert_eq!(set.last(), Some(&AckBlock { start: 16, end: 20 }));
    }

    #[test]
    fn test_has_acks_to_schedule() {
        let mut ack_state = AckState::default();
        assert!(!has_acks_to_schedule(&ack_state));

        ack_state.on_packet_received(3, true, Instant::now());
        assert!(has_acks_to_schedule(&ack_state));

        update_ack_send_state_on_sent_packet_with_acks(&mut ack_state, 3);
        assert!(!has_acks_to_schedule(&ack_state));
        assert_eq!(ack_state.num_rx_packets_recvd, 0);

        ack_state.on_packet_received(4, false, Instant::now());
        assert!(has_acks_to_schedule(&ack_state));
    }

    #[test]
    fn test_common_ack_visitor_purges_old_ranges() {
        let mut ack_state = AckState::default();
        ack_state.acks.insert(0, 30);
        let frame = WriteAckFrame {
            ack_blocks: vec![AckBlock { start: 0, end: 30 }],
            ack_delay: Duration::ZERO,
        };
        common_ack_visitor_for_ack_frame(&mut ack_state, &frame);
        assert_eq!(ack_state.acks.last(), Some(&AckBlock { start: 21, end: 30 }));
    }

    #[test]
    fn test_ack_and_loss_move_stream_data() {
        let mut transport = TestTransport::new();
        let mut conn = create_test_connection();
        conn.stream_manager.write_stream_data(0, &[7u8; 4000], false);

        for _ in 0..4 {
            send_stream_packet(&mut conn, &mut transport);
        }
        assert_eq!(conn.outstandings.packets(QuicLevel::Application).len(), 4);
        let retx_before = conn
            .stream_manager
            .get_stream(0)
            .unwrap()
            .send
            .retransmission_buffer
            .len();
        assert_eq!(retx_before, 4);

        let largest = conn.ack_state(QuicLevel::Application).next_packet_num - 1;
        let ack = ReadAckFrame {
            largest_acked: largest,
            ack_delay: Duration::ZERO,
            ack_blocks: vec![AckBlock {
                start: largest,
                end: largest,
            }],
            implicit: false,
        };
        let event = process_ack_frame(
            &mut conn,
            QuicLevel::Application,
            &ack,
            default_ack_visitor,
            mark_packet_loss,
            Instant::now(),
        );
        assert_eq!(event.acked_packets, 1);
        // Only the oldest packet is 3 packets behind the largest acked
        assert_eq!(event.lost_packets, 1);
        assert_eq!(conn.outstandings.packets(QuicLevel::Application).len(), 2);

        let stream = conn.stream_manager.get_stream(0).unwrap();
        assert_eq!(stream.send.retransmission_buffer.len(), 2);
        assert_eq!(stream.send.loss_buffer.len(), 1);
        assert_eq!(stream.send.loss_buffer[0].offset, 0);
        assert_eq!(
            conn.ack_state(QuicLevel::Application).largest_acked_by_peer,
            Some(largest)
        );
        assert!(conn.stream_manager.has_writable());
    }
}
