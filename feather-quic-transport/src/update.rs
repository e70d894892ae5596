use std::time::Instant;
use tracing::{debug, trace};

use crate::ack::update_ack_send_state_on_sent_packet_with_acks;
use crate::connection::{
    LossState, OutstandingPacket, OutstandingPacketMetadata, QuicConnectionState,
    QuicEncryptionLevel, QuicLevel,
};
use crate::flow_control::{
    maybe_write_blocked_after_socket_write, maybe_write_data_blocked_after_socket_write,
    on_conn_window_update_sent, on_stream_window_update_sent,
    update_flow_control_on_write_to_socket,
};
use crate::frame::{QuicSimpleFrame, QuicWriteFrame};
use crate::packet::{PacketEvent, RegularQuicWritePacket};
use crate::stats::QuicTransportStatsCallback;
use crate::stream::{QuicStreamLike, StreamBuffer};

/// Moves the bytes a sent frame carried into the retransmission buffer.
///
/// Returns true only for new data. Lost data that got sent again and data
/// in a cloned packet are already accounted for in flow control.
pub(crate) fn handle_stream_written(
    stream: &mut QuicStreamLike,
    offset: u64,
    len: u64,
    fin: bool,
    loss_state: &mut LossState,
    stats: Option<&dyn QuicTransportStatsCallback>,
) -> bool {
    if offset == stream.current_write_offset {
        stream.current_write_offset += len + u64::from(fin);
        let data = stream.write_buffer.split_at_most(len as usize);
        debug_assert_eq!(data.len() as u64, len);
        let previous = stream
            .retransmission_buffer
            .insert(offset, StreamBuffer::new(offset, data, fin));
        assert!(previous.is_none(), "Stream data at {} sent twice as new", offset);
        stream.num_packets_tx_with_new_data += 1;
        return true;
    }

    if let Some(pos) = stream.loss_buffer.iter().position(|b| b.offset == offset) {
        let lost = &mut stream.loss_buffer[pos];
        let mut buf = if lost.len() == len && lost.eof == fin {
            stream.loss_buffer.remove(pos)
        } else {
            lost.split_front(len)
        };
        buf.eof = fin;
        stream.retransmission_buffer.insert(offset, buf);
        loss_state.total_bytes_retransmitted += len;
        if let Some(stats) = stats {
            stats.on_packet_retransmission();
        }
        trace!("Retransmitted {} lost bytes at {}", len, offset);
        return false;
    }

    // A clone of a packet that is still outstanding
    loss_state.total_stream_bytes_cloned += len;
    false
}

pub(crate) fn update_simple_frame_on_packet_sent(
    conn: &mut QuicConnectionState,
    frame: &QuicSimpleFrame,
) {
    match frame {
        QuicSimpleFrame::PathChallenge { .. } => {
            conn.outstanding_path_validation = Some(frame.clone());
            conn.pending_events.path_challenge = None;
            conn.pending_events.schedule_path_validation_timeout = true;
        }
        _ => {
            let frames = &mut conn.pending_events.frames;
            if let Some(pos) = frames.iter().position(|f| f == frame) {
                frames.remove(pos);
            }
        }
    }
}

/// Bookkeeping after a packet went into the write batch: the pending state
/// its frames satisfy is cleared, counters move, and ack eliciting packets
/// join the outstanding set of their packet number space.
pub(crate) fn update_connection(
    conn: &mut QuicConnectionState,
    packet_event: Option<PacketEvent>,
    packet: RegularQuicWritePacket,
    sent_time: Instant,
    encoded_size: u64,
) {
    let packet_num = packet.header.packet_number();
    let level = packet.header.level();
    let encryption_level = packet.header.protection_type().encryption_level();
    let is_d6d_probe = level == QuicLevel::Application
        && conn
            .d6d
            .last_probe
            .is_some_and(|probe| probe.packet_number == packet_num);

    let mut retransmittable = false;
    let mut is_handshake = false;
    let mut is_ping = false;
    let mut ack_frame_written = false;
    let mut conn_window_update_written = false;
    let stats = conn.stats.clone();

    for frame in packet.frames.iter() {
        match frame {
            QuicWriteFrame::Stream {
                stream_id,
                offset,
                len,
                fin,
            } => {
                retransmittable = true;
                let Some(stream) = conn.stream_manager.get_stream_mut(*stream_id) else {
                    panic!("Sent data on unknown stream {}", stream_id);
                };
                let new_data = handle_stream_written(
                    &mut stream.send,
                    *offset,
                    *len,
                    *fin,
                    &mut conn.loss_state,
                    stats.as_deref(),
                );
                if new_data {
                    update_flow_control_on_write_to_socket(conn, *len);
                    maybe_write_blocked_after_socket_write(conn, *stream_id);
                    maybe_write_data_blocked_after_socket_write(conn);
                    conn.stream_manager.add_tx(*stream_id);
                }
                conn.stream_manager.update_writable_streams(*stream_id);
                conn.stream_manager.update_loss_streams(*stream_id);
            }
            QuicWriteFrame::Crypto { offset, len } => {
                retransmittable = true;
                is_handshake = matches!(
                    encryption_level,
                    QuicEncryptionLevel::Initial | QuicEncryptionLevel::Handshake
                );
                let Some(stream) = conn.crypto.stream_mut(encryption_level) else {
                    panic!("No crypto stream for {:?}", encryption_level);
                };
                handle_stream_written(
                    stream,
                    *offset,
                    *len,
                    false,
                    &mut conn.loss_state,
                    stats.as_deref(),
                );
            }
            QuicWriteFrame::Ack(ack) => {
                assert!(!ack_frame_written, "More than one ack in packet {}", packet_num);
                ack_frame_written = true;
                if let Some(largest) = ack.largest_acked() {
                    update_ack_send_state_on_sent_packet_with_acks(
                        conn.ack_state_mut(level),
                        largest,
                    );
                }
            }
            QuicWriteFrame::ResetStream { stream_id, .. } => {
                retransmittable = true;
                let removed = conn.pending_events.resets.remove(stream_id).is_some();
                debug_assert!(
                    removed || packet_event.is_some(),
                    "Reset of stream {} was not pending",
                    stream_id
                );
            }
            QuicWriteFrame::MaxData { maximum_data } => {
                assert!(
                    !conn_window_update_written,
                    "More than one connection window update in packet {}",
                    packet_num
                );
                conn_window_update_written = true;
                retransmittable = true;
                on_conn_window_update_sent(conn, *maximum_data, sent_time);
            }
            QuicWriteFrame::DataBlocked { .. } => {
                retransmittable = true;
                conn.pending_events.send_data_blocked = false;
            }
            QuicWriteFrame::MaxStreamData {
                stream_id,
                maximum_data,
            } => {
                retransmittable = true;
                on_stream_window_update_sent(conn, *stream_id, *maximum_data, sent_time);
            }
            QuicWriteFrame::StreamDataBlocked { stream_id, .. } => {
                retransmittable = true;
                conn.stream_manager.remove_blocked(*stream_id);
            }
            QuicWriteFrame::Ping => {
                // A probe may get dropped for its size alone, it is no requested ping
                if !is_d6d_probe {
                    conn.pending_events.send_ping = false;
                }
                is_ping = true;
            }
            QuicWriteFrame::Simple(simple) => {
                retransmittable = true;
                if packet_event.is_none() {
                    update_simple_frame_on_packet_sent(conn, simple);
                }
            }
            // Padding never counts towards the congestion window
            QuicWriteFrame::Padding { .. } => {}
            _ => retransmittable = true,
        }
    }

    conn.increase_next_packet_num(level);
    conn.loss_state.largest_sent = Some(
        conn.loss_state
            .largest_sent
            .map_or(packet_num, |largest| largest.max(packet_num)),
    );
    // Several packets are written per loop, an earlier one may have asked for the alarm already
    if !conn.pending_events.set_loss_detection_alarm {
        conn.pending_events.set_loss_detection_alarm = retransmittable;
    }
    conn.loss_state.total_bytes_sent += encoded_size;
    conn.loss_state.total_packets_sent += 1;

    if !retransmittable && !is_ping {
        debug_assert!(packet_event.is_none());
        trace!("Packet {} in {:?} is not ack eliciting", packet_num, level);
        return;
    }
    conn.loss_state.total_ack_eliciting_packets_sent += 1;

    let metadata = OutstandingPacketMetadata {
        time: sent_time,
        encoded_size,
        is_handshake,
        is_d6d_probe,
        total_bytes_sent: conn.loss_state.total_bytes_sent,
        inflight_bytes: conn.loss_state.inflight_bytes + encoded_size,
        packets_inflight: conn.outstandings.num_outstanding() + 1,
        is_app_limited: conn
            .congestion_controller
            .as_ref()
            .is_some_and(|cc| cc.is_app_limited()),
    };
    if is_d6d_probe {
        conn.d6d.outstanding_probes += 1;
        conn.d6d.total_txed_probes += 1;
    }
    if let Some(event) = packet_event {
        debug_assert!(conn.outstandings.packet_events.contains(&event));
        conn.loss_state.total_bytes_cloned += encoded_size;
    }

    let packets = conn.outstandings.packets_mut(level);
    // Packets are mostly sent in order, look from the back
    let pos = packets
        .iter()
        .rposition(|p| p.packet.header.packet_number() < packet_num)
        .map_or(0, |i| i + 1);
    packets.insert(
        pos,
        OutstandingPacket {
            packet,
            metadata,
            associated_event: packet_event,
        },
    );

    if let Some(cc) = conn.congestion_controller.as_mut() {
        cc.on_packet_sent(&conn.outstandings.packets(level)[pos]);
    }
    if let Some(pacer) = conn.pacer.as_mut() {
        pacer.on_packet_sent();
    }
    if conn.pending_events.path_challenge.is_some() || conn.outstanding_path_validation.is_some() {
        if let Some(limiter) = conn.path_validation_limiter.as_mut() {
            limiter.on_packet_sent(encoded_size);
        }
    }
    if is_handshake && packet_event.is_none() {
        match level {
            QuicLevel::Initial => conn.outstandings.initial_packets_count += 1,
            _ => conn.outstandings.handshake_packets_count += 1,
        }
    }
    conn.loss_state.last_retransmittable_packet_sent_time = Some(sent_time);
    if packet_event.is_some() {
        conn.outstandings.cloned_packets_count += 1;
        conn.loss_state.timeout_based_rtx_count += 1;
    }
    conn.loss_state.inflight_bytes += encoded_size;

    debug!(
        "Packet {} in {:?} outstanding, {} bytes, inflight {} bytes",
        packet_num, level, encoded_size, conn.loss_state.inflight_bytes
    );
    let num_outstanding = conn.outstandings.num_outstanding();
    debug_assert!(num_outstanding >= conn.outstandings.initial_packets_count);
    debug_assert!(num_outstanding >= conn.outstandings.handshake_packets_count);
    debug_assert!(num_outstanding >= conn.outstandings.cloned_packets_count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{HeaderBuilder, LongHeaderType, QuicProtectionType, QUIC_VERSION};
    use crate::frame::{AckBlock, WriteAckFrame};
    use crate::stats::QuicTransportStats;
    use crate::test_utils::{create_test_connection, MockCongestionController};
    use std::rc::Rc;
    use std::time::Duration;

    fn app_packet(conn: &QuicConnectionState, pn: u64) -> RegularQuicWritePacket {
        let header = HeaderBuilder::Short(QuicProtectionType::KeyPhaseZero).build(
            &conn.src_connection_id,
            &conn.dst_connection_id,
            pn,
            QUIC_VERSION,
            &[],
        );
        RegularQuicWritePacket::new(header)
    }

    fn outstanding_pns(conn: &QuicConnectionState) -> Vec<u64> {
        conn.outstandings
            .packets(QuicLevel::Application)
            .iter()
            .map(|p| p.packet.header.packet_number())
            .collect()
    }

    #[test]
    fn test_new_data_moves_to_retransmission_buffer() {
        let mut conn = create_test_connection();
        conn.stream_manager.write_stream_data(0, &[5u8; 100], true);

        let mut packet = app_packet(&conn, 0);
        packet.frames.push(QuicWriteFrame::Stream {
            stream_id: 0,
            offset: 0,
            len: 100,
            fin: true,
        });
        update_connection(&mut conn, None, packet, Instant::now(), 140);

        let stream = conn.stream_manager.get_stream(0).unwrap();
        assert_eq!(stream.send.current_write_offset, 101);
        assert!(stream.send.write_buffer.is_empty());
        let buf = stream.send.retransmission_buffer.get(&0).unwrap();
        assert_eq!(buf.len(), 100);
        assert!(buf.eof);
        assert_eq!(stream.send.num_packets_tx_with_new_data, 1);
        assert_eq!(conn.flow_control.get_sent_offset(), 100);
        assert!(conn.stream_manager.tx_streams().contains(&0));
        assert!(!conn.stream_manager.has_writable());
        assert!(conn.pending_events.set_loss_detection_alarm);
        assert_eq!(conn.loss_state.inflight_bytes, 140);
        assert_eq!(conn.next_packet_num(QuicLevel::Application), 1);
    }

    #[test]
    fn test_partial_loss_retransmission() {
        let stats = QuicTransportStats::new();
        let stats_cb: &dyn QuicTransportStatsCallback = &stats;
        let mut loss_state = LossState::default();
        let mut stream = QuicStreamLike::default();
        stream.current_write_offset = 300;
        stream.insert_into_loss_buffer(StreamBuffer::new(100, vec![1; 200], true));

        assert!(!handle_stream_written(
            &mut stream,
            100,
            50,
            false,
            &mut loss_state,
            Some(stats_cb)
        ));
        assert_eq!(stream.loss_buffer[0].offset, 150);
        assert!(stream.loss_buffer[0].eof);
        assert_eq!(stream.retransmission_buffer.get(&100).unwrap().len(), 50);

        assert!(!handle_stream_written(
            &mut stream,
            150,
            150,
            true,
            &mut loss_state,
            Some(stats_cb)
        ));
        assert!(stream.loss_buffer.is_empty());
        assert!(stream.retransmission_buffer.get(&150).unwrap().eof);
        assert_eq!(loss_state.total_bytes_retransmitted, 200);
        assert_eq!(stats.packets_retransmitted(), 2);

        // Neither new nor lost, so a clone
        assert!(!handle_stream_written(&mut stream, 100, 50, false, &mut loss_state, None));
        assert_eq!(loss_state.total_stream_bytes_cloned, 50);
    }

    #[test]
    fn test_pure_ack_and_padding_are_not_outstanding() {
        let mut conn = create_test_connection();
        conn.ack_state_mut(QuicLevel::Application)
            .on_packet_received(7, true, Instant::now());

        let mut packet = app_packet(&conn, 0);
        packet.frames.push(QuicWriteFrame::Ack(WriteAckFrame {
            ack_blocks: vec![AckBlock { start: 7, end: 7 }],
            ack_delay: Duration::ZERO,
        }));
        packet.frames.push(QuicWriteFrame::Padding { num_bytes: 20 });
        update_connection(&mut conn, None, packet, Instant::now(), 50);

        assert_eq!(conn.outstandings.num_outstanding(), 0);
        assert_eq!(conn.loss_state.total_packets_sent, 1);
        assert_eq!(conn.loss_state.total_bytes_sent, 50);
        assert_eq!(conn.loss_state.total_ack_eliciting_packets_sent, 0);
        assert_eq!(conn.loss_state.inflight_bytes, 0);
        assert!(!conn.pending_events.set_loss_detection_alarm);
        assert_eq!(
            conn.ack_state(QuicLevel::Application).largest_ack_scheduled,
            Some(7)
        );
    }

    #[test]
    fn test_outstanding_packets_stay_ordered() {
        let mut conn = create_test_connection();
        for pn in [0, 1, 4, 2, 3] {
            let mut packet = app_packet(&conn, pn);
            packet.frames.push(QuicWriteFrame::Ping);
            update_connection(&mut conn, None, packet, Instant::now(), 30);
        }
        assert_eq!(outstanding_pns(&conn), vec![0, 1, 2, 3, 4]);
        assert_eq!(conn.loss_state.largest_sent, Some(4));

        let inflight: Vec<u64> = conn
            .outstandings
            .packets(QuicLevel::Application)
            .iter()
            .map(|p| p.metadata.packets_inflight)
            .collect();
        // Counted at insertion time, before any reordering
        assert_eq!(inflight, vec![1, 2, 4, 5, 3]);
    }

    #[test]
    fn test_cloned_packet_accounting() {
        let mut conn = create_test_connection();
        let cc = MockCongestionController::new(10_000);
        let sent_packets = cc.sent_packets.clone();
        conn.set_congestion_controller(Box::new(cc));

        let event = PacketEvent {
            level: QuicLevel::Application,
            packet_number: 0,
        };
        conn.outstandings.packet_events.insert(event);
        let mut packet = app_packet(&conn, 3);
        packet.frames.push(QuicWriteFrame::MaxData { maximum_data: 1000 });
        update_connection(&mut conn, Some(event), packet, Instant::now(), 60);

        let outstanding = &conn.outstandings.packets(QuicLevel::Application)[0];
        assert_eq!(outstanding.associated_event, Some(event));
        assert_eq!(conn.outstandings.cloned_packets_count, 1);
        assert_eq!(conn.loss_state.total_bytes_cloned, 60);
        assert_eq!(conn.loss_state.timeout_based_rtx_count, 1);
        assert_eq!(sent_packets.get(), 1);
    }

    #[test]
    fn test_handshake_packets_counted() {
        let mut conn = create_test_connection();
        conn.crypto.handshake_stream.write(&[1; 40], false);
        let header = HeaderBuilder::Long(LongHeaderType::Handshake).build(
            &conn.src_connection_id,
            &conn.dst_connection_id,
            0,
            QUIC_VERSION,
            &[],
        );
        let mut packet = RegularQuicWritePacket::new(header);
        packet.frames.push(QuicWriteFrame::Crypto { offset: 0, len: 40 });
        update_connection(&mut conn, None, packet, Instant::now(), 90);

        assert_eq!(conn.outstandings.handshake_packets_count, 1);
        assert_eq!(conn.outstandings.initial_packets_count, 0);
        let outstanding = &conn.outstandings.packets(QuicLevel::Handshake)[0];
        assert!(outstanding.metadata.is_handshake);
        assert_eq!(conn.crypto.handshake_stream.current_write_offset, 40);
        assert_eq!(conn.next_packet_num(QuicLevel::Handshake), 1);
    }

    #[test]
    fn test_path_challenge_becomes_outstanding() {
        let mut conn = create_test_connection();
        conn.send_path_challenge(0xabcd);
        conn.send_simple_frame(QuicSimpleFrame::HandshakeDone);

        let mut packet = app_packet(&conn, 0);
        packet.frames.push(QuicWriteFrame::Simple(QuicSimpleFrame::PathChallenge {
            data: 0xabcd,
        }));
        packet.frames.push(QuicWriteFrame::Simple(QuicSimpleFrame::HandshakeDone));
        update_connection(&mut conn, None, packet, Instant::now(), 40);

        assert!(conn.pending_events.path_challenge.is_none());
        assert!(conn.pending_events.frames.is_empty());
        assert!(conn.pending_events.schedule_path_validation_timeout);
        assert_eq!(
            conn.outstanding_path_validation,
            Some(QuicSimpleFrame::PathChallenge { data: 0xabcd })
        );
    }

    #[test]
    fn test_d6d_probe_keeps_ping_request() {
        let mut conn = create_test_connection();
        conn.pending_events.send_ping = true;
        conn.d6d.last_probe = Some(crate::connection::D6DProbePacket {
            packet_number: 0,
            probe_size: 1400,
        });

        let mut packet = app_packet(&conn, 0);
        packet.frames.push(QuicWriteFrame::Ping);
        packet.frames.push(QuicWriteFrame::Padding { num_bytes: 1300 });
        update_connection(&mut conn, None, packet, Instant::now(), 1400);

        assert!(conn.pending_events.send_ping);
        assert_eq!(conn.d6d.outstanding_probes, 1);
        assert_eq!(conn.d6d.total_txed_probes, 1);
        let outstanding = &conn.outstandings.packets(QuicLevel::Application)[0];
        assert!(outstanding.metadata.is_d6d_probe);
    }

    #[test]
    fn test_reset_clears_pending_reset() {
        let mut conn = create_test_connection();
        conn.reset_stream(0, 3);
        let stats = Rc::new(QuicTransportStats::new());
        conn.set_stats_callback(stats);

        let mut packet = app_packet(&conn, 0);
        packet.frames.push(QuicWriteFrame::ResetStream {
            stream_id: 0,
            error_code: 3,
            final_size: 0,
        });
        update_connection(&mut conn, None, packet, Instant::now(), 30);
        assert!(conn.pending_events.resets.is_empty());
        assert_eq!(conn.outstandings.num_outstanding(), 1);
    }
}
