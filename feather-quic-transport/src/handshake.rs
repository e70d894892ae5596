use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::ack::{
    common_ack_visitor_for_ack_frame, process_ack_frame, process_crypto_stream_ack, ReadAckFrame,
};
use crate::connection::{QuicConnectionState, QuicEncryptionLevel};
use crate::frame::{AckBlock, QuicWriteFrame};

/// Acks everything still outstanding at `level` once its keys are gone.
/// Nothing sent with those keys can be retransmitted anymore.
pub fn implicit_ack_crypto_stream(conn: &mut QuicConnectionState, level: QuicEncryptionLevel) {
    let pn_space = level.level();
    let outstanding = conn.outstandings.packets(pn_space);
    let range = outstanding
        .front()
        .zip(outstanding.back())
        .map(|(first, last)| {
            (
                first.packet.header.packet_number(),
                last.packet.header.packet_number(),
            )
        });

    if let Some((smallest, largest)) = range {
        debug!(
            "Implicitly acking {:?} packets {}..={}",
            pn_space, smallest, largest
        );
        let ack = ReadAckFrame {
            largest_acked: largest,
            ack_delay: Duration::ZERO,
            ack_blocks: vec![AckBlock {
                start: smallest,
                end: largest,
            }],
            implicit: true,
        };
        process_ack_frame(
            conn,
            pn_space,
            &ack,
            |conn, _packet, frame| match frame {
                QuicWriteFrame::Crypto { offset, len } => {
                    if let Some(stream) = conn.crypto.stream_mut(level) {
                        process_crypto_stream_ack(stream, *offset, *len);
                    }
                }
                QuicWriteFrame::Ack(ack) => {
                    common_ack_visitor_for_ack_frame(conn.ack_state_mut(pn_space), ack);
                }
                _ => {}
            },
            |_conn, packet, _processed| {
                panic!(
                    "Got loss from implicit crypto ACK, packet {}",
                    packet.header.packet_number()
                )
            },
            Instant::now(),
        );
    }

    if let Some(stream) = conn.crypto.stream_mut(level) {
        // Lost data may stay around from before the keys were dropped
        stream.loss_buffer.clear();
        assert!(
            stream.retransmission_buffer.is_empty(),
            "{:?} crypto data left unacked",
            level
        );
        assert!(stream.write_buffer.is_empty(), "{:?} crypto data left unsent", level);
    }
}

/// The handshake is done: Initial and Handshake keys are dropped along
/// with whatever was sent under them.
pub fn handshake_confirmed(conn: &mut QuicConnectionState) {
    assert!(
        conn.has_write_cipher(QuicEncryptionLevel::AppData),
        "Handshake confirmed without 1-RTT keys"
    );
    for level in [QuicEncryptionLevel::Initial, QuicEncryptionLevel::Handshake] {
        conn.drop_write_cipher(level);
        implicit_ack_crypto_stream(conn, level);
    }
    info!("Handshake confirmed, dropped Initial and Handshake write keys");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::QuicLevel;
    use crate::stream::StreamBuffer;
    use crate::test_utils::{create_test_connection, MockUdpSocket};
    use crate::transmit::write_crypto_and_ack_data_to_socket;
    use crate::packet::LongHeaderType;
    use anyhow::Result;

    #[test]
    fn test_implicit_ack_clears_handshake_space() -> Result<()> {
        let mut conn = create_test_connection();
        let mut sock = MockUdpSocket::new();
        conn.crypto.handshake_stream.write(&[5; 3000], false);
        let written = write_crypto_and_ack_data_to_socket(
            &mut sock,
            &mut conn,
            LongHeaderType::Handshake,
            10,
        )?;
        assert_eq!(written, 3);
        assert_eq!(conn.outstandings.packets(QuicLevel::Handshake).len(), 3);
        assert_eq!(conn.outstandings.handshake_packets_count(), 3);
        conn.crypto
            .handshake_stream
            .loss_buffer
            .push(StreamBuffer::new(9000, vec![1; 10], false));

        let inflight = conn.loss_state.inflight_bytes;
        implicit_ack_crypto_stream(&mut conn, QuicEncryptionLevel::Handshake);
        assert!(conn.outstandings.packets(QuicLevel::Handshake).is_empty());
        assert_eq!(conn.outstandings.handshake_packets_count(), 0);
        assert!(conn.crypto.handshake_stream.retransmission_buffer.is_empty());
        assert!(conn.crypto.handshake_stream.loss_buffer.is_empty());
        assert!(conn.loss_state.inflight_bytes < inflight);
        assert_eq!(
            conn.ack_state(QuicLevel::Handshake).largest_acked_by_peer(),
            Some(2)
        );
        Ok(())
    }

    #[test]
    fn test_implicit_ack_without_outstanding_packets() {
        let mut conn = create_test_connection();
        implicit_ack_crypto_stream(&mut conn, QuicEncryptionLevel::Initial);
        assert_eq!(conn.ack_state(QuicLevel::Initial).largest_acked_by_peer(), None);
    }

    #[test]
    fn test_handshake_confirmed_drops_keys() -> Result<()> {
        let mut conn = create_test_connection();
        let mut sock = MockUdpSocket::new();
        conn.crypto.initial_stream.write(&[1; 100], false);
        write_crypto_and_ack_data_to_socket(&mut sock, &mut conn, LongHeaderType::Initial, 10)?;
        assert_eq!(conn.outstandings.initial_packets_count(), 1);

        handshake_confirmed(&mut conn);
        assert!(!conn.has_write_cipher(QuicEncryptionLevel::Initial));
        assert!(!conn.has_write_cipher(QuicEncryptionLevel::Handshake));
        assert_eq!(conn.outstandings.num_outstanding(), 0);
        assert_eq!(conn.outstandings.initial_packets_count(), 0);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "Handshake confirmed without 1-RTT keys")]
    fn test_handshake_confirmed_needs_one_rtt_keys() {
        let mut conn = create_test_connection();
        conn.drop_write_cipher(QuicEncryptionLevel::AppData);
        handshake_confirmed(&mut conn);
    }
}
