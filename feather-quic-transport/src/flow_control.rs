use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::connection::QuicConnectionState;
use crate::frame::QuicWriteFrame;

#[derive(Debug, Default)]
pub(crate) struct QuicConnectionFlowControl {
    // sent_offset .. send_max_data
    // e.g. 200 .. 500
    // a stream frame with 80 bytes of new data leaves the socket
    // 280 .. 500
    // received max data frame (800)
    // 280 .. 800
    connection_send_max_data: u64,
    connection_sent_offset: u64,

    // recv_offset .. advertised_max_data
    // window updates advertise recv_offset + recv_window
    connection_recv_window: u64,
    connection_recv_offset: u64,
    connection_advertised_max_data: u64,
    time_of_last_update: Option<Instant>,
}

impl QuicConnectionFlowControl {
    pub(crate) fn new(send_max_data: u64, recv_window: u64) -> Self {
        info!(
            "Creating connection flow control, send max data {}, recv window {}",
            send_max_data, recv_window
        );
        Self {
            connection_send_max_data: send_max_data,
            connection_recv_window: recv_window,
            connection_advertised_max_data: recv_window,
            ..Default::default()
        }
    }

    pub(crate) fn get_sent_available_bytes(&self) -> u64 {
        self.connection_send_max_data
            .saturating_sub(self.connection_sent_offset)
    }

    pub(crate) fn get_sent_offset(&self) -> u64 {
        self.connection_sent_offset
    }

    pub(crate) fn increment_sent_offset(&mut self, bytes: u64) {
        self.connection_sent_offset += bytes;
        trace!(
            "Incremented connection send offset by {}, send offset {}",
            bytes,
            self.connection_sent_offset
        );
    }

    pub(crate) fn handle_max_data_frame(&mut self, max_data: u64) {
        if max_data <= self.connection_send_max_data {
            return;
        }
        info!(
            "Connection send max data moves from {} to {}",
            self.connection_send_max_data, max_data
        );
        self.connection_send_max_data = max_data;
    }

    pub(crate) fn increment_recv_offset(&mut self, bytes: u64) {
        self.connection_recv_offset += bytes;
    }

    pub(crate) fn get_new_max_recv_data(&self) -> u64 {
        self.connection_recv_offset + self.connection_recv_window
    }

    pub(crate) fn get_advertised_max_data(&self) -> u64 {
        self.connection_advertised_max_data
    }

    pub(crate) fn get_time_of_last_update(&self) -> Option<Instant> {
        self.time_of_last_update
    }
}

#[derive(Debug, Default)]
pub(crate) struct QuicStreamFlowControl {
    // Peer advertised limit for our send offset
    max_send_size: u64,

    recv_window: u64,
    recv_offset: u64,
    advertised_max_recv_size: u64,
    time_of_last_update: Option<Instant>,
}

impl QuicStreamFlowControl {
    pub(crate) fn new(max_send_size: u64, recv_window: u64) -> Self {
        trace!(
            "Creating stream flow control with max_send_size={}, recv_window={}",
            max_send_size,
            recv_window
        );
        Self {
            max_send_size,
            recv_window,
            advertised_max_recv_size: recv_window,
            ..Default::default()
        }
    }

    pub(crate) fn get_max_send_size(&self) -> u64 {
        self.max_send_size
    }

    pub(crate) fn get_sent_available_bytes(&self, current_write_offset: u64) -> u64 {
        self.max_send_size.saturating_sub(current_write_offset)
    }

    pub(crate) fn update_max_send_size(&mut self, max_data: u64) {
        if max_data <= self.max_send_size {
            warn!(
                "New max send size {} is less than or equal to current max send size {}",
                max_data, self.max_send_size
            );
            return;
        }
        self.max_send_size = max_data;
    }

    pub(crate) fn increment_recv_offset(&mut self, bytes: u64) {
        self.recv_offset += bytes;
    }

    pub(crate) fn get_new_max_recv_size(&self) -> u64 {
        self.recv_offset + self.recv_window
    }

    pub(crate) fn get_advertised_max_recv_size(&self) -> u64 {
        self.advertised_max_recv_size
    }
}

pub(crate) fn send_conn_flow_control_bytes_wire(conn: &QuicConnectionState) -> u64 {
    conn.flow_control.get_sent_available_bytes()
}

pub(crate) fn update_flow_control_on_write_to_socket(conn: &mut QuicConnectionState, len: u64) {
    conn.flow_control.increment_sent_offset(len);
    if conn.flow_control.get_sent_available_bytes() == 0 {
        debug!(
            "Connection send window exhausted at offset {}",
            conn.flow_control.get_sent_offset()
        );
    }
}

/// Queues STREAM_DATA_BLOCKED when the stream still has data but no window
pub(crate) fn maybe_write_blocked_after_socket_write(
    conn: &mut QuicConnectionState,
    stream_id: u64,
) {
    let blocked_at = match conn.stream_manager.get_stream(stream_id) {
        Some(stream)
            if stream.send_flow_control_bytes() == 0 && !stream.send.write_buffer.is_empty() =>
        {
            stream.flow_control.get_max_send_size()
        }
        _ => return,
    };
    debug!("Stream {} is blocked at offset {}", stream_id, blocked_at);
    conn.stream_manager.queue_blocked(stream_id, blocked_at);
}

pub(crate) fn maybe_write_data_blocked_after_socket_write(conn: &mut QuicConnectionState) {
    if send_conn_flow_control_bytes_wire(conn) == 0 {
        conn.pending_events.send_data_blocked = true;
    }
}

pub(crate) fn generate_max_data_frame(conn: &QuicConnectionState) -> QuicWriteFrame {
    QuicWriteFrame::MaxData {
        maximum_data: conn.flow_control.get_new_max_recv_data(),
    }
}

pub(crate) fn generate_max_stream_data_frame(
    conn: &QuicConnectionState,
    stream_id: u64,
) -> Option<QuicWriteFrame> {
    conn.stream_manager
        .get_stream(stream_id)
        .map(|stream| QuicWriteFrame::MaxStreamData {
            stream_id,
            maximum_data: stream.flow_control.get_new_max_recv_size(),
        })
}

pub(crate) fn on_conn_window_update_sent(
    conn: &mut QuicConnectionState,
    maximum_data: u64,
    now: Instant,
) {
    trace!(
        "Advertised connection max data {}, previously {} at {:?}",
        maximum_data,
        conn.flow_control.get_advertised_max_data(),
        conn.flow_control.get_time_of_last_update()
    );
    conn.flow_control.connection_advertised_max_data = maximum_data;
    conn.flow_control.time_of_last_update = Some(now);
    conn.pending_events.conn_window_update = false;
}

pub(crate) fn on_stream_window_update_sent(
    conn: &mut QuicConnectionState,
    stream_id: u64,
    maximum_data: u64,
    now: Instant,
) {
    if let Some(stream) = conn.stream_manager.get_stream_mut(stream_id) {
        trace!(
            "Advertised stream {} max data {}, previously {} at {:?}",
            stream_id,
            maximum_data,
            stream.flow_control.get_advertised_max_recv_size(),
            stream.flow_control.time_of_last_update
        );
        stream.flow_control.advertised_max_recv_size = maximum_data;
        stream.flow_control.time_of_last_update = Some(now);
    }
    conn.stream_manager.remove_window_update(stream_id);
}
