use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketErrorType {
    Again,
    Inval,
    MsgSize,
    NoBufs,
    NoMem,
    Other,
}

pub fn errno_to_socket_error_type(err: &io::Error) -> SocketErrorType {
    match err.raw_os_error() {
        Some(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK => SocketErrorType::Again,
        Some(libc::EINVAL) => SocketErrorType::Inval,
        Some(libc::EMSGSIZE) => SocketErrorType::MsgSize,
        Some(libc::ENOBUFS) => SocketErrorType::NoBufs,
        Some(libc::ENOMEM) => SocketErrorType::NoMem,
        _ => SocketErrorType::Other,
    }
}

/// Telemetry hooks of the send path, all optional to implement
pub trait QuicTransportStatsCallback {
    fn on_write(&self, _bytes: u64) {}

    fn on_packet_sent(&self) {}

    fn on_packet_retransmission(&self) {}

    fn on_cwnd_blocked(&self) {}

    fn on_udp_socket_write_error(&self, _error_type: SocketErrorType) {}
}

/// Diagnostic counters, only meaningful between two `reset` calls
#[derive(Debug, Default)]
pub struct QuicTransportStats {
    bytes_written: Cell<u64>,
    packets_sent: Cell<u64>,
    packets_retransmitted: Cell<u64>,
    cwnd_blocked: Cell<u64>,
    socket_write_errors: RefCell<HashMap<SocketErrorType, u64>>,
}

impl QuicTransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.get()
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.get()
    }

    pub fn packets_retransmitted(&self) -> u64 {
        self.packets_retransmitted.get()
    }

    pub fn cwnd_blocked(&self) -> u64 {
        self.cwnd_blocked.get()
    }

    pub fn socket_write_errors(&self, error_type: SocketErrorType) -> u64 {
        self.socket_write_errors
            .borrow()
            .get(&error_type)
            .copied()
            .unwrap_or_default()
    }

    pub fn reset(&self) {
        self.bytes_written.set(0);
        self.packets_sent.set(0);
        self.packets_retransmitted.set(0);
        self.cwnd_blocked.set(0);
        self.socket_write_errors.borrow_mut().clear();
    }
}

impl QuicTransportStatsCallback for QuicTransportStats {
    fn on_write(&self, bytes: u64) {
        self.bytes_written.set(self.bytes_written.get() + bytes);
    }

    fn on_packet_sent(&self) {
        self.packets_sent.set(self.packets_sent.get() + 1);
    }

    fn on_packet_retransmission(&self) {
        self.packets_retransmitted
            .set(self.packets_retransmitted.get() + 1);
    }

    fn on_cwnd_blocked(&self) {
        self.cwnd_blocked.set(self.cwnd_blocked.get() + 1);
    }

    fn on_udp_socket_write_error(&self, error_type: SocketErrorType) {
        *self
            .socket_write_errors
            .borrow_mut()
            .entry(error_type)
            .or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        let err = io::Error::from_raw_os_error(libc::EAGAIN);
        assert_eq!(errno_to_socket_error_type(&err), SocketErrorType::Again);
        let err = io::Error::from_raw_os_error(libc::EMSGSIZE);
        assert_eq!(errno_to_socket_error_type(&err), SocketErrorType::MsgSize);
        let err = io::Error::from_raw_os_error(libc::ENETUNREACH);
        assert_eq!(errno_to_socket_error_type(&err), SocketErrorType::Other);
        let err = io::Error::new(io::ErrorKind::Other, "no errno");
        assert_eq!(errno_to_socket_error_type(&err), SocketErrorType::Other);
    }

    #[test]
    fn test_stats_reset() {
        let stats = QuicTransportStats::new();
        stats.on_write(100);
        stats.on_write(20);
        stats.on_packet_sent();
        stats.on_udp_socket_write_error(SocketErrorType::NoBufs);
        stats.on_udp_socket_write_error(SocketErrorType::NoBufs);
        assert_eq!(stats.bytes_written(), 120);
        assert_eq!(stats.packets_sent(), 1);
        assert_eq!(stats.socket_write_errors(SocketErrorType::NoBufs), 2);

        stats.reset();
        assert_eq!(stats.bytes_written(), 0);
        assert_eq!(stats.socket_write_errors(SocketErrorType::NoBufs), 0);
    }
}
