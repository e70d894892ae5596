use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use crate::config::QuicTransportConfig;
use crate::congestion::{CongestionController, PathValidationLimiter};
use crate::connection::{
    OutstandingPacket, QuicConnectionState, QuicEncryptionLevel, QuicLevel, QuicNodeType,
};
use crate::crypto::{AesGcmAead, AesHeaderProtector};
use crate::packet::{HeaderBuilder, QuicProtectionType};
use crate::runtime::QuicUdpSocket;
use crate::scheduler::{FrameSchedulerBuilder, QuicFrameScheduler};
use crate::transmit::write_connection_data_to_socket;

static TRACING: Once = Once::new();

#[allow(dead_code)]
pub(crate) fn init_tracing() {
    TRACING.call_once(|| {
        let env_filter = tracing_subscriber::EnvFilter::from_default_env();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_test_writer()
            .try_init();
    });
}

/// Records every datagram instead of sending it. Queued errnos make the
/// next writes fail, one write each.
pub(crate) struct MockUdpSocket {
    pub(crate) sent: Rc<RefCell<Vec<Vec<u8>>>>,
    pub(crate) paused: Rc<Cell<bool>>,
    failures: VecDeque<i32>,
}

impl MockUdpSocket {
    pub(crate) fn new() -> Self {
        Self {
            sent: Rc::new(RefCell::new(vec![])),
            paused: Rc::new(Cell::new(false)),
            failures: VecDeque::new(),
        }
    }

    pub(crate) fn fail_next(&mut self, errno: i32) {
        self.failures.push_back(errno);
    }
}

impl QuicUdpSocket for MockUdpSocket {
    fn write(&mut self, _addr: &SocketAddr, bufs: &[&[u8]]) -> io::Result<usize> {
        if let Some(errno) = self.failures.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let datagram = bufs.concat();
        let len = datagram.len();
        self.sent.borrow_mut().push(datagram);
        Ok(len)
    }

    fn pause_read(&mut self) {
        self.paused.set(true);
    }

    fn resume_read(&mut self) {
        self.paused.set(false);
    }
}

/// Fixed window, counts what it is told about
pub(crate) struct MockCongestionController {
    writable_bytes: u64,
    pub(crate) sent_packets: Rc<Cell<u64>>,
}

impl MockCongestionController {
    pub(crate) fn new(writable_bytes: u64) -> Self {
        Self {
            writable_bytes,
            sent_packets: Rc::new(Cell::new(0)),
        }
    }
}

impl CongestionController for MockCongestionController {
    fn get_writable_bytes(&self) -> u64 {
        self.writable_bytes
    }

    fn get_congestion_window(&self) -> u64 {
        self.writable_bytes
    }

    fn on_packet_sent(&mut self, _packet: &OutstandingPacket) {
        self.sent_packets.set(self.sent_packets.get() + 1);
    }
}

pub(crate) struct MockPathValidationLimiter {
    credit: u64,
    pub(crate) last_rtt: Rc<Cell<Option<Duration>>>,
    pub(crate) bytes_sent: Rc<Cell<u64>>,
}

impl MockPathValidationLimiter {
    pub(crate) fn new(credit: u64) -> Self {
        Self {
            credit,
            last_rtt: Rc::new(Cell::new(None)),
            bytes_sent: Rc::new(Cell::new(0)),
        }
    }
}

impl PathValidationLimiter for MockPathValidationLimiter {
    fn current_credit(&self, _now: Instant, rtt: Duration) -> u64 {
        self.last_rtt.set(Some(rtt));
        self.credit.saturating_sub(self.bytes_sent.get())
    }

    fn on_packet_sent(&mut self, bytes: u64) {
        self.bytes_sent.set(self.bytes_sent.get() + bytes);
    }
}

/// Installs keys derived from `level` alone, so every connection built
/// here encrypts the same way.
pub(crate) fn install_test_cipher(conn: &mut QuicConnectionState, level: QuicEncryptionLevel) {
    let seed = match level {
        QuicEncryptionLevel::Initial => 1,
        QuicEncryptionLevel::Handshake => 2,
        QuicEncryptionLevel::EarlyData => 3,
        QuicEncryptionLevel::AppData => 4,
    };
    let aead = AesGcmAead::new(&[seed; 16], &[seed; 12]).unwrap();
    let header_cipher = AesHeaderProtector::new(&[seed + 0x10; 16]).unwrap();
    conn.install_write_cipher(level, Rc::new(aead), Rc::new(header_cipher));
}

/// A client with Initial, Handshake and 1-RTT write keys and connection ids
pub(crate) fn create_test_connection_with_config(
    config: QuicTransportConfig,
) -> QuicConnectionState {
    let peer: SocketAddr = "127.0.0.1:4433".parse().unwrap();
    let mut conn = QuicConnectionState::new(QuicNodeType::Client, config, peer);
    conn.set_connection_ids(&[0x11; 4], &[0x22; 8]);
    for level in [
        QuicEncryptionLevel::Initial,
        QuicEncryptionLevel::Handshake,
        QuicEncryptionLevel::AppData,
    ] {
        install_test_cipher(&mut conn, level);
    }
    conn
}

pub(crate) fn create_test_connection() -> QuicConnectionState {
    create_test_connection_with_config(QuicTransportConfig::default())
}

/// Sends stream data a packet at a time through the regular write loop
pub(crate) struct TestTransport {
    pub(crate) sock: MockUdpSocket,
    scheduler: QuicFrameScheduler,
}

impl TestTransport {
    pub(crate) fn new() -> Self {
        Self {
            sock: MockUdpSocket::new(),
            scheduler: FrameSchedulerBuilder::new(
                QuicEncryptionLevel::AppData,
                "TestStreamScheduler",
            )
            .stream_frames()
            .build(),
        }
    }
}

// About a thousand bytes of stream data per packet
fn test_packet_budget(_conn: &QuicConnectionState) -> u64 {
    1000 + crate::crypto::QUIC_TAG_LENGTH as u64
}

/// Sends one 1-RTT packet of stream data and returns its packet number
pub(crate) fn send_stream_packet(
    conn: &mut QuicConnectionState,
    transport: &mut TestTransport,
) -> u64 {
    let pn = conn.next_packet_num(QuicLevel::Application);
    let (src, dst) = (conn.src_connection_id.clone(), conn.dst_connection_id.clone());
    let written = write_connection_data_to_socket(
        &mut transport.sock,
        conn,
        &src,
        &dst,
        HeaderBuilder::Short(QuicProtectionType::KeyPhaseZero),
        QuicLevel::Application,
        &mut transport.scheduler,
        test_packet_budget,
        1,
        &[],
        Instant::now(),
    )
    .unwrap();
    assert_eq!(written, 1, "No stream data to send");
    pn
}
