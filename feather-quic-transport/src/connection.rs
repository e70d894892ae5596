use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::ack::AckState;
use crate::buf_accessor::BufAccessor;
use crate::config::{DataPathType, QuicTransportConfig};
use crate::congestion::{CongestionController, Pacer, PathValidationLimiter};
use crate::crypto::{QuicAead, QuicHeaderProtector};
use crate::flow_control::QuicConnectionFlowControl;
use crate::frame::QuicSimpleFrame;
use crate::happy_eyeballs::QuicHappyEyeballsState;
use crate::packet::{PacketEvent, RegularQuicWritePacket, QUIC_VERSION};
use crate::stats::QuicTransportStatsCallback;
use crate::stream::{QuicStreamLike, QuicStreamManager};
use crate::transmit::{data_path_for, PacketDataPath};

// Initial flow control windows until the peer transport parameters say otherwise
const DEFAULT_CONNECTION_FLOW_CONTROL_WINDOW: u64 = 1024 * 1024;
const DEFAULT_STREAM_FLOW_CONTROL_WINDOW: u64 = 256 * 1024;

/// Packet number space
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuicLevel {
    Initial,
    Handshake,
    Application,
}

impl QuicLevel {
    fn index(self) -> usize {
        match self {
            QuicLevel::Initial => 0,
            QuicLevel::Handshake => 1,
            QuicLevel::Application => 2,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QuicEncryptionLevel {
    Initial,
    Handshake,
    EarlyData,
    AppData,
}

impl QuicEncryptionLevel {
    pub fn level(self) -> QuicLevel {
        match self {
            QuicEncryptionLevel::Initial => QuicLevel::Initial,
            QuicEncryptionLevel::Handshake => QuicLevel::Handshake,
            QuicEncryptionLevel::EarlyData | QuicEncryptionLevel::AppData => QuicLevel::Application,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QuicNodeType {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct OutstandingPacketMetadata {
    pub time: Instant,
    pub encoded_size: u64,
    pub is_handshake: bool,
    pub is_d6d_probe: bool,
    /// Counters as of this send, this packet included
    pub total_bytes_sent: u64,
    pub inflight_bytes: u64,
    pub packets_inflight: u64,
    pub is_app_limited: bool,
}

/// A sent ack eliciting packet waiting for its fate
#[derive(Debug, Clone)]
pub struct OutstandingPacket {
    pub packet: RegularQuicWritePacket,
    pub metadata: OutstandingPacketMetadata,
    /// Set on both the original and its clones, only one of them may be acked for real
    pub associated_event: Option<PacketEvent>,
}

#[derive(Debug, Default)]
pub struct Outstandings {
    // Per packet number space, ascending packet numbers
    packets: [VecDeque<OutstandingPacket>; 3],
    pub(crate) packet_events: HashSet<PacketEvent>,
    pub(crate) initial_packets_count: u64,
    pub(crate) handshake_packets_count: u64,
    pub(crate) cloned_packets_count: u64,
}

impl Outstandings {
    pub fn packets(&self, level: QuicLevel) -> &VecDeque<OutstandingPacket> {
        &self.packets[level.index()]
    }

    pub(crate) fn packets_mut(&mut self, level: QuicLevel) -> &mut VecDeque<OutstandingPacket> {
        &mut self.packets[level.index()]
    }

    pub fn num_outstanding(&self) -> u64 {
        self.packets.iter().map(|p| p.len() as u64).sum()
    }

    pub fn packet_events(&self) -> &HashSet<PacketEvent> {
        &self.packet_events
    }

    pub fn initial_packets_count(&self) -> u64 {
        self.initial_packets_count
    }

    pub fn handshake_packets_count(&self) -> u64 {
        self.handshake_packets_count
    }

    pub fn cloned_packets_count(&self) -> u64 {
        self.cloned_packets_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReset {
    pub error_code: u64,
    pub final_size: u64,
}

/// Work requested since the last write, cleared as each item gets sent
#[derive(Debug, Default)]
pub struct PendingEvents {
    pub num_probe_packets: u64,
    pub send_ping: bool,
    pub send_data_blocked: bool,
    pub conn_window_update: bool,
    pub resets: BTreeMap<u64, PendingReset>,
    pub path_challenge: Option<QuicSimpleFrame>,
    pub frames: Vec<QuicSimpleFrame>,
    pub set_loss_detection_alarm: bool,
    pub schedule_path_validation_timeout: bool,
    pub d6d_send_probe_packet: bool,
}

#[derive(Debug, Default)]
pub struct LossState {
    pub srtt: Duration,
    pub total_bytes_sent: u64,
    pub total_bytes_acked: u64,
    pub total_packets_sent: u64,
    pub total_ack_eliciting_packets_sent: u64,
    pub total_bytes_retransmitted: u64,
    pub total_stream_bytes_cloned: u64,
    pub total_bytes_cloned: u64,
    pub inflight_bytes: u64,
    pub largest_sent: Option<u64>,
    pub last_retransmittable_packet_sent_time: Option<Instant>,
    pub timeout_based_rtx_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct D6DProbePacket {
    pub packet_number: u64,
    pub probe_size: u16,
}

/// Path MTU probing (DPLPMTUD) state
#[derive(Debug)]
pub struct D6DState {
    pub current_probe_size: u16,
    pub last_probe: Option<D6DProbePacket>,
    pub outstanding_probes: u64,
    pub total_txed_probes: u64,
}

#[derive(Debug, Default)]
pub struct QuicCryptoState {
    pub(crate) initial_stream: QuicStreamLike,
    pub(crate) handshake_stream: QuicStreamLike,
    pub(crate) one_rtt_stream: QuicStreamLike,
}

impl QuicCryptoState {
    pub fn stream(&self, level: QuicEncryptionLevel) -> Option<&QuicStreamLike> {
        match level {
            QuicEncryptionLevel::Initial => Some(&self.initial_stream),
            QuicEncryptionLevel::Handshake => Some(&self.handshake_stream),
            QuicEncryptionLevel::AppData => Some(&self.one_rtt_stream),
            QuicEncryptionLevel::EarlyData => None,
        }
    }

    pub fn stream_mut(&mut self, level: QuicEncryptionLevel) -> Option<&mut QuicStreamLike> {
        match level {
            QuicEncryptionLevel::Initial => Some(&mut self.initial_stream),
            QuicEncryptionLevel::Handshake => Some(&mut self.handshake_stream),
            QuicEncryptionLevel::AppData => Some(&mut self.one_rtt_stream),
            QuicEncryptionLevel::EarlyData => None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct WriteCipher {
    pub(crate) aead: Rc<dyn QuicAead>,
    pub(crate) header_cipher: Rc<dyn QuicHeaderProtector>,
}

/// Everything the send path knows about one connection.
///
/// Owned by a single event loop thread, no field is ever touched concurrently.
pub struct QuicConnectionState {
    pub(crate) node_type: QuicNodeType,
    pub(crate) config: QuicTransportConfig,
    pub(crate) udp_send_packet_len: u64,
    pub(crate) peer_address: SocketAddr,
    pub(crate) src_connection_id: Vec<u8>,
    pub(crate) dst_connection_id: Vec<u8>,
    pub(crate) server_connection_id: Option<Vec<u8>>,
    pub(crate) version: u32,
    pub(crate) token: Vec<u8>,

    ack_states: [AckState; 3],
    pub(crate) initial_write_cipher: Option<WriteCipher>,
    pub(crate) handshake_write_cipher: Option<WriteCipher>,
    pub(crate) zero_rtt_write_cipher: Option<WriteCipher>,
    pub(crate) one_rtt_write_cipher: Option<WriteCipher>,

    pub(crate) crypto: QuicCryptoState,
    pub(crate) stream_manager: QuicStreamManager,
    pub(crate) flow_control: QuicConnectionFlowControl,
    pub(crate) pending_events: PendingEvents,
    pub(crate) outstandings: Outstandings,
    pub(crate) loss_state: LossState,
    pub(crate) d6d: D6DState,

    pub(crate) congestion_controller: Option<Box<dyn CongestionController>>,
    pub(crate) pacer: Option<Box<dyn Pacer>>,
    pub(crate) path_validation_limiter: Option<Box<dyn PathValidationLimiter>>,
    /// Amplification style cap on total bytes sent, e.g. before the peer address is validated
    pub(crate) writable_bytes_limit: Option<u64>,
    pub(crate) outstanding_path_validation: Option<QuicSimpleFrame>,

    pub(crate) happy_eyeballs: QuicHappyEyeballsState,
    pub(crate) stats: Option<Rc<dyn QuicTransportStatsCallback>>,
    pub(crate) buf_accessor: Option<BufAccessor>,
    pub(crate) data_path: &'static dyn PacketDataPath,
}

impl QuicConnectionState {
    pub fn new(
        node_type: QuicNodeType,
        config: QuicTransportConfig,
        peer_address: SocketAddr,
    ) -> Self {
        let udp_send_packet_len = config.get_udp_send_packet_len() as u64;
        let data_path_type = config.get_data_path_type();
        // Room for a full batch plus one oversized MTU probe
        let buf_accessor = (data_path_type == DataPathType::ContinuousMemory).then(|| {
            BufAccessor::new(
                udp_send_packet_len as usize * (config.get_max_batch_size() as usize + 1),
            )
        });
        let d6d = D6DState {
            current_probe_size: config.get_d6d_base_probe_size(),
            last_probe: None,
            outstanding_probes: 0,
            total_txed_probes: 0,
        };
        info!(
            "Creating {:?} connection state to {}, data path {:?}, udp send packet len {}",
            node_type, peer_address, data_path_type, udp_send_packet_len
        );

        Self {
            node_type,
            udp_send_packet_len,
            peer_address,
            src_connection_id: vec![],
            dst_connection_id: vec![],
            server_connection_id: None,
            version: QUIC_VERSION,
            token: vec![],
            ack_states: Default::default(),
            initial_write_cipher: None,
            handshake_write_cipher: None,
            zero_rtt_write_cipher: None,
            one_rtt_write_cipher: None,
            crypto: QuicCryptoState::default(),
            stream_manager: QuicStreamManager::new(
                DEFAULT_STREAM_FLOW_CONTROL_WINDOW,
                DEFAULT_STREAM_FLOW_CONTROL_WINDOW,
            ),
            flow_control: QuicConnectionFlowControl::new(
                DEFAULT_CONNECTION_FLOW_CONTROL_WINDOW,
                DEFAULT_CONNECTION_FLOW_CONTROL_WINDOW,
            ),
            pending_events: PendingEvents::default(),
            outstandings: Outstandings::default(),
            loss_state: LossState::default(),
            d6d,
            congestion_controller: None,
            pacer: None,
            path_validation_limiter: None,
            writable_bytes_limit: None,
            outstanding_path_validation: None,
            happy_eyeballs: QuicHappyEyeballsState::default(),
            stats: None,
            buf_accessor,
            data_path: data_path_for(data_path_type),
            config,
        }
    }

    pub fn node_type(&self) -> QuicNodeType {
        self.node_type
    }

    pub fn config(&self) -> &QuicTransportConfig {
        &self.config
    }

    pub fn set_connection_ids(&mut self, src: &[u8], dst: &[u8]) {
        self.src_connection_id = src.to_vec();
        self.dst_connection_id = dst.to_vec();
        let server_id = match self.node_type {
            QuicNodeType::Client => dst,
            QuicNodeType::Server => src,
        };
        self.server_connection_id = Some(server_id.to_vec());
    }

    pub fn set_token(&mut self, token: &[u8]) {
        self.token = token.to_vec();
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn ack_state(&self, level: QuicLevel) -> &AckState {
        &self.ack_states[level.index()]
    }

    pub fn ack_state_mut(&mut self, level: QuicLevel) -> &mut AckState {
        &mut self.ack_states[level.index()]
    }

    pub(crate) fn next_packet_num(&self, level: QuicLevel) -> u64 {
        self.ack_state(level).next_packet_num
    }

    pub(crate) fn increase_next_packet_num(&mut self, level: QuicLevel) {
        self.ack_state_mut(level).next_packet_num += 1;
    }

    pub fn install_write_cipher(
        &mut self,
        level: QuicEncryptionLevel,
        aead: Rc<dyn QuicAead>,
        header_cipher: Rc<dyn QuicHeaderProtector>,
    ) {
        let cipher = Some(WriteCipher {
            aead,
            header_cipher,
        });
        match level {
            QuicEncryptionLevel::Initial => self.initial_write_cipher = cipher,
            QuicEncryptionLevel::Handshake => self.handshake_write_cipher = cipher,
            QuicEncryptionLevel::EarlyData => self.zero_rtt_write_cipher = cipher,
            QuicEncryptionLevel::AppData => self.one_rtt_write_cipher = cipher,
        }
        info!("Installed {:?} write cipher", level);
    }

    pub fn has_write_cipher(&self, level: QuicEncryptionLevel) -> bool {
        self.write_cipher(level).is_some()
    }

    pub(crate) fn write_cipher(&self, level: QuicEncryptionLevel) -> Option<&WriteCipher> {
        match level {
            QuicEncryptionLevel::Initial => self.initial_write_cipher.as_ref(),
            QuicEncryptionLevel::Handshake => self.handshake_write_cipher.as_ref(),
            QuicEncryptionLevel::EarlyData => self.zero_rtt_write_cipher.as_ref(),
            QuicEncryptionLevel::AppData => self.one_rtt_write_cipher.as_ref(),
        }
    }

    pub(crate) fn drop_write_cipher(&mut self, level: QuicEncryptionLevel) {
        match level {
            QuicEncryptionLevel::Initial => self.initial_write_cipher = None,
            QuicEncryptionLevel::Handshake => self.handshake_write_cipher = None,
            QuicEncryptionLevel::EarlyData => self.zero_rtt_write_cipher = None,
            QuicEncryptionLevel::AppData => self.one_rtt_write_cipher = None,
        }
    }

    pub fn set_congestion_controller(&mut self, cc: Box<dyn CongestionController>) {
        self.congestion_controller = Some(cc);
    }

    pub fn set_pacer(&mut self, pacer: Box<dyn Pacer>) {
        self.pacer = Some(pacer);
    }

    pub fn set_path_validation_limiter(&mut self, limiter: Box<dyn PathValidationLimiter>) {
        self.path_validation_limiter = Some(limiter);
    }

    pub fn set_stats_callback(&mut self, stats: Rc<dyn QuicTransportStatsCallback>) {
        self.stats = Some(stats);
    }

    pub fn set_writable_bytes_limit(&mut self, limit: Option<u64>) {
        if limit.is_some() && self.path_validation_limiter.is_some() {
            warn!("Writable bytes limit set while a path validation limiter is installed");
        }
        self.writable_bytes_limit = limit;
    }

    pub fn set_srtt(&mut self, srtt: Duration) {
        self.loss_state.srtt = srtt;
    }

    pub fn happy_eyeballs(&mut self) -> &mut QuicHappyEyeballsState {
        &mut self.happy_eyeballs
    }

    pub fn crypto_state_mut(&mut self) -> &mut QuicCryptoState {
        &mut self.crypto
    }

    pub fn stream_manager(&self) -> &QuicStreamManager {
        &self.stream_manager
    }

    pub fn stream_manager_mut(&mut self) -> &mut QuicStreamManager {
        &mut self.stream_manager
    }

    pub fn pending_events(&self) -> &PendingEvents {
        &self.pending_events
    }

    pub fn pending_events_mut(&mut self) -> &mut PendingEvents {
        &mut self.pending_events
    }

    pub fn outstandings(&self) -> &Outstandings {
        &self.outstandings
    }

    pub fn loss_state(&self) -> &LossState {
        &self.loss_state
    }

    pub fn d6d(&self) -> &D6DState {
        &self.d6d
    }

    /// Queues a control frame for the next write
    pub fn send_simple_frame(&mut self, frame: QuicSimpleFrame) {
        self.pending_events.frames.push(frame);
    }

    pub fn send_path_challenge(&mut self, data: u64) {
        self.pending_events.path_challenge = Some(QuicSimpleFrame::PathChallenge { data });
    }

    /// Peer raised the connection send window with MAX_DATA
    pub fn on_max_data(&mut self, maximum_data: u64) {
        self.flow_control.handle_max_data_frame(maximum_data);
        if self.flow_control.get_sent_available_bytes() > 0 {
            self.pending_events.send_data_blocked = false;
        }
    }

    /// Peer raised a stream send window with MAX_STREAM_DATA
    pub fn on_max_stream_data(&mut self, stream_id: u64, maximum_data: u64) {
        let Some(stream) = self.stream_manager.get_stream_mut(stream_id) else {
            warn!("MAX_STREAM_DATA for unknown stream {}", stream_id);
            return;
        };
        stream.flow_control.update_max_send_size(maximum_data);
        self.stream_manager.update_writable_streams(stream_id);
    }

    /// The application consumed received data, window updates advertise past it
    pub fn on_stream_data_read(&mut self, stream_id: u64, bytes: u64) {
        self.flow_control.increment_recv_offset(bytes);
        if let Some(stream) = self.stream_manager.get_stream_mut(stream_id) {
            stream.flow_control.increment_recv_offset(bytes);
        }
    }

    pub fn reset_stream(&mut self, stream_id: u64, error_code: u64) {
        let final_size = self
            .stream_manager
            .get_stream(stream_id)
            .map(|s| s.send.current_write_offset + s.send.write_buffer_len())
            .unwrap_or_default();
        self.pending_events.resets.insert(
            stream_id,
            PendingReset {
                error_code,
                final_size,
            },
        );
    }
}
