use anyhow::{anyhow, Result};
use std::time::Instant;
use tracing::{debug, error, span, trace, warn, Level};

use crate::ack::has_acks_to_schedule;
use crate::batch_writer::BatchWriterFactory;
use crate::buf_accessor::{ArenaBuf, BufAccessor};
use crate::builder::{
    InplacePacketBuilder, PacketBuffers, PacketBuilder, QuicPacketBuilder, RegularPacketBuilder,
};
use crate::config::{DataPathType, QuicBatchingMode, DEFAULT_UDP_SEND_PACKET_LEN};
use crate::connection::{
    QuicConnectionState, QuicEncryptionLevel, QuicLevel, QuicNodeType, WriteCipher,
};
use crate::crypto::encrypt_packet_header;
use crate::error_code::{QuicErrorCode, TransportErrorCode};
use crate::flow_control::send_conn_flow_control_bytes_wire;
use crate::frame::{write_frame, QuicWriteFrame};
use crate::io_batch::{FlushType, IOBufQuicBatch};
use crate::packet::{
    HeaderBuilder, LongHeaderType, PacketEvent, QuicPacketHeader, QuicProtectionType,
    RegularQuicWritePacket,
};
use crate::runtime::QuicUdpSocket;
use crate::scheduler::{
    CloningScheduler, D6DProbeScheduler, FrameSchedulerBuilder, QuicFrameScheduler,
    QuicPacketScheduler,
};
use crate::update::update_connection;
use crate::utils::format_instant;

/// Why the connection should write now, checked in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDataReason {
    NoWrite,
    Probes,
    Ack,
    Crypto,
    Reset,
    StreamWindowUpdate,
    ConnWindowUpdate,
    Blocked,
    Stream,
    Simple,
    PathChallenge,
    Ping,
}

/// Budget function handed to the transmission loop, evaluated once per packet
pub type WritableBytesFn = fn(&QuicConnectionState) -> u64;

/// What one pass of build, schedule and encrypt produced
pub(crate) struct DataPathResult {
    pub(crate) build_success: bool,
    pub(crate) write_success: bool,
    pub(crate) packet_event: Option<PacketEvent>,
    pub(crate) packet: Option<RegularQuicWritePacket>,
    pub(crate) encoded_size: u64,
}

impl DataPathResult {
    fn build_failure() -> Self {
        Self {
            build_success: false,
            write_success: false,
            packet_event: None,
            packet: None,
            encoded_size: 0,
        }
    }

    fn write_result(
        write_success: bool,
        packet_event: Option<PacketEvent>,
        packet: RegularQuicWritePacket,
        encoded_size: u64,
    ) -> Self {
        Self {
            build_success: true,
            write_success,
            packet_event,
            packet: Some(packet),
            encoded_size,
        }
    }
}

/// Builds one packet with `scheduler`, seals it and hands it to the batch
pub(crate) trait PacketDataPath {
    fn build_schedule_encrypt(
        &self,
        conn: &mut QuicConnectionState,
        header: QuicPacketHeader,
        scheduler: &mut dyn QuicPacketScheduler,
        writable_bytes: u64,
        cipher: &WriteCipher,
        batch: &mut IOBufQuicBatch<'_>,
    ) -> Result<DataPathResult>;
}

/// Packets are built back to back in the connection arena and sealed in place
pub(crate) struct ContinuousMemoryDataPath;

/// Every packet gets buffers of its own
pub(crate) struct ChainedMemoryDataPath;

static CONTINUOUS_MEMORY: ContinuousMemoryDataPath = ContinuousMemoryDataPath;
static CHAINED_MEMORY: ChainedMemoryDataPath = ChainedMemoryDataPath;

pub(crate) fn data_path_for(data_path_type: DataPathType) -> &'static dyn PacketDataPath {
    match data_path_type {
        DataPathType::ContinuousMemory => &CONTINUOUS_MEMORY,
        DataPathType::ChainedMemory => &CHAINED_MEMORY,
    }
}

fn is_d6d_probe(conn: &QuicConnectionState, header: &QuicPacketHeader) -> bool {
    header.level() == QuicLevel::Application
        && conn
            .d6d
            .last_probe
            .is_some_and(|probe| probe.packet_number == header.packet_number())
}

fn check_encoded_size(conn: &QuicConnectionState, header: &QuicPacketHeader, encoded_size: usize) {
    // MTU probes are meant to be larger than the path is known to carry
    if encoded_size as u64 > conn.udp_send_packet_len && !is_d6d_probe(conn, header) {
        error!(
            "Packet {} of {} bytes is larger than the udp send packet len {}",
            header.packet_number(),
            encoded_size,
            conn.udp_send_packet_len
        );
    }
}

fn on_packet_written(conn: &QuicConnectionState, encoded_size: usize) {
    if let Some(stats) = conn.stats.as_ref() {
        stats.on_write(encoded_size as u64);
        stats.on_packet_sent();
    }
}

fn largest_acked_by_peer(conn: &QuicConnectionState, header: &QuicPacketHeader) -> u64 {
    conn.ack_state(header.level())
        .largest_acked_by_peer
        .unwrap_or(0)
}

/// Drops everything a failed in-place attempt left past `prev_size`,
/// including headroom taken while sealing
fn rewind_arena(accessor: &BufAccessor, prev_size: usize) {
    let mut buf = accessor.scoped();
    let headroom = buf.headroom();
    buf.prepend(headroom);
    let written = buf.len() - prev_size;
    buf.trim_end(written);
}

/// Encrypts the packet at the arena tail, header at `prev_size`.
/// Returns the encoded size with the window restored to the whole arena.
fn seal_in_place(
    buf: &mut ArenaBuf,
    prev_size: usize,
    header_len: usize,
    header: &QuicPacketHeader,
    cipher: &WriteCipher,
) -> Result<usize> {
    let header_bytes = buf.data()[prev_size..prev_size + header_len].to_vec();
    buf.trim_start(prev_size + header_len);
    let tag = cipher
        .aead
        .encrypt_in_place(buf.data_mut(), &header_bytes, header.packet_number())?;
    buf.append(&tag);

    assert_eq!(buf.headroom(), prev_size + header_len);
    buf.prepend(header_len);
    let (header_window, body) = buf.data_mut().split_at_mut(header_len);
    encrypt_packet_header(
        header.header_form(),
        header_window,
        body,
        cipher.header_cipher.as_ref(),
    )?;
    let encoded_size = buf.len();
    buf.prepend(prev_size);
    Ok(encoded_size)
}

impl PacketDataPath for ContinuousMemoryDataPath {
    fn build_schedule_encrypt(
        &self,
        conn: &mut QuicConnectionState,
        header: QuicPacketHeader,
        scheduler: &mut dyn QuicPacketScheduler,
        writable_bytes: u64,
        cipher: &WriteCipher,
        batch: &mut IOBufQuicBatch<'_>,
    ) -> Result<DataPathResult> {
        let accessor = conn
            .buf_accessor
            .clone()
            .ok_or_else(|| anyhow!("Failed to build packet in place due to missing arena"))?;
        let prev_size = accessor.scoped().len();
        let largest_acked = largest_acked_by_peer(conn, &header);
        let packet_header = header.clone();

        let mut builder = InplacePacketBuilder::new(
            accessor.clone(),
            conn.udp_send_packet_len as usize,
            header,
            largest_acked,
        );
        builder.account_for_cipher_overhead(cipher.aead.overhead());
        assert!(
            scheduler.has_data(conn),
            "{} asked to schedule without data",
            scheduler.name()
        );
        let result = match scheduler.schedule_frames_for_packet(
            conn,
            PacketBuilder::Inplace(builder),
            writable_bytes,
        ) {
            Ok(result) => result,
            Err(e) => {
                rewind_arena(&accessor, prev_size);
                return Err(e);
            }
        };

        let built = match result.packet {
            Some(built) if built.has_body() && !built.packet.frames.is_empty() => built,
            _ => {
                // Nothing of the failed attempt may stay behind the batched packets
                rewind_arena(&accessor, prev_size);
                batch.flush(conn, FlushType::Always)?;
                return Ok(DataPathResult::build_failure());
            }
        };
        let PacketBuffers::Inplace {
            header_len,
            body_len,
        } = built.buffers
        else {
            panic!("In place builder produced {:?}", built.buffers);
        };

        let sealed = {
            let mut buf = accessor.scoped();
            assert_eq!(
                buf.len(),
                prev_size + header_len + body_len,
                "Arena does not end with the packet just built"
            );
            seal_in_place(&mut buf, prev_size, header_len, &packet_header, cipher)
        };
        let encoded_size = match sealed {
            Ok(encoded_size) => encoded_size,
            Err(e) => {
                rewind_arena(&accessor, prev_size);
                return Err(e);
            }
        };
        check_encoded_size(conn, &packet_header, encoded_size);

        let write_success = batch.write(conn, None, encoded_size)?;
        if write_success {
            on_packet_written(conn, encoded_size);
        }
        Ok(DataPathResult::write_result(
            write_success,
            result.packet_event,
            built.packet,
            encoded_size as u64,
        ))
    }
}

impl PacketDataPath for ChainedMemoryDataPath {
    fn build_schedule_encrypt(
        &self,
        conn: &mut QuicConnectionState,
        header: QuicPacketHeader,
        scheduler: &mut dyn QuicPacketScheduler,
        writable_bytes: u64,
        cipher: &WriteCipher,
        batch: &mut IOBufQuicBatch<'_>,
    ) -> Result<DataPathResult> {
        let largest_acked = largest_acked_by_peer(conn, &header);
        let packet_header = header.clone();
        let mut builder =
            RegularPacketBuilder::new(conn.udp_send_packet_len as usize, header, largest_acked);
        builder.account_for_cipher_overhead(cipher.aead.overhead());
        assert!(
            scheduler.has_data(conn),
            "{} asked to schedule without data",
            scheduler.name()
        );
        let result = scheduler.schedule_frames_for_packet(
            conn,
            PacketBuilder::Regular(builder),
            writable_bytes,
        )?;

        let built = match result.packet {
            Some(built) if built.has_body() && !built.packet.frames.is_empty() => built,
            _ => {
                batch.flush(conn, FlushType::Always)?;
                return Ok(DataPathResult::build_failure());
            }
        };
        let PacketBuffers::Chained { mut header, body } = built.buffers else {
            panic!("Regular builder produced {:?}", built.buffers);
        };

        let cipher_text =
            cipher
                .aead
                .encrypt(&body, &header, packet_header.packet_number())?;
        encrypt_packet_header(
            packet_header.header_form(),
            &mut header,
            &cipher_text,
            cipher.header_cipher.as_ref(),
        )?;
        let mut packet_buf = header;
        packet_buf.extend_from_slice(&cipher_text);
        let encoded_size = packet_buf.len();
        check_encoded_size(conn, &packet_header, encoded_size);

        let write_success = batch.write(conn, Some(packet_buf), encoded_size)?;
        if write_success {
            on_packet_written(conn, encoded_size);
        }
        Ok(DataPathResult::write_result(
            write_success,
            result.packet_event,
            built.packet,
            encoded_size as u64,
        ))
    }
}

fn header_encryption_level(header_builder: HeaderBuilder) -> QuicEncryptionLevel {
    match header_builder {
        HeaderBuilder::Long(LongHeaderType::Initial) => QuicEncryptionLevel::Initial,
        HeaderBuilder::Long(LongHeaderType::Handshake) => QuicEncryptionLevel::Handshake,
        HeaderBuilder::Long(LongHeaderType::ZeroRtt) => QuicEncryptionLevel::EarlyData,
        HeaderBuilder::Long(LongHeaderType::Retry) => {
            panic!("Retry packets do not go through the transmission loop")
        }
        HeaderBuilder::Short(_) => QuicEncryptionLevel::AppData,
    }
}

fn write_cipher_for(conn: &QuicConnectionState, level: QuicEncryptionLevel) -> Result<WriteCipher> {
    conn.write_cipher(level)
        .cloned()
        .ok_or_else(|| anyhow!("Failed to write {:?} data due to missing write cipher", level))
}

/// The transmission loop: packets are built until the scheduler runs dry,
/// `packet_limit` is reached or the loop has used up its share of the RTT.
/// Returns the number of packets handed to the batch.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_connection_data_to_socket(
    sock: &mut dyn QuicUdpSocket,
    conn: &mut QuicConnectionState,
    src_connection_id: &[u8],
    dst_connection_id: &[u8],
    header_builder: HeaderBuilder,
    level: QuicLevel,
    scheduler: &mut dyn QuicPacketScheduler,
    writable_bytes_fn: WritableBytesFn,
    packet_limit: u64,
    token: &[u8],
    write_loop_begin_time: Instant,
) -> Result<u64> {
    let span = span!(
        Level::TRACE,
        "write_connection_data",
        scheduler = scheduler.name(),
        packet_limit,
        packets_sent = tracing::field::Empty
    );
    let _enter = span.enter();

    let cipher = write_cipher_for(conn, header_encryption_level(header_builder))?;
    let overhead = cipher.aead.overhead() as u64;
    let batch_writer = BatchWriterFactory::make_batch_writer(conn);
    let peer_address = conn.peer_address;
    let mut batch = IOBufQuicBatch::new(batch_writer, sock, peer_address);
    let data_path = conn.data_path;
    // Packets the loop may always send before the RTT share is checked
    let batch_size = match conn.config.get_batching_mode() {
        QuicBatchingMode::None => conn.config.get_write_connection_data_packets_limit(),
        QuicBatchingMode::Sendmmsg => conn.config.get_max_batch_size() as u64,
    };
    let rtt_fraction = conn.config.get_write_limit_rtt_fraction().max(1);

    let within_time_limit = |pkt_sent: u64, conn: &QuicConnectionState| {
        let srtt = conn.loss_state.srtt;
        pkt_sent < batch_size
            || srtt.is_zero()
            || write_loop_begin_time.elapsed() < srtt / rtt_fraction
    };

    while scheduler.has_data(conn)
        && batch.pkt_sent() < packet_limit
        && within_time_limit(batch.pkt_sent(), conn)
    {
        let packet_num = conn.next_packet_num(level);
        let header = header_builder.build(
            src_connection_id,
            dst_connection_id,
            packet_num,
            conn.version,
            token,
        );
        let writable_bytes = conn
            .udp_send_packet_len
            .min(writable_bytes_fn(conn))
            .saturating_sub(overhead);

        let result = data_path.build_schedule_encrypt(
            conn,
            header,
            scheduler,
            writable_bytes,
            &cipher,
            &mut batch,
        )?;
        if !result.build_success {
            trace!("{} built nothing for packet {}", scheduler.name(), packet_num);
            span.record("packets_sent", batch.pkt_sent());
            return Ok(batch.pkt_sent());
        }
        let Some(packet) = result.packet else {
            unreachable!("Successful build without a packet");
        };

        // Even a packet the socket refused counts as sent, loss recovery takes it from here
        update_connection(
            conn,
            result.packet_event,
            packet,
            Instant::now(),
            result.encoded_size,
        );
        if !result.write_success {
            debug!("Write of packet {} failed, stopping", packet_num);
            span.record("packets_sent", batch.pkt_sent());
            return Ok(batch.pkt_sent());
        }
    }

    batch.flush(conn, FlushType::AllowThreadLocalDelay)?;
    trace!(
        "{} wrote {} packets, loop began {}",
        scheduler.name(),
        batch.pkt_sent(),
        format_instant(write_loop_begin_time, Instant::now())
    );
    if let Some(accessor) = conn.buf_accessor.as_ref() {
        assert!(accessor.owns_buffer(), "Arena still checked out after the write loop");
        let buf = accessor.scoped();
        assert!(
            buf.is_empty() && buf.headroom() == 0,
            "Arena not drained after the write loop: {:?}",
            buf
        );
    }
    span.record("packets_sent", batch.pkt_sent());
    Ok(batch.pkt_sent())
}

fn probe_scheduler(level: QuicEncryptionLevel, except_crypto: bool) -> QuicFrameScheduler {
    let builder = FrameSchedulerBuilder::new(level, "ProbeScheduler")
        .blocked_frames()
        .window_update_frames()
        .simple_frames()
        .reset_frames()
        .stream_frames()
        .ping_frames();
    if except_crypto {
        builder.build()
    } else {
        builder.crypto_frames().build()
    }
}

fn main_scheduler(level: QuicEncryptionLevel, except_crypto: bool) -> QuicFrameScheduler {
    let builder = FrameSchedulerBuilder::new(level, "FrameScheduler")
        .stream_frames()
        .ack_frames()
        .reset_frames()
        .window_update_frames()
        .blocked_frames()
        .simple_frames()
        .ping_frames();
    if except_crypto {
        builder.build()
    } else {
        builder.crypto_frames().build()
    }
}

fn crypto_and_ack_scheduler(level: QuicEncryptionLevel) -> QuicFrameScheduler {
    FrameSchedulerBuilder::new(level, "CryptoAndAcksScheduler")
        .ack_frames()
        .crypto_frames()
        .build()
}

fn write_quic_data_to_socket_impl(
    sock: &mut dyn QuicUdpSocket,
    conn: &mut QuicConnectionState,
    packet_limit: u64,
    except_crypto: bool,
) -> Result<u64> {
    let src = conn.src_connection_id.clone();
    let dst = conn.dst_connection_id.clone();
    let header_builder = HeaderBuilder::Short(QuicProtectionType::KeyPhaseZero);
    let level = QuicEncryptionLevel::AppData;
    let write_loop_begin_time = Instant::now();

    let mut written = 0;
    let probes = conn.pending_events.num_probe_packets;
    if probes > 0 {
        let probe_written = write_probing_data_to_socket(
            sock,
            conn,
            &src,
            &dst,
            header_builder,
            level,
            probe_scheduler(level, except_crypto),
            packet_limit.min(probes),
            &[],
        )?;
        conn.pending_events.num_probe_packets = probes.saturating_sub(probe_written);
        written += probe_written;
    }

    let mut scheduler = main_scheduler(level, except_crypto);
    written += write_connection_data_to_socket(
        sock,
        conn,
        &src,
        &dst,
        header_builder,
        level.level(),
        &mut scheduler,
        congestion_control_writable_bytes,
        packet_limit.saturating_sub(written),
        &[],
        write_loop_begin_time,
    )?;
    debug!("Wrote {} 1-RTT packets", written);
    Ok(written)
}

/// Writes 1-RTT packets: probes first, then whatever the congestion window allows
pub fn write_quic_data_to_socket(
    sock: &mut dyn QuicUdpSocket,
    conn: &mut QuicConnectionState,
    packet_limit: u64,
) -> Result<u64> {
    write_quic_data_to_socket_impl(sock, conn, packet_limit, false)
}

pub fn write_quic_data_except_crypto_stream_to_socket(
    sock: &mut dyn QuicUdpSocket,
    conn: &mut QuicConnectionState,
    packet_limit: u64,
) -> Result<u64> {
    write_quic_data_to_socket_impl(sock, conn, packet_limit, true)
}

/// Writes acks and crypto data of a handshake level in long header packets
pub fn write_crypto_and_ack_data_to_socket(
    sock: &mut dyn QuicUdpSocket,
    conn: &mut QuicConnectionState,
    header_type: LongHeaderType,
    packet_limit: u64,
) -> Result<u64> {
    let header_builder = HeaderBuilder::Long(header_type);
    let level = header_encryption_level(header_builder);
    let src = conn.src_connection_id.clone();
    let dst = conn.dst_connection_id.clone();
    let token = conn.token.clone();
    let write_loop_begin_time = Instant::now();

    let mut written = 0;
    let probes = conn.pending_events.num_probe_packets;
    let has_crypto_in_flight = conn
        .crypto
        .stream(level)
        .is_some_and(|stream| !stream.retransmission_buffer.is_empty());
    if probes > 0 && (has_crypto_in_flight || crypto_and_ack_scheduler(level).has_data(conn)) {
        written = write_probing_data_to_socket(
            sock,
            conn,
            &src,
            &dst,
            header_builder,
            level,
            crypto_and_ack_scheduler(level),
            packet_limit.min(probes),
            &token,
        )?;
        conn.pending_events.num_probe_packets = probes.saturating_sub(written);
    }

    let mut scheduler = crypto_and_ack_scheduler(level);
    written += write_connection_data_to_socket(
        sock,
        conn,
        &src,
        &dst,
        header_builder,
        level.level(),
        &mut scheduler,
        congestion_control_writable_bytes,
        packet_limit.saturating_sub(written),
        &token,
        write_loop_begin_time,
    )?;
    debug!("Wrote {} {:?} packets", written, header_type);
    Ok(written)
}

/// Writes early data, only possible before 1-RTT keys exist
pub fn write_zero_rtt_data_to_socket(
    sock: &mut dyn QuicUdpSocket,
    conn: &mut QuicConnectionState,
    packet_limit: u64,
) -> Result<u64> {
    let src = conn.src_connection_id.clone();
    let dst = conn.dst_connection_id.clone();
    let mut scheduler =
        FrameSchedulerBuilder::new(QuicEncryptionLevel::EarlyData, "ZeroRttScheduler")
            .stream_frames()
            .reset_frames()
            .window_update_frames()
            .blocked_frames()
            .simple_frames()
            .build();
    write_connection_data_to_socket(
        sock,
        conn,
        &src,
        &dst,
        HeaderBuilder::Long(LongHeaderType::ZeroRtt),
        QuicLevel::Application,
        &mut scheduler,
        congestion_control_writable_bytes,
        packet_limit,
        &[],
        Instant::now(),
    )
}

/// Sends up to `probes_to_send` probes: clones of outstanding packets, or
/// pings when there is nothing to clone.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_probing_data_to_socket(
    sock: &mut dyn QuicUdpSocket,
    conn: &mut QuicConnectionState,
    src_connection_id: &[u8],
    dst_connection_id: &[u8],
    header_builder: HeaderBuilder,
    level: QuicEncryptionLevel,
    scheduler: QuicFrameScheduler,
    probes_to_send: u64,
    token: &[u8],
) -> Result<u64> {
    let pn_space = level.level();
    // A gap in the packet numbers makes the peer ack right away
    conn.increase_next_packet_num(pn_space);
    let overhead = write_cipher_for(conn, level)?.aead.overhead();
    let write_loop_begin_time = Instant::now();

    let mut cloning_scheduler = CloningScheduler::new(scheduler, "CloningScheduler", overhead);
    let mut written = write_connection_data_to_socket(
        sock,
        conn,
        src_connection_id,
        dst_connection_id,
        header_builder,
        pn_space,
        &mut cloning_scheduler,
        unlimited_writable_bytes,
        probes_to_send,
        token,
        write_loop_begin_time,
    )?;

    if probes_to_send > 0 && written == 0 {
        debug!("Nothing to clone in {:?}, probing with a ping", pn_space);
        conn.pending_events.send_ping = true;
        let mut ping_scheduler = FrameSchedulerBuilder::new(level, "PingScheduler")
            .ping_frames()
            .build();
        written += write_connection_data_to_socket(
            sock,
            conn,
            src_connection_id,
            dst_connection_id,
            header_builder,
            pn_space,
            &mut ping_scheduler,
            unlimited_writable_bytes,
            probes_to_send - written,
            token,
            write_loop_begin_time,
        )?;
    }
    Ok(written)
}

/// Sends one path MTU probe when one has been requested
pub fn write_d6d_probe_to_socket(
    sock: &mut dyn QuicUdpSocket,
    conn: &mut QuicConnectionState,
) -> Result<u64> {
    if !conn.pending_events.d6d_send_probe_packet {
        return Ok(0);
    }
    let src = conn.src_connection_id.clone();
    let dst = conn.dst_connection_id.clone();
    let overhead = write_cipher_for(conn, QuicEncryptionLevel::AppData)?
        .aead
        .overhead();
    // Same gap as for other probes
    conn.increase_next_packet_num(QuicLevel::Application);

    let mut scheduler =
        D6DProbeScheduler::new("D6DProbeScheduler", overhead, conn.d6d.current_probe_size);
    let written = write_connection_data_to_socket(
        sock,
        conn,
        &src,
        &dst,
        HeaderBuilder::Short(QuicProtectionType::KeyPhaseZero),
        QuicLevel::Application,
        &mut scheduler,
        unlimited_writable_bytes,
        1,
        &[],
        Instant::now(),
    )?;
    if written > 0 {
        conn.pending_events.d6d_send_probe_packet = false;
    }
    Ok(written)
}

fn close_frame(close: Option<&(QuicErrorCode, String)>) -> QuicWriteFrame {
    let transport_close = |code: TransportErrorCode, reason: &str| QuicWriteFrame::ConnectionClose {
        error_code: code.into(),
        frame_type: 0,
        reason_phrase: reason.to_string(),
    };
    match close {
        None => transport_close(TransportErrorCode::NoError, "No error"),
        Some((QuicErrorCode::Application(code), reason)) => QuicWriteFrame::ApplicationClose {
            error_code: *code,
            reason_phrase: reason.clone(),
        },
        Some((QuicErrorCode::Transport(code), reason)) => transport_close(*code, reason),
        Some((QuicErrorCode::Local(_), _)) => {
            transport_close(TransportErrorCode::InternalError, "Internal error")
        }
    }
}

/// Builds a packet holding only a close frame and sends it straight to the
/// socket. Failures are logged, the connection is going away anyway.
fn write_close_common(
    sock: &mut dyn QuicUdpSocket,
    conn: &mut QuicConnectionState,
    header: QuicPacketHeader,
    close: Option<&(QuicErrorCode, String)>,
    cipher: &WriteCipher,
) -> Result<()> {
    let pn_space = header.level();
    let packet_num = header.packet_number();
    let header_form = header.header_form();
    let is_client_initial = conn.node_type == QuicNodeType::Client && header.is_initial();
    let largest_acked = largest_acked_by_peer(conn, &header);

    let mut builder =
        RegularPacketBuilder::new(DEFAULT_UDP_SEND_PACKET_LEN as usize, header, largest_acked);
    builder.encode_packet_header()?;
    builder.account_for_cipher_overhead(cipher.aead.overhead());

    let written = write_frame(close_frame(close), &mut builder)?;
    if written == 0 {
        error!("Close frame too large, packet {}", packet_num);
        return Ok(());
    }
    if is_client_initial {
        let remaining = builder.remaining_space();
        if remaining > 0 {
            write_frame(QuicWriteFrame::Padding { num_bytes: remaining }, &mut builder)?;
        }
    }

    let built = builder.build()?;
    let PacketBuffers::Chained { mut header, body } = built.buffers else {
        error!("Close packet {} has no room for a body", packet_num);
        return Ok(());
    };
    let cipher_text = cipher.aead.encrypt(&body, &header, packet_num)?;
    encrypt_packet_header(header_form, &mut header, &cipher_text, cipher.header_cipher.as_ref())?;
    conn.increase_next_packet_num(pn_space);

    let packet_size = header.len() + cipher_text.len();
    conn.loss_state.total_bytes_sent += packet_size as u64;
    match sock.write(&conn.peer_address, &[&header, &cipher_text]) {
        Ok(_) => {
            if let Some(stats) = conn.stats.as_ref() {
                stats.on_write(packet_size as u64);
            }
            debug!("Sent close packet {} of {} bytes", packet_num, packet_size);
        }
        Err(e) => debug!("Failed to write close packet {} due to {}", packet_num, e),
    }
    Ok(())
}

/// Sends a close in a long header packet of `header_type`
pub fn write_long_close(
    sock: &mut dyn QuicUdpSocket,
    conn: &mut QuicConnectionState,
    header_type: LongHeaderType,
    close: Option<&(QuicErrorCode, String)>,
) -> Result<()> {
    // The error may come before a connection id got bound
    if conn.server_connection_id.is_none() {
        return Ok(());
    }
    let level = match header_type {
        LongHeaderType::Initial => QuicEncryptionLevel::Initial,
        LongHeaderType::Handshake => QuicEncryptionLevel::Handshake,
        LongHeaderType::ZeroRtt => QuicEncryptionLevel::EarlyData,
        LongHeaderType::Retry => {
            warn!("Can not send a close in a retry packet");
            return Ok(());
        }
    };
    let Some(cipher) = conn.write_cipher(level).cloned() else {
        debug!("No {:?} write cipher for the close", level);
        return Ok(());
    };
    let header = HeaderBuilder::Long(header_type).build(
        &conn.src_connection_id,
        &conn.dst_connection_id,
        conn.next_packet_num(level.level()),
        conn.version,
        &[],
    );
    write_close_common(sock, conn, header, close, &cipher)
}

pub fn write_short_close(
    sock: &mut dyn QuicUdpSocket,
    conn: &mut QuicConnectionState,
    close: Option<&(QuicErrorCode, String)>,
) -> Result<()> {
    let Some(cipher) = conn.write_cipher(QuicEncryptionLevel::AppData).cloned() else {
        debug!("No 1-RTT write cipher for the close");
        return Ok(());
    };
    let header = HeaderBuilder::Short(QuicProtectionType::KeyPhaseZero).build(
        &conn.src_connection_id,
        &conn.dst_connection_id,
        conn.next_packet_num(QuicLevel::Application),
        conn.version,
        &[],
    );
    write_close_common(sock, conn, header, close, &cipher)
}

/// Bytes the congestion controller and any path or 0-RTT limit allow,
/// rounded up to whole packets.
pub fn congestion_control_writable_bytes(conn: &QuicConnectionState) -> u64 {
    let mut writable_bytes = u64::MAX;

    if conn.pending_events.path_challenge.is_some() || conn.outstanding_path_validation.is_some() {
        let Some(limiter) = conn.path_validation_limiter.as_ref() else {
            panic!("Validating a path without a rate limiter");
        };
        assert!(
            conn.writable_bytes_limit.is_none(),
            "Path validation while early data is limited"
        );
        // No RTT sample for a new path yet
        let rtt = if conn.loss_state.srtt.is_zero() {
            conn.config.get_default_initial_rtt()
        } else {
            conn.loss_state.srtt
        };
        writable_bytes = limiter.current_credit(Instant::now(), rtt);
    } else if let Some(limit) = conn.writable_bytes_limit {
        writable_bytes = limit.saturating_sub(conn.loss_state.total_bytes_sent);
    }

    if let Some(cc) = conn.congestion_controller.as_ref() {
        writable_bytes = writable_bytes.min(cc.get_writable_bytes());
    }
    if writable_bytes == u64::MAX {
        return writable_bytes;
    }
    writable_bytes.div_ceil(conn.udp_send_packet_len) * conn.udp_send_packet_len
}

pub fn unlimited_writable_bytes(_conn: &QuicConnectionState) -> u64 {
    u64::MAX
}

/// Some level with a write cipher owes the peer an ack right now
pub fn has_ack_data_to_write(conn: &QuicConnectionState) -> bool {
    [
        (QuicEncryptionLevel::Initial, QuicLevel::Initial),
        (QuicEncryptionLevel::Handshake, QuicLevel::Handshake),
        (QuicEncryptionLevel::AppData, QuicLevel::Application),
    ]
    .into_iter()
    .any(|(level, space)| {
        let ack_state = conn.ack_state(space);
        conn.has_write_cipher(level)
            && has_acks_to_schedule(ack_state)
            && ack_state.needs_to_send_ack_immediately
    })
}

pub fn has_non_ack_data_to_write(conn: &QuicConnectionState) -> WriteDataReason {
    let crypto_pending = [
        QuicEncryptionLevel::Initial,
        QuicEncryptionLevel::Handshake,
        QuicEncryptionLevel::AppData,
    ]
    .into_iter()
    .any(|level| {
        conn.has_write_cipher(level)
            && conn
                .crypto
                .stream(level)
                .is_some_and(|stream| stream.has_pending_data())
    });
    if crypto_pending {
        return WriteDataReason::Crypto;
    }
    if !conn.has_write_cipher(QuicEncryptionLevel::AppData)
        && !conn.has_write_cipher(QuicEncryptionLevel::EarlyData)
    {
        // Nothing else can be written before 1-RTT or 0-RTT keys
        return WriteDataReason::NoWrite;
    }
    if !conn.pending_events.resets.is_empty() {
        return WriteDataReason::Reset;
    }
    if conn.stream_manager.has_window_updates() {
        return WriteDataReason::StreamWindowUpdate;
    }
    if conn.pending_events.conn_window_update {
        return WriteDataReason::ConnWindowUpdate;
    }
    if conn.stream_manager.has_blocked() || conn.pending_events.send_data_blocked {
        return WriteDataReason::Blocked;
    }
    if send_conn_flow_control_bytes_wire(conn) != 0 && conn.stream_manager.has_writable() {
        return WriteDataReason::Stream;
    }
    if !conn.pending_events.frames.is_empty() {
        return WriteDataReason::Simple;
    }
    if conn.pending_events.path_challenge.is_some() {
        return WriteDataReason::PathChallenge;
    }
    if conn.pending_events.send_ping {
        return WriteDataReason::Ping;
    }
    WriteDataReason::NoWrite
}

/// Decides whether and why the connection should write now.
/// Acks go out even when the congestion window is closed.
pub fn should_write_data(conn: &QuicConnectionState) -> WriteDataReason {
    if conn.pending_events.num_probe_packets > 0 {
        debug!("Probes pending: {}", conn.pending_events.num_probe_packets);
        return WriteDataReason::Probes;
    }
    if has_ack_data_to_write(conn) {
        trace!("Acks to write");
        return WriteDataReason::Ack;
    }
    if congestion_control_writable_bytes(conn) == 0 {
        debug!("Congestion window blocks writing");
        if let Some(stats) = conn.stats.as_ref() {
            stats.on_cwnd_blocked();
        }
        return WriteDataReason::NoWrite;
    }
    has_non_ack_data_to_write(conn)
}
