// Re-export commonly used types and functions
pub mod prelude {
    pub use crate::ack::{
        default_ack_visitor, mark_packet_loss, process_ack_frame, AckEvent, ReadAckFrame,
    };
    pub use crate::batch_writer::{flush_thread_local_batches, BatchWriter, BatchWriterFactory};
    pub use crate::config::{DataPathType, QuicBatchingMode, QuicTransportConfig};
    pub use crate::congestion::{CongestionController, Pacer, PathValidationLimiter};
    pub use crate::connection::{QuicConnectionState, QuicEncryptionLevel, QuicLevel, QuicNodeType};
    pub use crate::crypto::{AesGcmAead, AesHeaderProtector, QuicAead, QuicHeaderProtector};
    pub use crate::error_code::{
        LocalErrorCode, QuicErrorCode, QuicTransportError, TransportErrorCode,
    };
    pub use crate::handshake::{handshake_confirmed, implicit_ack_crypto_stream};
    pub use crate::looper::{FunctionLooper, LooperHandle, LooperType};
    pub use crate::packet::LongHeaderType;
    pub use crate::runtime::{MioUdpSocket, QuicEventBase, QuicUdpSocket};
    pub use crate::stats::{QuicTransportStats, QuicTransportStatsCallback, SocketErrorType};
    pub use crate::transmit::{
        congestion_control_writable_bytes, has_ack_data_to_write, has_non_ack_data_to_write,
        should_write_data, unlimited_writable_bytes, write_crypto_and_ack_data_to_socket,
        write_d6d_probe_to_socket, write_long_close,
        write_quic_data_except_crypto_stream_to_socket, write_quic_data_to_socket,
        write_short_close, write_zero_rtt_data_to_socket, WriteDataReason,
    };
}

// Internal modules
pub mod ack;
pub mod batch_writer;
mod buf_accessor;
mod builder;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod crypto;
pub mod error_code;
mod flow_control;
pub mod frame;
pub mod handshake;
pub mod happy_eyeballs;
pub mod io_batch;
pub mod looper;
pub mod packet;
pub mod runtime;
mod scheduler;
pub mod stats;
pub mod stream;
pub mod transmit;
mod update;
mod utils;

#[cfg(test)]
mod test_utils;

// Re-export prelude for convenience
pub use prelude::*;
