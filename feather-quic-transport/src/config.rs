use std::time::Duration;
use tracing::warn;

pub const DEFAULT_UDP_SEND_PACKET_LEN: u16 = 1252;
pub const DEFAULT_MAX_BATCH_SIZE: u32 = 16;
pub const DEFAULT_WRITE_CONNECTION_DATA_PACKETS_LIMIT: u64 = 5;
pub const DEFAULT_WRITE_LIMIT_RTT_FRACTION: u32 = 25;
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;
const DEFAULT_USE_THREAD_LOCAL_BATCHING: bool = false;
const DEFAULT_D6D_BASE_PROBE_SIZE: u16 = 1252;

/// How packets are laid out in memory while they are built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataPathType {
    /// A fresh buffer per packet
    #[default]
    ChainedMemory,
    /// Packets are appended into one connection owned arena
    ContinuousMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuicBatchingMode {
    #[default]
    None,
    Sendmmsg,
}

#[derive(Clone, Default, Debug)]
pub struct QuicTransportConfig {
    udp_send_packet_len: Option<u16>,
    data_path_type: Option<DataPathType>,
    batching_mode: Option<QuicBatchingMode>,
    max_batch_size: Option<u32>,
    write_connection_data_packets_limit: Option<u64>,
    write_limit_rtt_fraction: Option<u32>,
    use_thread_local_batching: Option<bool>,
    default_initial_rtt: Option<Duration>,
    ack_delay_exponent: Option<u8>,
    d6d_base_probe_size: Option<u16>,
}

impl QuicTransportConfig {
    pub fn set_udp_send_packet_len(&mut self, udp_send_packet_len: u16) {
        self.udp_send_packet_len = Some(udp_send_packet_len);
    }

    pub(crate) fn get_udp_send_packet_len(&self) -> u16 {
        self.udp_send_packet_len
            .unwrap_or(DEFAULT_UDP_SEND_PACKET_LEN)
    }

    pub fn set_data_path_type(&mut self, data_path_type: DataPathType) {
        self.data_path_type = Some(data_path_type);
    }

    pub(crate) fn get_data_path_type(&self) -> DataPathType {
        self.data_path_type.unwrap_or_default()
    }

    pub fn set_batching_mode(&mut self, batching_mode: QuicBatchingMode) {
        self.batching_mode = Some(batching_mode);
    }

    pub(crate) fn get_batching_mode(&self) -> QuicBatchingMode {
        self.batching_mode.unwrap_or_default()
    }

    pub fn set_max_batch_size(&mut self, max_batch_size: u32) {
        self.max_batch_size = Some(max_batch_size);
    }

    pub(crate) fn get_max_batch_size(&self) -> u32 {
        self.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE).max(1)
    }

    pub fn set_write_connection_data_packets_limit(&mut self, limit: u64) {
        self.write_connection_data_packets_limit = Some(limit);
    }

    /// Packet limit hosts pass to the write entry points per event loop iteration
    pub fn get_write_connection_data_packets_limit(&self) -> u64 {
        self.write_connection_data_packets_limit
            .unwrap_or(DEFAULT_WRITE_CONNECTION_DATA_PACKETS_LIMIT)
    }

    pub fn set_write_limit_rtt_fraction(&mut self, fraction: u32) {
        self.write_limit_rtt_fraction = Some(fraction);
    }

    pub(crate) fn get_write_limit_rtt_fraction(&self) -> u32 {
        self.write_limit_rtt_fraction
            .unwrap_or(DEFAULT_WRITE_LIMIT_RTT_FRACTION)
            .max(1)
    }

    pub fn set_use_thread_local_batching(&mut self, enable: bool) {
        self.use_thread_local_batching = Some(enable);
    }

    pub(crate) fn get_use_thread_local_batching(&self) -> bool {
        let enabled = self
            .use_thread_local_batching
            .unwrap_or(DEFAULT_USE_THREAD_LOCAL_BATCHING);
        if enabled && self.get_data_path_type() == DataPathType::ContinuousMemory {
            warn!("Thread local batching is not supported by the continuous data path, ignore it");
            return false;
        }
        enabled
    }

    pub fn set_default_initial_rtt(&mut self, rtt: Duration) {
        self.default_initial_rtt = Some(rtt);
    }

    pub(crate) fn get_default_initial_rtt(&self) -> Duration {
        self.default_initial_rtt.unwrap_or(DEFAULT_INITIAL_RTT)
    }

    pub fn set_ack_delay_exponent(&mut self, exponent: u8) {
        self.ack_delay_exponent = Some(exponent);
    }

    pub(crate) fn get_ack_delay_exponent(&self) -> u8 {
        self.ack_delay_exponent
            .unwrap_or(DEFAULT_ACK_DELAY_EXPONENT)
    }

    pub fn set_d6d_base_probe_size(&mut self, size: u16) {
        self.d6d_base_probe_size = Some(size);
    }

    pub(crate) fn get_d6d_base_probe_size(&self) -> u16 {
        self.d6d_base_probe_size
            .unwrap_or(DEFAULT_D6D_BASE_PROBE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = QuicTransportConfig::default();
        assert_eq!(config.get_udp_send_packet_len(), DEFAULT_UDP_SEND_PACKET_LEN);
        assert_eq!(config.get_data_path_type(), DataPathType::ChainedMemory);
        assert_eq!(config.get_batching_mode(), QuicBatchingMode::None);
        assert_eq!(config.get_max_batch_size(), DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(
            config.get_write_connection_data_packets_limit(),
            DEFAULT_WRITE_CONNECTION_DATA_PACKETS_LIMIT
        );
        assert_eq!(config.get_write_limit_rtt_fraction(), 25);
        assert!(!config.get_use_thread_local_batching());
        assert_eq!(config.get_default_initial_rtt(), DEFAULT_INITIAL_RTT);
    }

    #[test]
    fn test_thread_local_batching_needs_chained_memory() {
        let mut config = QuicTransportConfig::default();
        config.set_use_thread_local_batching(true);
        assert!(config.get_use_thread_local_batching());

        config.set_data_path_type(DataPathType::ContinuousMemory);
        assert!(!config.get_use_thread_local_batching());
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let mut config = QuicTransportConfig::default();
        config.set_max_batch_size(0);
        config.set_write_limit_rtt_fraction(0);
        assert_eq!(config.get_max_batch_size(), 1);
        assert_eq!(config.get_write_limit_rtt_fraction(), 1);
    }
}
