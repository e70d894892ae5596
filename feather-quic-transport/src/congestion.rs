use std::time::{Duration, Instant};

use crate::connection::OutstandingPacket;

pub trait CongestionController {
    fn get_writable_bytes(&self) -> u64;

    fn get_congestion_window(&self) -> u64;

    fn on_packet_sent(&mut self, packet: &OutstandingPacket);

    fn is_app_limited(&self) -> bool {
        false
    }
}

pub trait Pacer {
    fn on_packet_sent(&mut self);

    /// Zero means writing is allowed right now
    fn get_time_until_next_write(&self, now: Instant) -> Duration;
}

/// Caps what may be sent to an unvalidated path
pub trait PathValidationLimiter {
    /// Bytes the unvalidated path may take right now
    fn current_credit(&self, now: Instant, rtt: Duration) -> u64;

    fn on_packet_sent(&mut self, bytes: u64);
}
