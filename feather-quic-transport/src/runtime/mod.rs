use std::io;
use std::net::SocketAddr;

mod event_base;
mod socket_utils;

pub use event_base::{CallbackHandle, QuicEventBase, TimerHandle};
pub use socket_utils::MioUdpSocket;
pub(crate) use socket_utils::{is_network_unreachable, is_retriable_error};

/// Non blocking datagram socket the send path writes through
pub trait QuicUdpSocket {
    /// Sends `bufs` gathered into a single datagram
    fn write(&mut self, addr: &SocketAddr, bufs: &[&[u8]]) -> io::Result<usize>;

    /// Sends each buffer as its own datagram, returning how many went out
    fn writem(&mut self, addr: &SocketAddr, datagrams: &[&[u8]]) -> io::Result<usize> {
        let mut sent = 0;
        for datagram in datagrams {
            match self.write(addr, &[*datagram]) {
                Ok(_) => sent += 1,
                Err(e) if sent == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(sent)
    }

    fn pause_read(&mut self);

    fn resume_read(&mut self);
}
