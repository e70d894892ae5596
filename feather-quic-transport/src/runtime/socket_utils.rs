use anyhow::{Context, Result};
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use tracing::{info, trace, warn};

use super::QuicUdpSocket;

/// Errors after which the socket is expected to be usable again
pub(crate) fn is_retriable_error(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(e) => {
            e == libc::EAGAIN || e == libc::EWOULDBLOCK || e == libc::ENOBUFS || e == libc::EMSGSIZE
        }
        None => err.kind() == io::ErrorKind::WouldBlock,
    }
}

pub(crate) fn is_network_unreachable(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENETUNREACH)
}

/// Sets the Don't Fragment (DF) flag on a UDP socket.
/// Path MTU probes are only meaningful when the kernel does not fragment them.
fn set_dont_fragment(socket: &UdpSocket) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = socket.as_raw_fd();
        let val: libc::c_int = libc::IP_PMTUDISC_DO;
        unsafe {
            if libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_MTU_DISCOVER,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of_val(&val) as libc::socklen_t,
            ) < 0
            {
                warn!("Failed to set IP_MTU_DISCOVER on socket");
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = socket.as_raw_fd();
        let val: libc::c_int = 1;
        unsafe {
            if libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_DONTFRAG,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of_val(&val) as libc::socklen_t,
            ) < 0
            {
                warn!("Failed to set IP_DONTFRAG on socket");
            }
        }
    }
}

/// `QuicUdpSocket` on top of a mio socket, with read interest toggled
/// through the registry it was registered with.
pub struct MioUdpSocket {
    socket: UdpSocket,
    registration: Option<(Registry, Token)>,
    read_paused: bool,
    scratch: Vec<u8>,
}

impl MioUdpSocket {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .with_context(|| format!("Failed to bind udp socket due to address {addr}"))?;
        set_dont_fragment(&socket);
        info!("Bound udp socket {:?}", socket.local_addr());
        Ok(Self {
            socket,
            registration: None,
            read_paused: false,
            scratch: Vec::with_capacity(1 << 16),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> Result<()> {
        registry
            .register(&mut self.socket, token, Interest::READABLE)
            .context("Failed to register udp socket due to poll registry error")?;
        let registry = registry
            .try_clone()
            .context("Failed to clone poll registry")?;
        self.registration = Some((registry, token));
        Ok(())
    }

    pub fn is_read_paused(&self) -> bool {
        self.read_paused
    }

    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }
}

impl QuicUdpSocket for MioUdpSocket {
    fn write(&mut self, addr: &SocketAddr, bufs: &[&[u8]]) -> io::Result<usize> {
        let sent = match bufs {
            [single] => self.socket.send_to(single, *addr)?,
            _ => {
                self.scratch.clear();
                for buf in bufs {
                    self.scratch.extend_from_slice(buf);
                }
                self.socket.send_to(&self.scratch, *addr)?
            }
        };
        trace!("Sent {} bytes to {}", sent, addr);
        Ok(sent)
    }

    fn pause_read(&mut self) {
        if self.read_paused {
            return;
        }
        if let Some((registry, _)) = &self.registration {
            if let Err(e) = registry.deregister(&mut self.socket) {
                warn!("Failed to pause read on udp socket: {}", e);
                return;
            }
        }
        self.read_paused = true;
    }

    fn resume_read(&mut self) {
        if !self.read_paused {
            return;
        }
        if let Some((registry, token)) = &self.registration {
            if let Err(e) = registry.register(&mut self.socket, *token, Interest::READABLE) {
                warn!("Failed to resume read on udp socket: {}", e);
                return;
            }
        }
        self.read_paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        for errno in [libc::EAGAIN, libc::ENOBUFS, libc::EMSGSIZE] {
            assert!(is_retriable_error(&io::Error::from_raw_os_error(errno)));
        }
        assert!(!is_retriable_error(&io::Error::from_raw_os_error(libc::ENETUNREACH)));
        assert!(!is_retriable_error(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(is_network_unreachable(&io::Error::from_raw_os_error(libc::ENETUNREACH)));
    }

    #[test]
    fn test_mio_socket_gathers_buffers() -> Result<()> {
        let mut receiver = MioUdpSocket::bind("127.0.0.1:0".parse()?)?;
        let mut sender = MioUdpSocket::bind("127.0.0.1:0".parse()?)?;
        let peer = receiver.local_addr()?;

        let sent = sender.write(&peer, &[&[1u8, 2, 3][..], &[4u8, 5][..]])?;
        assert_eq!(sent, 5);

        let mut buf = [0u8; 64];
        let mut received = None;
        for _ in 0..100 {
            match receiver.inner().recv_from(&mut buf) {
                Ok((n, _)) => {
                    received = Some(n);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5))
                }
                Err(e) => return Err(e.into()),
            }
        }
        assert_eq!(received, Some(5));
        assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);

        // Pausing an unregistered socket only flips the flag
        receiver.pause_read();
        assert!(receiver.is_read_paused());
        receiver.resume_read();
        assert!(!receiver.is_read_paused());
        Ok(())
    }
}
