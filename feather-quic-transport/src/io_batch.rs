use anyhow::Result;
use std::io;
use std::net::SocketAddr;
use tracing::{error, trace, warn};

use crate::batch_writer::BatchWriter;
use crate::connection::QuicConnectionState;
use crate::error_code::{LocalErrorCode, QuicTransportError, TransportErrorCode};
use crate::happy_eyeballs::happy_eyeballs_start_second_socket;
use crate::runtime::{is_network_unreachable, is_retriable_error, QuicUdpSocket};
use crate::stats::errno_to_socket_error_type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    Always,
    /// Thread local batches are left for the end of the loop iteration
    AllowThreadLocalDelay,
}

/// Packets of one transmission loop run on their way to the socket(s)
pub struct IOBufQuicBatch<'a> {
    batch_writer: Box<dyn BatchWriter>,
    thread_local: bool,
    sock: &'a mut dyn QuicUdpSocket,
    peer_address: SocketAddr,
    pkt_sent: u64,
    last_error: Option<io::Error>,
}

impl<'a> IOBufQuicBatch<'a> {
    pub fn new(
        batch_writer: Box<dyn BatchWriter>,
        sock: &'a mut dyn QuicUdpSocket,
        peer_address: SocketAddr,
    ) -> Self {
        let thread_local = batch_writer.is_thread_local();
        Self {
            batch_writer,
            thread_local,
            sock,
            peer_address,
            pkt_sent: 0,
            last_error: None,
        }
    }

    pub fn pkt_sent(&self) -> u64 {
        self.pkt_sent
    }

    /// Adds one encoded packet, flushing when the writer asks for it.
    /// `buf` is None when the packet already sits in the connection arena.
    ///
    /// Returns false when a flush this packet took part in wrote nothing.
    pub fn write(
        &mut self,
        conn: &mut QuicConnectionState,
        buf: Option<Vec<u8>>,
        encoded_size: usize,
    ) -> Result<bool> {
        self.pkt_sent += 1;

        // The previous packets go out on their own, a false return only
        // concerns them
        if self.batch_writer.needs_flush(encoded_size) {
            self.flush(conn, FlushType::Always)?;
        }

        if self
            .batch_writer
            .append(buf, encoded_size, &self.peer_address)
        {
            return self.flush(conn, FlushType::Always);
        }
        Ok(true)
    }

    pub fn flush(
        &mut self,
        conn: &mut QuicConnectionState,
        flush_type: FlushType,
    ) -> Result<bool> {
        if self.thread_local && flush_type == FlushType::AllowThreadLocalDelay {
            return Ok(true);
        }
        let written = self.flush_internal(conn);
        self.batch_writer.reset();
        written
    }

    fn flush_internal(&mut self, conn: &mut QuicConnectionState) -> Result<bool> {
        if self.batch_writer.empty() {
            return Ok(true);
        }

        let batch_size = self.batch_writer.size();
        let mut written = false;
        let he = &mut conn.happy_eyeballs;

        if he.eligibility.first_eligible() {
            match self.batch_writer.write(&mut *self.sock, &self.peer_address) {
                Ok(n) => {
                    trace!("Flushed {} bytes ({} sent) on first socket", batch_size, n);
                    written = true;
                }
                Err(e) => {
                    if is_retriable_error(&e) {
                        warn!(
                            "Retriable error on first socket write, size {}: {}",
                            batch_size, e
                        );
                    } else {
                        error!("Error on first socket write, size {}: {}", batch_size, e);
                        he.eligibility = he.eligibility.without_first();
                        self.sock.pause_read();
                    }
                    self.last_error = Some(e);
                }
            }
        }

        // The first socket failing is as good as the delay running out
        if !written && he.is_conn_attempt_delay_scheduled() {
            he.cancel_conn_attempt_delay();
            happy_eyeballs_start_second_socket(he);
        }

        if he.eligibility.second_eligible() {
            if let (Some(sock), Some(addr)) = (he.second_socket.as_mut(), he.second_peer_address) {
                match self.batch_writer.write(sock.as_mut(), &addr) {
                    Ok(_) => written = true,
                    Err(e) => {
                        if is_retriable_error(&e) {
                            warn!(
                                "Retriable error on second socket write, size {}: {}",
                                batch_size, e
                            );
                        } else {
                            error!("Error on second socket write, size {}: {}", batch_size, e);
                            he.eligibility = he.eligibility.without_second();
                            sock.pause_read();
                        }
                        self.last_error = Some(e);
                    }
                }
            }
        }

        if !written {
            if let (Some(stats), Some(e)) = (conn.stats.as_ref(), self.last_error.as_ref()) {
                stats.on_udp_socket_write_error(errno_to_socket_error_type(e));
            }
        }

        if !conn.happy_eyeballs.eligibility.first_eligible()
            && !conn.happy_eyeballs.eligibility.second_eligible()
        {
            return Err(self.fatal_write_error(batch_size).into());
        }
        Ok(written)
    }

    fn fatal_write_error(&self, batch_size: usize) -> QuicTransportError {
        let mut reason = match &self.last_error {
            Some(e) => format!("Error on socket write {e}"),
            None => "Error on socket write".to_string(),
        };
        let last_error = self.last_error.as_ref();
        if last_error.and_then(|e| e.raw_os_error()) == Some(libc::EMSGSIZE) {
            reason.push_str(&format!(", pktSize={batch_size}"));
        }
        if last_error.is_some_and(is_network_unreachable) {
            QuicTransportError::Local {
                code: LocalErrorCode::ConnectionAbandoned,
                reason,
            }
        } else {
            QuicTransportError::Transport {
                code: TransportErrorCode::InternalError,
                reason,
            }
        }
    }
}
