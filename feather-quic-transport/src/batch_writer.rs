use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use tracing::{debug, trace};

use crate::buf_accessor::BufAccessor;
use crate::config::QuicBatchingMode;
use crate::connection::QuicConnectionState;
use crate::runtime::QuicUdpSocket;

/// Collects encoded packets until they are worth a system call.
///
/// Chained writers own the packet buffers handed to `append`, in place
/// writers only count sizes since the bytes already sit in the arena.
pub trait BatchWriter {
    fn empty(&self) -> bool;

    /// Bytes currently batched
    fn size(&self) -> usize;

    /// The next packet of `size` bytes can not join the current batch
    fn needs_flush(&self, _size: usize) -> bool {
        false
    }

    /// Returns true once the batch should be written out
    fn append(&mut self, buf: Option<Vec<u8>>, size: usize, addr: &SocketAddr) -> bool;

    fn write(&mut self, sock: &mut dyn QuicUdpSocket, addr: &SocketAddr) -> io::Result<usize>;

    fn reset(&mut self);

    fn is_thread_local(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct SinglePacketBatchWriter {
    buf: Option<Vec<u8>>,
}

impl BatchWriter for SinglePacketBatchWriter {
    fn empty(&self) -> bool {
        self.buf.is_none()
    }

    fn size(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    fn append(&mut self, buf: Option<Vec<u8>>, _size: usize, _addr: &SocketAddr) -> bool {
        self.buf = buf;
        true
    }

    fn write(&mut self, sock: &mut dyn QuicUdpSocket, addr: &SocketAddr) -> io::Result<usize> {
        match &self.buf {
            Some(buf) => sock.write(addr, &[buf.as_slice()]),
            None => Ok(0),
        }
    }

    fn reset(&mut self) {
        self.buf = None;
    }
}

pub struct SendmmsgPacketBatchWriter {
    max_bufs: usize,
    bufs: Vec<Vec<u8>>,
    size: usize,
}

impl SendmmsgPacketBatchWriter {
    pub fn new(max_bufs: usize) -> Self {
        Self {
            max_bufs,
            bufs: Vec::with_capacity(max_bufs),
            size: 0,
        }
    }
}

impl BatchWriter for SendmmsgPacketBatchWriter {
    fn empty(&self) -> bool {
        self.bufs.is_empty()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn append(&mut self, buf: Option<Vec<u8>>, size: usize, _addr: &SocketAddr) -> bool {
        if let Some(buf) = buf {
            self.size += size;
            self.bufs.push(buf);
        }
        self.bufs.len() >= self.max_bufs
    }

    fn write(&mut self, sock: &mut dyn QuicUdpSocket, addr: &SocketAddr) -> io::Result<usize> {
        let datagrams: Vec<&[u8]> = self.bufs.iter().map(|b| b.as_slice()).collect();
        sock.writem(addr, &datagrams)
    }

    fn reset(&mut self) {
        self.bufs.clear();
        self.size = 0;
    }
}

/// Sends the one packet built in the connection arena
pub struct SinglePacketInplaceBatchWriter {
    accessor: BufAccessor,
}

impl SinglePacketInplaceBatchWriter {
    pub fn new(accessor: BufAccessor) -> Self {
        Self { accessor }
    }
}

impl BatchWriter for SinglePacketInplaceBatchWriter {
    fn empty(&self) -> bool {
        self.accessor.scoped().is_empty()
    }

    fn size(&self) -> usize {
        self.accessor.scoped().len()
    }

    fn append(&mut self, _buf: Option<Vec<u8>>, _size: usize, _addr: &SocketAddr) -> bool {
        true
    }

    fn write(&mut self, sock: &mut dyn QuicUdpSocket, addr: &SocketAddr) -> io::Result<usize> {
        let buf = self.accessor.scoped();
        sock.write(addr, &[buf.data()])
    }

    fn reset(&mut self) {
        self.accessor.scoped().clear();
    }
}

/// Sends the packets laid back to back in the connection arena, one
/// datagram each.
pub struct SendmmsgInplacePacketBatchWriter {
    accessor: BufAccessor,
    max_bufs: usize,
    sizes: Vec<usize>,
}

impl SendmmsgInplacePacketBatchWriter {
    pub fn new(accessor: BufAccessor, max_bufs: usize) -> Self {
        Self {
            accessor,
            max_bufs,
            sizes: Vec::with_capacity(max_bufs),
        }
    }
}

impl BatchWriter for SendmmsgInplacePacketBatchWriter {
    fn empty(&self) -> bool {
        self.sizes.is_empty()
    }

    fn size(&self) -> usize {
        self.sizes.iter().sum()
    }

    fn needs_flush(&self, size: usize) -> bool {
        !self.sizes.is_empty() && self.accessor.scoped().tailroom() < size
    }

    fn append(&mut self, _buf: Option<Vec<u8>>, size: usize, _addr: &SocketAddr) -> bool {
        self.sizes.push(size);
        self.sizes.len() >= self.max_bufs
    }

    fn write(&mut self, sock: &mut dyn QuicUdpSocket, addr: &SocketAddr) -> io::Result<usize> {
        let buf = self.accessor.scoped();
        let data = buf.data();
        assert_eq!(
            data.len(),
            self.size(),
            "Arena does not hold exactly the batched packets"
        );
        let mut datagrams = Vec::with_capacity(self.sizes.len());
        let mut start = 0;
        for size in &self.sizes {
            datagrams.push(&data[start..start + size]);
            start += size;
        }
        sock.writem(addr, &datagrams)
    }

    fn reset(&mut self) {
        self.sizes.clear();
        self.accessor.scoped().clear();
    }
}

thread_local! {
    static THREAD_LOCAL_BATCHES: RefCell<HashMap<SocketAddr, Vec<Vec<u8>>>> =
        RefCell::new(HashMap::new());
}

/// Leaves packets in a per thread queue, so the writes of several
/// connections on one event loop thread go out together.
pub struct ThreadLocalBatchWriter {
    peer_address: SocketAddr,
    max_bufs: usize,
}

impl ThreadLocalBatchWriter {
    pub fn new(peer_address: SocketAddr, max_bufs: usize) -> Self {
        Self {
            peer_address,
            max_bufs,
        }
    }

    fn pending(&self) -> (usize, usize) {
        THREAD_LOCAL_BATCHES.with(|batches| {
            batches
                .borrow()
                .get(&self.peer_address)
                .map_or((0, 0), |bufs| (bufs.len(), bufs.iter().map(|b| b.len()).sum()))
        })
    }
}

impl BatchWriter for ThreadLocalBatchWriter {
    fn empty(&self) -> bool {
        self.pending().0 == 0
    }

    fn size(&self) -> usize {
        self.pending().1
    }

    fn append(&mut self, buf: Option<Vec<u8>>, _size: usize, addr: &SocketAddr) -> bool {
        let Some(buf) = buf else {
            return false;
        };
        let queued = THREAD_LOCAL_BATCHES.with(|batches| {
            let mut batches = batches.borrow_mut();
            let bufs = batches.entry(*addr).or_default();
            bufs.push(buf);
            bufs.len()
        });
        queued >= self.max_bufs
    }

    fn write(&mut self, sock: &mut dyn QuicUdpSocket, addr: &SocketAddr) -> io::Result<usize> {
        THREAD_LOCAL_BATCHES.with(|batches| {
            let batches = batches.borrow();
            match batches.get(addr) {
                Some(bufs) => {
                    let datagrams: Vec<&[u8]> = bufs.iter().map(|b| b.as_slice()).collect();
                    sock.writem(addr, &datagrams)
                }
                None => Ok(0),
            }
        })
    }

    fn reset(&mut self) {
        THREAD_LOCAL_BATCHES.with(|batches| {
            batches.borrow_mut().remove(&self.peer_address);
        });
    }

    fn is_thread_local(&self) -> bool {
        true
    }
}

/// Writes out and drops whatever this thread still holds for `addr`,
/// meant for the end of an event loop iteration.
pub fn flush_thread_local_batches(
    sock: &mut dyn QuicUdpSocket,
    addr: &SocketAddr,
) -> io::Result<usize> {
    let bufs = THREAD_LOCAL_BATCHES.with(|batches| batches.borrow_mut().remove(addr));
    match bufs {
        Some(bufs) if !bufs.is_empty() => {
            let datagrams: Vec<&[u8]> = bufs.iter().map(|b| b.as_slice()).collect();
            trace!("Flushing {} thread local packets to {}", datagrams.len(), addr);
            sock.writem(addr, &datagrams)
        }
        _ => Ok(0),
    }
}

pub struct BatchWriterFactory;

impl BatchWriterFactory {
    pub fn make_batch_writer(conn: &QuicConnectionState) -> Box<dyn BatchWriter> {
        let config = &conn.config;
        let batching_mode = config.get_batching_mode();
        let max_batch_size = match batching_mode {
            QuicBatchingMode::None => 1,
            QuicBatchingMode::Sendmmsg => config.get_max_batch_size() as usize,
        };

        if let Some(accessor) = conn.buf_accessor.clone() {
            return match batching_mode {
                QuicBatchingMode::None => Box::new(SinglePacketInplaceBatchWriter::new(accessor)),
                QuicBatchingMode::Sendmmsg => Box::new(SendmmsgInplacePacketBatchWriter::new(
                    accessor,
                    max_batch_size,
                )),
            };
        }

        if config.get_use_thread_local_batching() {
            debug!("Thread local batching towards {}", conn.peer_address);
            return Box::new(ThreadLocalBatchWriter::new(
                conn.peer_address,
                config.get_max_batch_size() as usize,
            ));
        }

        match batching_mode {
            QuicBatchingMode::None => Box::<SinglePacketBatchWriter>::default(),
            QuicBatchingMode::Sendmmsg => Box::new(SendmmsgPacketBatchWriter::new(max_batch_size)),
        }
    }
}
