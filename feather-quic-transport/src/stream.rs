use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{info, trace};

use crate::flow_control::QuicStreamFlowControl;

/// Contiguous bytes of a stream at a fixed offset
#[derive(Clone, PartialEq, Eq)]
pub struct StreamBuffer {
    pub offset: u64,
    pub data: Vec<u8>,
    pub eof: bool,
}

impl StreamBuffer {
    pub fn new(offset: u64, data: Vec<u8>, eof: bool) -> Self {
        Self { offset, data, eof }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }

    /// Splits off the first `len` bytes, leaving the tail behind
    pub(crate) fn split_front(&mut self, len: u64) -> StreamBuffer {
        assert!(len <= self.len(), "Split {} over buffer length {}", len, self.len());
        let tail = self.data.split_off(len as usize);
        let front = std::mem::replace(&mut self.data, tail);
        let offset = self.offset;
        self.offset += len;
        StreamBuffer::new(offset, front, false)
    }
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}){}", self.offset, self.end(), if self.eof { " fin" } else { "" })
    }
}

/// Unsent bytes, kept as the chunks the application handed over
#[derive(Default)]
pub(crate) struct QuicWriteBuffer {
    chunks: VecDeque<Vec<u8>>,
    len: usize,
}

impl QuicWriteBuffer {
    pub(crate) fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.chunks.push_back(data.to_vec());
        self.len += data.len();
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies out the first `len` bytes without consuming them
    pub(crate) fn peek(&self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len.min(self.len));
        for chunk in &self.chunks {
            let want = len - out.len();
            if want == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..want.min(chunk.len())]);
        }
        out
    }

    /// Takes up to `len` bytes off the front
    pub(crate) fn split_at_most(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len.min(self.len));
        while out.len() < len {
            let chunk = match self.chunks.front_mut() {
                Some(chunk) => chunk,
                None => break,
            };
            let want = len - out.len();
            if chunk.len() <= want {
                out.extend_from_slice(chunk);
                self.chunks.pop_front();
            } else {
                out.extend_from_slice(&chunk[..want]);
                chunk.drain(..want);
            }
        }
        self.len -= out.len();
        out
    }
}

impl std::fmt::Debug for QuicWriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bytes in {} chunks", self.len, self.chunks.len())
    }
}

/// Send side state shared by application streams and the crypto streams.
///
/// Every sent byte lives in exactly one of the write buffer (not sent yet),
/// the retransmission buffer (sent, waiting for an ack) or the loss buffer
/// (declared lost, waiting to be resent).
#[derive(Default)]
pub struct QuicStreamLike {
    pub(crate) write_buffer: QuicWriteBuffer,
    pub(crate) retransmission_buffer: BTreeMap<u64, StreamBuffer>,
    // Sorted by offset
    pub(crate) loss_buffer: Vec<StreamBuffer>,
    pub(crate) current_write_offset: u64,
    pub(crate) final_write_offset: Option<u64>,
    pub(crate) num_packets_tx_with_new_data: u64,
}

impl std::fmt::Debug for QuicStreamLike {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "write offset {}, write buffer {:?}, retransmission {:?}, loss {:?}",
            self.current_write_offset,
            self.write_buffer,
            self.retransmission_buffer.values().collect::<Vec<_>>(),
            self.loss_buffer
        )
    }
}

impl QuicStreamLike {
    pub fn write(&mut self, data: &[u8], eof: bool) {
        self.write_buffer.append(data);
        if eof {
            self.final_write_offset =
                Some(self.current_write_offset + self.write_buffer.len() as u64);
        }
        trace!(
            "Queued {} bytes, eof {}, stream send state {:?}",
            data.len(),
            eof,
            self
        );
    }

    pub fn write_buffer_len(&self) -> u64 {
        self.write_buffer.len() as u64
    }

    pub fn current_write_offset(&self) -> u64 {
        self.current_write_offset
    }

    pub fn retransmission_buffer(&self) -> &BTreeMap<u64, StreamBuffer> {
        &self.retransmission_buffer
    }

    pub fn loss_buffer(&self) -> &[StreamBuffer] {
        &self.loss_buffer
    }

    pub fn num_packets_tx_with_new_data(&self) -> u64 {
        self.num_packets_tx_with_new_data
    }

    /// The fin bit has been queued but not written yet
    pub(crate) fn has_pending_fin(&self) -> bool {
        self.final_write_offset
            .is_some_and(|fin| self.current_write_offset <= fin)
    }

    pub(crate) fn insert_into_loss_buffer(&mut self, buf: StreamBuffer) {
        let pos = self.loss_buffer.partition_point(|b| b.offset < buf.offset);
        self.loss_buffer.insert(pos, buf);
    }

    pub(crate) fn has_pending_data(&self) -> bool {
        !self.write_buffer.is_empty() || !self.loss_buffer.is_empty()
    }
}

/// Keeps the sets the schedulers iterate, so none of them has to scan every stream
#[derive(Default)]
pub struct QuicStreamState {
    pub(crate) id: u64,
    pub(crate) send: QuicStreamLike,
    pub(crate) flow_control: QuicStreamFlowControl,
}

impl QuicStreamState {
    pub(crate) fn new(id: u64, flow_control: QuicStreamFlowControl) -> Self {
        Self {
            id,
            send: QuicStreamLike::default(),
            flow_control,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send_state(&self) -> &QuicStreamLike {
        &self.send
    }

    pub(crate) fn send_flow_control_bytes(&self) -> u64 {
        self.flow_control
            .get_sent_available_bytes(self.send.current_write_offset)
    }

    /// New data that flow control lets out, or a lone fin
    pub(crate) fn has_writable_data(&self) -> bool {
        (!self.send.write_buffer.is_empty() && self.send_flow_control_bytes() > 0)
            || (self.send.write_buffer.is_empty() && self.send.has_pending_fin())
    }

    pub(crate) fn has_loss_data(&self) -> bool {
        !self.send.loss_buffer.is_empty()
    }
}

#[derive(Default)]
pub struct QuicStreamManager {
    streams: BTreeMap<u64, QuicStreamState>,
    writable_streams: BTreeSet<u64>,
    loss_streams: BTreeSet<u64>,
    // stream id -> blocked at offset
    blocked_streams: BTreeMap<u64, u64>,
    window_updates: BTreeSet<u64>,
    tx_streams: BTreeSet<u64>,
    initial_max_stream_data: u64,
    stream_recv_window: u64,
}

impl QuicStreamManager {
    pub(crate) fn new(initial_max_stream_data: u64, stream_recv_window: u64) -> Self {
        Self {
            initial_max_stream_data,
            stream_recv_window,
            ..Default::default()
        }
    }

    pub fn create_stream(&mut self, stream_id: u64) -> &mut QuicStreamState {
        let max_send = self.initial_max_stream_data;
        let recv_window = self.stream_recv_window;
        self.streams.entry(stream_id).or_insert_with(|| {
            info!("Created stream {}, max send size {}", stream_id, max_send);
            QuicStreamState::new(stream_id, QuicStreamFlowControl::new(max_send, recv_window))
        })
    }

    pub fn get_stream(&self, stream_id: u64) -> Option<&QuicStreamState> {
        self.streams.get(&stream_id)
    }

    pub fn get_stream_mut(&mut self, stream_id: u64) -> Option<&mut QuicStreamState> {
        self.streams.get_mut(&stream_id)
    }

    pub fn remove_stream(&mut self, stream_id: u64) -> Option<QuicStreamState> {
        self.writable_streams.remove(&stream_id);
        self.loss_streams.remove(&stream_id);
        self.blocked_streams.remove(&stream_id);
        self.window_updates.remove(&stream_id);
        self.tx_streams.remove(&stream_id);
        self.streams.remove(&stream_id)
    }

    /// Queues application data on a stream, creating it when needed
    pub fn write_stream_data(&mut self, stream_id: u64, data: &[u8], eof: bool) {
        self.create_stream(stream_id).send.write(data, eof);
        self.update_writable_streams(stream_id);
    }

    pub fn update_writable_streams(&mut self, stream_id: u64) {
        match self.streams.get(&stream_id) {
            Some(stream) if stream.has_writable_data() => {
                self.writable_streams.insert(stream_id);
            }
            _ => {
                self.writable_streams.remove(&stream_id);
            }
        }
    }

    pub fn update_loss_streams(&mut self, stream_id: u64) {
        match self.streams.get(&stream_id) {
            Some(stream) if stream.has_loss_data() => {
                self.loss_streams.insert(stream_id);
            }
            _ => {
                self.loss_streams.remove(&stream_id);
            }
        }
    }

    pub fn has_writable(&self) -> bool {
        !self.writable_streams.is_empty() || !self.loss_streams.is_empty()
    }

    pub fn has_loss(&self) -> bool {
        !self.loss_streams.is_empty()
    }

    pub(crate) fn writable_stream_ids(&self) -> Vec<u64> {
        self.writable_streams.iter().copied().collect()
    }

    pub(crate) fn loss_stream_ids(&self) -> Vec<u64> {
        self.loss_streams.iter().copied().collect()
    }

    pub fn has_window_updates(&self) -> bool {
        !self.window_updates.is_empty()
    }

    pub fn queue_window_update(&mut self, stream_id: u64) {
        self.window_updates.insert(stream_id);
    }

    pub(crate) fn remove_window_update(&mut self, stream_id: u64) {
        self.window_updates.remove(&stream_id);
    }

    pub(crate) fn window_update_stream_ids(&self) -> Vec<u64> {
        self.window_updates.iter().copied().collect()
    }

    pub fn has_blocked(&self) -> bool {
        !self.blocked_streams.is_empty()
    }

    pub fn queue_blocked(&mut self, stream_id: u64, offset: u64) {
        self.blocked_streams.insert(stream_id, offset);
    }

    pub(crate) fn remove_blocked(&mut self, stream_id: u64) {
        self.blocked_streams.remove(&stream_id);
    }

    pub(crate) fn blocked_streams(&self) -> Vec<(u64, u64)> {
        self.blocked_streams.iter().map(|(id, off)| (*id, *off)).collect()
    }

    pub(crate) fn add_tx(&mut self, stream_id: u64) {
        self.tx_streams.insert(stream_id);
    }

    pub fn tx_streams(&self) -> &BTreeSet<u64> {
        &self.tx_streams
    }

    pub fn clear_tx(&mut self) {
        self.tx_streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_buffer_split() {
        let mut buf = QuicWriteBuffer::default();
        buf.append(&[1, 2, 3]);
        buf.append(&[4, 5]);
        buf.append(&[]);
        assert_eq!(buf.len(), 5);

        assert_eq!(buf.peek(4), vec![1, 2, 3, 4]);
        assert_eq!(buf.len(), 5);

        assert_eq!(buf.split_at_most(2), vec![1, 2]);
        assert_eq!(buf.split_at_most(10), vec![3, 4, 5]);
        assert!(buf.is_empty());
        assert!(buf.split_at_most(1).is_empty());
    }

    #[test]
    fn test_write_buffer_random_splits() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let data: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();

        let mut buf = QuicWriteBuffer::default();
        let mut appended = 0;
        while appended < data.len() {
            let end = (appended + rng.gen_range(1..300)).min(data.len());
            buf.append(&data[appended..end]);
            appended = end;
        }

        let mut out = vec![];
        while !buf.is_empty() {
            let want = rng.gen_range(1..500);
            assert_eq!(buf.peek(want), data[out.len()..(out.len() + want).min(data.len())]);
            out.extend(buf.split_at_most(want));
            assert_eq!(buf.len(), data.len() - out.len());
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_stream_buffer_split_front() {
        let mut buf = StreamBuffer::new(100, vec![0, 1, 2, 3, 4], true);
        let front = buf.split_front(2);
        assert_eq!(front.offset, 100);
        assert_eq!(front.data, vec![0, 1]);
        assert!(!front.eof);
        assert_eq!(buf.offset, 102);
        assert_eq!(buf.data, vec![2, 3, 4]);
        assert!(buf.eof);
    }

    #[test]
    fn test_loss_buffer_is_sorted() {
        let mut stream = QuicStreamLike::default();
        stream.insert_into_loss_buffer(StreamBuffer::new(30, vec![0; 10], false));
        stream.insert_into_loss_buffer(StreamBuffer::new(0, vec![0; 10], false));
        stream.insert_into_loss_buffer(StreamBuffer::new(15, vec![0; 5], false));
        let offsets: Vec<u64> = stream.loss_buffer().iter().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0, 15, 30]);
    }

    #[test]
    fn test_pending_fin() {
        let mut stream = QuicStreamLike::default();
        stream.write(&[1, 2, 3], true);
        assert_eq!(stream.final_write_offset, Some(3));
        assert!(stream.has_pending_fin());

        stream.current_write_offset = 4;
        assert!(!stream.has_pending_fin());
    }

    #[test]
    fn test_stream_manager_sets() {
        let mut manager = QuicStreamManager::new(10, 100);
        manager.write_stream_data(0, &[0; 20], false);
        assert!(manager.has_writable());
        assert_eq!(manager.writable_stream_ids(), vec![0]);

        // Flow control closes the window
        manager.get_stream_mut(0).unwrap().send.current_write_offset = 10;
        manager.update_writable_streams(0);
        assert!(!manager.has_writable());

        manager.queue_blocked(0, 10);
        assert!(manager.has_blocked());
        manager.remove_blocked(0);
        assert!(!manager.has_blocked());

        manager.queue_window_update(4);
        assert!(manager.has_window_updates());
        manager.remove_stream(4);
        assert!(!manager.has_window_updates());
    }
}
