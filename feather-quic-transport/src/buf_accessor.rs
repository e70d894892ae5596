use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

/// Fixed capacity byte window with movable front and back edges.
///
/// Bytes in `[0, start)` are headroom, `[start, end)` is the readable
/// window and `[end, capacity)` is tailroom. Every edge move is bounds
/// checked, moving past either end is a bug in the caller.
pub struct ArenaBuf {
    storage: Vec<u8>,
    start: usize,
    end: usize,
}

impl ArenaBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity],
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn headroom(&self) -> usize {
        self.start
    }

    pub fn tailroom(&self) -> usize {
        self.storage.len() - self.end
    }

    pub fn data(&self) -> &[u8] {
        &self.storage[self.start..self.end]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.end]
    }

    /// Drops `n` bytes from the front of the window into headroom
    pub fn trim_start(&mut self, n: usize) {
        assert!(n <= self.len(), "trim_start {} over length {}", n, self.len());
        self.start += n;
    }

    /// Drops `n` bytes from the back of the window into tailroom
    pub fn trim_end(&mut self, n: usize) {
        assert!(n <= self.len(), "trim_end {} over length {}", n, self.len());
        self.end -= n;
    }

    /// Gives `n` bytes of headroom back to the window
    pub fn prepend(&mut self, n: usize) {
        assert!(n <= self.start, "prepend {} over headroom {}", n, self.start);
        self.start -= n;
    }

    pub fn append(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.tailroom(),
            "append {} over tailroom {}",
            bytes.len(),
            self.tailroom()
        );
        self.storage[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

impl fmt::Debug for ArenaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ArenaBuf {{ headroom: {}, len: {}, tailroom: {} }}",
            self.headroom(),
            self.len(),
            self.tailroom()
        )
    }
}

/// Connection owned home of the arena. The buffer is checked out with
/// `obtain` and must come back through `release` before the next checkout.
#[derive(Clone, Debug)]
pub struct BufAccessor {
    slot: Rc<RefCell<Option<ArenaBuf>>>,
    capacity: usize,
}

impl BufAccessor {
    pub fn new(capacity: usize) -> Self {
        Self {
            slot: Rc::new(RefCell::new(Some(ArenaBuf::with_capacity(capacity)))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn owns_buffer(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub fn obtain(&self) -> ArenaBuf {
        match self.slot.borrow_mut().take() {
            Some(buf) => buf,
            None => panic!("Arena buffer obtained twice without release"),
        }
    }

    pub fn release(&self, buf: ArenaBuf) {
        assert_eq!(
            buf.capacity(),
            self.capacity,
            "Released a foreign buffer into the accessor"
        );
        let mut slot = self.slot.borrow_mut();
        assert!(slot.is_none(), "Released arena buffer twice");
        *slot = Some(buf);
    }

    /// Checkout that releases on drop
    pub fn scoped(&self) -> ScopedBufAccessor<'_> {
        ScopedBufAccessor {
            accessor: self,
            buf: Some(self.obtain()),
        }
    }
}

#[derive(Debug)]
pub struct ScopedBufAccessor<'a> {
    accessor: &'a BufAccessor,
    buf: Option<ArenaBuf>,
}

impl Deref for ScopedBufAccessor<'_> {
    type Target = ArenaBuf;

    fn deref(&self) -> &ArenaBuf {
        match self.buf.as_ref() {
            Some(buf) => buf,
            None => unreachable!("Scoped arena buffer is only taken on drop"),
        }
    }
}

impl DerefMut for ScopedBufAccessor<'_> {
    fn deref_mut(&mut self) -> &mut ArenaBuf {
        match self.buf.as_mut() {
            Some(buf) => buf,
            None => unreachable!("Scoped arena buffer is only taken on drop"),
        }
    }
}

impl Drop for ScopedBufAccessor<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.accessor.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_edges() {
        let mut buf = ArenaBuf::with_capacity(16);
        buf.append(&[1, 2, 3, 4, 5]);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.tailroom(), 11);

        buf.trim_start(2);
        assert_eq!(buf.data(), &[3, 4, 5]);
        assert_eq!(buf.headroom(), 2);

        buf.prepend(1);
        assert_eq!(buf.data(), &[2, 3, 4, 5]);

        buf.trim_end(2);
        assert_eq!(buf.data(), &[2, 3]);
        assert_eq!(buf.tailroom(), 13);

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.headroom(), 0);
    }

    #[test]
    #[should_panic(expected = "prepend")]
    fn test_prepend_over_headroom() {
        let mut buf = ArenaBuf::with_capacity(4);
        buf.append(&[1]);
        buf.prepend(1);
    }

    #[test]
    #[should_panic(expected = "append")]
    fn test_append_over_tailroom() {
        let mut buf = ArenaBuf::with_capacity(2);
        buf.append(&[1, 2, 3]);
    }

    #[test]
    fn test_obtain_release() {
        let accessor = BufAccessor::new(32);
        assert!(accessor.owns_buffer());

        let mut buf = accessor.obtain();
        assert!(!accessor.owns_buffer());
        buf.append(&[7; 4]);
        accessor.release(buf);

        let scoped = accessor.scoped();
        assert_eq!(scoped.len(), 4);
        drop(scoped);
        assert!(accessor.owns_buffer());
    }

    #[test]
    #[should_panic(expected = "obtained twice")]
    fn test_double_obtain() {
        let accessor = BufAccessor::new(8);
        let _first = accessor.obtain();
        let _second = accessor.obtain();
    }
}
