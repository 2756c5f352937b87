use core::cmp;

use managed::ManagedSlice;

use super::Full;

/// A ring buffer.
///
/// The buffer is filled at the back and drained at the front. Storage may be borrowed or
/// owned, see [ManagedSlice].
#[derive(Debug)]
pub struct RingBuffer<'a, T: 'a> {
    storage: ManagedSlice<'a, T>,
    read_at: usize,
    length: usize,
}

impl<'a, T: 'a + Copy> RingBuffer<'a, T> {
    /// Create a ring buffer with the given storage.
    pub fn new<S>(storage: S) -> RingBuffer<'a, T>
    where
        S: Into<ManagedSlice<'a, T>>,
    {
        RingBuffer {
            storage: storage.into(),
            read_at: 0,
            length: 0,
        }
    }

    /// Clear the ring buffer.
    pub fn clear(&mut self) {
        self.read_at = 0;
        self.length = 0;
    }

    /// Return the maximum number of elements in the ring buffer.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Return the current number of elements in the ring buffer.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Return the number of elements that can be added to the ring buffer.
    pub fn window(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.window() == 0
    }

    fn get_idx(&self, idx: usize) -> usize {
        let len = self.capacity();
        if len > 0 { idx % len } else { 0 }
    }

    /// Append a single element, or return `Err(Full)` if there is no room.
    pub fn enqueue_one(&mut self, value: T) -> Result<(), Full> {
        if self.is_full() {
            return Err(Full);
        }
        let index = self.get_idx(self.read_at + self.length);
        self.storage[index] = value;
        self.length += 1;
        Ok(())
    }

    /// Append as many elements from `data` as fit, returning how many were taken.
    pub fn enqueue_slice(&mut self, data: &[T]) -> usize {
        let mut written = 0;
        // At most two contiguous chunks: up to the end of storage, then from its start.
        for _ in 0..2 {
            let write_at = self.get_idx(self.read_at + self.length);
            let contiguous = cmp::min(self.window(), self.capacity() - write_at);
            let size = cmp::min(contiguous, data.len() - written);
            self.storage[write_at..write_at + size].copy_from_slice(&data[written..written + size]);
            self.length += size;
            written += size;
        }
        written
    }

    /// Copy up to `data.len()` elements starting `offset` elements past the front into
    /// `data`, without removing them. Returns the number of elements copied.
    pub fn read_allocated(&self, offset: usize, data: &mut [T]) -> usize {
        if offset >= self.length {
            return 0;
        }
        let mut read = 0;
        for _ in 0..2 {
            let start_at = self.get_idx(self.read_at + offset + read);
            let available = self.length - offset - read;
            let contiguous = cmp::min(available, self.capacity() - start_at);
            let size = cmp::min(contiguous, data.len() - read);
            data[read..read + size].copy_from_slice(&self.storage[start_at..start_at + size]);
            read += size;
        }
        read
    }

    /// Remove up to `count` elements from the front, returning how many were removed.
    pub fn dequeue_allocated(&mut self, count: usize) -> usize {
        let count = cmp::min(count, self.length);
        self.length -= count;
        self.read_at = if self.length == 0 {
            0
        } else {
            self.get_idx(self.read_at + count)
        };
        count
    }

    /// Move up to `data.len()` elements from the front into `data`.
    pub fn dequeue_slice(&mut self, data: &mut [T]) -> usize {
        let read = self.read_allocated(0, data);
        self.dequeue_allocated(read)
    }
}

impl<'a, T: 'a> From<ManagedSlice<'a, T>> for RingBuffer<'a, T> {
    fn from(slice: ManagedSlice<'a, T>) -> RingBuffer<'a, T> {
        RingBuffer {
            storage: slice,
            read_at: 0,
            length: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_buffer_length_changes() {
        let mut ring = RingBuffer::new(vec![0u8; 2]);
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.window(), 2);

        ring.enqueue_one(1).unwrap();
        ring.enqueue_one(2).unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.enqueue_one(3), Err(Full));

        assert_eq!(ring.dequeue_allocated(1), 1);
        assert_eq!(ring.len(), 1);
        ring.clear();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_enqueue_slice_wraps() {
        let mut ring = RingBuffer::new(vec![0u8; 8]);
        assert_eq!(ring.enqueue_slice(b"abcdef"), 6);
        assert_eq!(ring.dequeue_allocated(4), 4);
        assert_eq!(ring.enqueue_slice(b"ghijklmn"), 6);
        assert!(ring.is_full());

        let mut out = [0u8; 8];
        assert_eq!(ring.dequeue_slice(&mut out), 8);
        assert_eq!(&out, b"efghijkl");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_read_allocated_offset() {
        let mut ring = RingBuffer::new(vec![0u8; 6]);
        ring.enqueue_slice(b"xxxx");
        ring.dequeue_allocated(4);
        ring.enqueue_slice(b"abcdef");

        let mut out = [0u8; 3];
        assert_eq!(ring.read_allocated(2, &mut out), 3);
        assert_eq!(&out, b"cde");
        assert_eq!(ring.read_allocated(5, &mut out), 1);
        assert_eq!(out[0], b'f');
        assert_eq!(ring.read_allocated(6, &mut out), 0);
        assert_eq!(ring.len(), 6);
    }

    #[test]
    fn test_borrowed_storage() {
        let mut storage = [0u8; 4];
        let mut ring = RingBuffer::new(&mut storage[..]);
        assert_eq!(ring.enqueue_slice(b"hello"), 4);
        assert_eq!(ring.capacity(), 4);
    }
}
