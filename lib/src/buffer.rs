//! Fixed-size byte chunks used for every receive and send.
//!
//! A chunk is checked out of the [`FixedChunkPool`], handed to the reactor
//! inside an operation, and checked back in once the completion has been
//! processed. While a chunk is in flight nobody else holds it: ownership
//! moves with the operation.
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// An owned chunk and the number of meaningful bytes at its start
pub struct ByteBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl ByteBuffer {
    pub fn with_capacity(capacity: usize) -> ByteBuffer {
        ByteBuffer {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> ByteBuffer {
        ByteBuffer {
            data: bytes.to_vec().into_boxed_slice(),
            len: bytes.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    /// the bytes written so far
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// the writable tail of the chunk
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// marks `count` bytes of the spare area as written
    pub fn advance(&mut self, count: usize) {
        self.len = (self.len + count).min(self.data.len());
    }

    /// copies as much of `bytes` as fits, returns the copied count
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.data.len() - self.len);
        self.data[self.len..self.len + count].copy_from_slice(&bytes[..count]);
        self.len += count;
        count
    }

    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl std::fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// A growable pool of chunks of one size.
///
/// `checkout` never fails: when no idle chunk is left a new one is
/// allocated. At most `max_idle` chunks are kept around on check-in.
pub struct FixedChunkPool {
    chunk_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
    allocated: AtomicUsize,
}

impl FixedChunkPool {
    pub fn new(chunk_size: usize, max_idle: usize) -> FixedChunkPool {
        FixedChunkPool {
            chunk_size,
            max_idle,
            idle: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn checkout(&self) -> ByteBuffer {
        if let Some(data) = self.idle.lock().pop() {
            return ByteBuffer { data, len: 0 };
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        ByteBuffer::with_capacity(self.chunk_size)
    }

    /// chunks of a foreign size are simply dropped
    pub fn checkin(&self, buffer: ByteBuffer) {
        if buffer.capacity() != self.chunk_size {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buffer.data);
        } else {
            self.allocated.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn checkin_all(&self, buffers: impl IntoIterator<Item = ByteBuffer>) {
        for buffer in buffers {
            self.checkin(buffer);
        }
    }

    /// copies `bytes` into as many chunks as needed
    pub fn copy_into_chunks(&self, mut bytes: &[u8]) -> Vec<ByteBuffer> {
        let mut chunks = Vec::with_capacity(bytes.len() / self.chunk_size + 1);
        while !bytes.is_empty() {
            let mut chunk = self.checkout();
            let copied = chunk.fill_from(bytes);
            bytes = &bytes[copied..];
            chunks.push(chunk);
        }
        chunks
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// chunks created by this pool and not freed yet
    pub fn allocated_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}
