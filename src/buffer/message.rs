use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::chunk::{Chunk, ChunkPool, CHUNK_SIZE};
use crate::{TransportError, TransportResult};

/// Maximum frame body, fixed by the 16-bit length prefix on the wire.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// The chunk storage and cursor state of one message.
#[derive(Debug)]
pub(crate) struct MessageBuf {
    chunks: Vec<Chunk>,
    position: usize,
    size: usize,
}

impl MessageBuf {
    fn new(first: Chunk) -> Self {
        MessageBuf {
            chunks: vec![first],
            position: 0,
            size: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        CHUNK_SIZE * self.chunks.len()
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    fn ensure_capacity(&mut self, amount: usize, pool: &ChunkPool) -> TransportResult<()> {
        let required = self.position + amount;
        if required > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(required));
        }
        while required > self.capacity() {
            self.chunks.push(pool.acquire());
        }
        Ok(())
    }

    fn write_bytes(&mut self, src: &[u8], pool: &ChunkPool) -> TransportResult<()> {
        self.ensure_capacity(src.len(), pool)?;
        let mut written = 0;
        while written < src.len() {
            let idx = self.position / CHUNK_SIZE;
            let offset = self.position % CHUNK_SIZE;
            let count = (src.len() - written).min(CHUNK_SIZE - offset);
            let data = self.chunks[idx].bytes_mut().ok_or_else(|| {
                TransportError::IllegalState("write to a message bound for send".into())
            })?;
            data[offset..offset + count].copy_from_slice(&src[written..written + count]);
            written += count;
            self.position += count;
        }
        self.size = self.size.max(self.position);
        Ok(())
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> TransportResult<()> {
        if self.position + dst.len() > self.size {
            return Err(TransportError::OutOfRange {
                requested: dst.len(),
                remaining: self.size.saturating_sub(self.position),
            });
        }
        let mut read = 0;
        while read < dst.len() {
            let idx = self.position / CHUNK_SIZE;
            let offset = self.position % CHUNK_SIZE;
            let count = (dst.len() - read).min(CHUNK_SIZE - offset);
            dst[read..read + count].copy_from_slice(&self.chunks[idx].bytes()[offset..offset + count]);
            read += count;
            self.position += count;
        }
        Ok(())
    }

    /// Keep one resident chunk, return the rest to the pool.
    fn clear(&mut self, pool: &ChunkPool) {
        pool.release_all(self.chunks.drain(1..));
        self.position = 0;
        self.size = 0;
    }

    /// Replaces the resident chunks with `chunks` received off the wire.
    /// The previous chunks go back to the pool; no payload bytes move.
    fn adopt(&mut self, mut chunks: Vec<Chunk>, size: usize, pool: &ChunkPool) {
        debug_assert!(size <= CHUNK_SIZE * chunks.len().max(1));
        if chunks.is_empty() {
            // zero-length frame, keep the resident chunk
            self.position = 0;
            self.size = 0;
            return;
        }
        pool.release_all(self.chunks.drain(..));
        self.chunks.append(&mut chunks);
        self.position = 0;
        self.size = size;
    }

    /// Snapshot of the chunks covering the first `len` bytes, for gather I/O.
    pub(crate) fn share_chunks(&self, len: usize) -> Vec<Chunk> {
        let count = len.div_ceil(CHUNK_SIZE);
        self.chunks[..count].iter().map(Chunk::share).collect()
    }
}

struct MessageInner {
    refs: AtomicUsize,
    buf: Mutex<MessageBuf>,
}

/// One handle to a pooled, reference-counted message.
///
/// A message pops out of [`BufferPools`] with a reference count of 1.
/// [`Message::retain`] yields another handle and bumps the count; dropping a
/// handle (or calling [`Message::release`]) decrements it. When the last
/// handle goes, the chunks beyond the first return to the chunk pool and the
/// message core is parked for reuse. Because every reference is a handle,
/// releasing below zero or touching a released message cannot be expressed.
pub struct Message {
    inner: Arc<MessageInner>,
    pools: BufferPools,
}

impl Message {
    pub fn ref_count(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Take an additional reference. Each retained handle must eventually be
    /// released (dropped) for the message to return to the pool.
    pub fn retain(&self) -> Message {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        Message {
            inner: Arc::clone(&self.inner),
            pools: self.pools.clone(),
        }
    }

    /// Drop this handle. Equivalent to letting it fall out of scope; spelled
    /// out for callers pairing it with `retain`.
    pub fn release(self) {}

    pub fn position(&self) -> usize {
        self.inner.buf.lock().position
    }

    /// Bytes written into the message (the frame body length on the wire).
    pub fn size(&self) -> usize {
        self.inner.buf.lock().size
    }

    pub fn capacity(&self) -> usize {
        self.inner.buf.lock().capacity()
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.buf.lock().chunks.len()
    }

    /// Moves the cursor back to the start, e.g. to read a message just built.
    pub fn rewind(&self) {
        self.inner.buf.lock().position = 0;
    }

    /// Resets the cursor and returns all chunks except the first to the pool.
    pub fn clear(&self) {
        self.inner.buf.lock().clear(self.pools.chunks());
    }

    pub fn write_u8(&self, value: u8) -> TransportResult<()> {
        self.write_bytes(&[value])
    }

    pub fn write_bytes(&self, src: &[u8]) -> TransportResult<()> {
        self.inner.buf.lock().write_bytes(src, self.pools.chunks())
    }

    pub fn read_u8(&self) -> TransportResult<u8> {
        let mut byte = [0u8; 1];
        self.read_bytes(&mut byte)?;
        Ok(byte[0])
    }

    pub fn read_bytes(&self, dst: &mut [u8]) -> TransportResult<()> {
        self.inner.buf.lock().read_bytes(dst)
    }

    /// Remaining readable bytes before `size`.
    pub fn remaining(&self) -> usize {
        let buf = self.inner.buf.lock();
        buf.size.saturating_sub(buf.position)
    }

    pub(crate) fn with_buf<R>(&self, f: impl FnOnce(&MessageBuf) -> R) -> R {
        f(&self.inner.buf.lock())
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.buf.lock().clear(self.pools.chunks());
            self.pools.park(Arc::clone(&self.inner));
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buf = self.inner.buf.lock();
        f.debug_struct("Message")
            .field("position", &buf.position)
            .field("size", &buf.size)
            .field("capacity", &buf.capacity())
            .field("refs", &self.ref_count())
            .finish()
    }
}

struct PoolsShared {
    chunks: ChunkPool,
    messages: Mutex<Vec<Arc<MessageInner>>>,
}

/// The chunk and message pools backing one peer.
///
/// Explicitly constructed and handed to the server/client rather than living
/// in process-wide statics, so pools can be isolated per test and per peer.
/// Cloning is cheap and shares the same pools.
#[derive(Clone)]
pub struct BufferPools {
    shared: Arc<PoolsShared>,
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPools {
    pub fn new() -> Self {
        BufferPools {
            shared: Arc::new(PoolsShared {
                chunks: ChunkPool::new(),
                messages: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Obtain a message with a reference count of 1.
    pub fn pop(&self) -> Message {
        let inner = self.shared.messages.lock().pop().unwrap_or_else(|| {
            Arc::new(MessageInner {
                refs: AtomicUsize::new(0),
                buf: Mutex::new(MessageBuf::new(self.chunks().acquire())),
            })
        });
        inner.refs.store(1, Ordering::Release);
        Message {
            inner,
            pools: self.clone(),
        }
    }

    /// As [`pop`](Self::pop), pre-growing capacity to at least `min_size`.
    pub fn pop_with_capacity(&self, min_size: usize) -> TransportResult<Message> {
        let message = self.pop();
        message
            .inner
            .buf
            .lock()
            .ensure_capacity(min_size, self.chunks())?;
        Ok(message)
    }

    /// Wraps chunks filled by the frame decoder into a pooled message,
    /// without copying the received bytes.
    pub(crate) fn pop_adopting(&self, chunks: Vec<Chunk>, size: usize) -> Message {
        let message = self.pop();
        message.inner.buf.lock().adopt(chunks, size, self.chunks());
        message
    }

    /// Pre-populates the message pool ahead of a burst of traffic.
    pub fn warm_up(&self, count: usize) {
        let mut parked = Vec::with_capacity(count);
        for _ in 0..count {
            parked.push(self.pop());
        }
        // dropping the handles parks every message
    }

    /// Total chunk allocations since creation, for reuse assertions.
    pub fn chunk_allocations(&self) -> usize {
        self.shared.chunks.allocated()
    }

    pub fn pooled_messages(&self) -> usize {
        self.shared.messages.lock().len()
    }

    pub(crate) fn chunks(&self) -> &ChunkPool {
        &self.shared.chunks
    }

    fn park(&self, inner: Arc<MessageInner>) {
        self.shared.messages.lock().push(inner);
    }
}
