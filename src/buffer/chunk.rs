use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Size of one pooled chunk. Messages grow in units of this.
pub const CHUNK_SIZE: usize = 256;

/// A fixed-size pooled byte buffer, the unit of message storage.
///
/// A chunk is exclusively owned by at most one message at a time, or parked
/// in the pool. Send views clone the inner handle to read the bytes without
/// copying them; while such a clone exists the chunk cannot be written.
pub(crate) struct Chunk(Arc<[u8; CHUNK_SIZE]>);

impl Chunk {
    fn new() -> Self {
        Chunk(Arc::new([0u8; CHUNK_SIZE]))
    }

    pub(crate) fn bytes(&self) -> &[u8; CHUNK_SIZE] {
        &self.0
    }

    /// Mutable access, available only while this is the sole handle.
    pub(crate) fn bytes_mut(&mut self) -> Option<&mut [u8; CHUNK_SIZE]> {
        Arc::get_mut(&mut self.0)
    }

    pub(crate) fn is_unique(&self) -> bool {
        Arc::strong_count(&self.0) == 1
    }

    /// Read-only alias for gather views. Never exposed outside the crate.
    pub(crate) fn share(&self) -> Chunk {
        Chunk(Arc::clone(&self.0))
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("unique", &self.is_unique())
            .finish()
    }
}

/// Free list of fixed-size chunks, shared by all messages of one pool set.
///
/// Growth is unbounded; the pool is only ever as large as the peak number of
/// in-flight message bytes. `allocated` counts real allocations so tests can
/// assert that steady-state traffic reuses chunks instead of allocating.
#[derive(Debug)]
pub(crate) struct ChunkPool {
    free: Mutex<Vec<Chunk>>,
    allocated: AtomicUsize,
}

impl ChunkPool {
    pub(crate) fn new() -> Self {
        ChunkPool {
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    pub(crate) fn acquire(&self) -> Chunk {
        if let Some(chunk) = self.free.lock().pop() {
            return chunk;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Chunk::new()
    }

    /// Returns a chunk to the free list. A chunk still aliased by an
    /// in-flight send view is dropped instead of pooled, so the pool never
    /// hands out memory something else can observe.
    pub(crate) fn release(&self, chunk: Chunk) {
        if chunk.is_unique() {
            self.free.lock().push(chunk);
        }
    }

    pub(crate) fn release_all<I: IntoIterator<Item = Chunk>>(&self, chunks: I) {
        let mut free = self.free.lock();
        for chunk in chunks {
            if chunk.is_unique() {
                free.push(chunk);
            }
        }
    }

    /// Total chunks ever allocated by this pool.
    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub(crate) fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_acquire_reuses_released_chunks() {
        let pool = ChunkPool::new();
        let chunk = pool.acquire();
        assert_eq!(pool.allocated(), 1);

        pool.release(chunk);
        assert_eq!(pool.pooled(), 1);

        let _chunk = pool.acquire();
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_aliased_chunk_is_not_pooled() {
        let pool = ChunkPool::new();
        let chunk = pool.acquire();
        let alias = chunk.share();

        pool.release(chunk);
        assert_eq!(pool.pooled(), 0);
        drop(alias);
    }

    #[test]
    fn test_write_blocked_while_aliased() {
        let pool = ChunkPool::new();
        let mut chunk = pool.acquire();
        assert!(chunk.bytes_mut().is_some());

        let alias = chunk.share();
        assert!(chunk.bytes_mut().is_none());
        drop(alias);
        assert!(chunk.bytes_mut().is_some());
    }
}
