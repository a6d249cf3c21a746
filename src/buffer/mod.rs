//! Pooled message buffers.
//!
//! Messages are chunked, reference-counted byte buffers drawn from
//! [`BufferPools`]. Chunks are the unit of storage and go back to a shared
//! free list when a message is cleared or its last handle drops, so
//! sustained traffic settles into a steady state with no per-message
//! allocation.

pub use chunk::CHUNK_SIZE;
pub use codec::MAX_STRING_LENGTH;
pub use message::{BufferPools, Message, MAX_FRAME_SIZE};

pub(crate) use chunk::{Chunk, ChunkPool};

mod chunk;
mod codec;
mod message;
