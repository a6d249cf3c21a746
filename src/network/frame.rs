use std::io::IoSlice;

use bytes::Buf;

use crate::buffer::{BufferPools, Chunk, Message, CHUNK_SIZE};
use crate::{TransportError, TransportResult};

/// Wire frames are `[u16 little-endian length][length bytes]`.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Handshake byte the server sends right after accepting the TCP connection.
pub const HANDSHAKE_ACCEPTED: u8 = 1;
/// Handshake byte for a connect refused at capacity; the client surfaces it
/// as a connect failure, not a transport error.
pub const HANDSHAKE_REJECTED: u8 = 0;

enum DecodeState {
    /// Accumulating the 2-byte length prefix. `received` is 0 or 1; a split
    /// prefix re-arms a 1-byte region at the right offset.
    Length { bytes: [u8; 2], received: usize },
    /// Accumulating `target` body bytes into pooled chunks.
    Body {
        chunks: Vec<Chunk>,
        target: usize,
        received: usize,
    },
}

impl DecodeState {
    fn length() -> Self {
        DecodeState::Length {
            bytes: [0u8; 2],
            received: 0,
        }
    }
}

/// Incremental length-prefix decoder.
///
/// The reader loop alternates [`next_region`](FrameDecoder::next_region)
/// (where should the socket put bytes) and [`advance`](FrameDecoder::advance)
/// (this many bytes landed). A single read may deliver any count from 1 to
/// the region length; the decoder reassembles frames regardless of how the
/// kernel slices the stream. Body bytes land directly in pooled chunk memory
/// and are handed out as a [`Message`] without copying.
pub struct FrameDecoder {
    pools: BufferPools,
    state: DecodeState,
}

impl FrameDecoder {
    pub fn new(pools: BufferPools) -> Self {
        FrameDecoder {
            pools,
            state: DecodeState::length(),
        }
    }

    /// The next contiguous byte region to read into. Never empty.
    pub fn next_region(&mut self) -> TransportResult<&mut [u8]> {
        match &mut self.state {
            DecodeState::Length { bytes, received } => Ok(&mut bytes[*received..]),
            DecodeState::Body {
                chunks,
                target,
                received,
            } => {
                let idx = *received / CHUNK_SIZE;
                let offset = *received % CHUNK_SIZE;
                let end = CHUNK_SIZE.min(*target - idx * CHUNK_SIZE);
                let data = chunks[idx].bytes_mut().ok_or_else(|| {
                    TransportError::IllegalState("receive chunk is aliased".into())
                })?;
                Ok(&mut data[offset..end])
            }
        }
    }

    /// Accounts for `count` bytes received into the current region and
    /// returns a complete message when one is ready.
    pub fn advance(&mut self, count: usize) -> TransportResult<Option<Message>> {
        match &mut self.state {
            DecodeState::Length { bytes, received } => {
                *received += count;
                debug_assert!(*received <= LENGTH_PREFIX_SIZE);
                if *received < LENGTH_PREFIX_SIZE {
                    // split prefix, wait for the remaining byte
                    return Ok(None);
                }
                let target = u16::from_le_bytes(*bytes) as usize;
                self.state = DecodeState::length();
                if target == 0 {
                    // zero-length frame completes right after the prefix
                    return Ok(Some(self.pools.pop_adopting(Vec::new(), 0)));
                }
                let count = target.div_ceil(CHUNK_SIZE);
                let mut chunks = Vec::with_capacity(count);
                for _ in 0..count {
                    chunks.push(self.pools.chunks().acquire());
                }
                self.state = DecodeState::Body {
                    chunks,
                    target,
                    received: 0,
                };
                Ok(None)
            }
            DecodeState::Body {
                chunks,
                target,
                received,
            } => {
                *received += count;
                debug_assert!(*received <= *target);
                if *received < *target {
                    return Ok(None);
                }
                let target = *target;
                let chunks = std::mem::take(chunks);
                self.state = DecodeState::length();
                Ok(Some(self.pools.pop_adopting(chunks, target)))
            }
        }
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        // abandon a partial body, its chunks go back to the pool
        if let DecodeState::Body { chunks, .. } = &mut self.state {
            self.pools.chunks().release_all(chunks.drain(..));
        }
    }
}

/// Gather view over one outgoing frame: the 2-byte prefix followed by the
/// message's chunk slices truncated to the write cursor.
///
/// Holds a message handle for the duration of the write and shares the chunk
/// handles instead of copying payload bytes, so several frames may fan the
/// same message out to different sockets concurrently. Dropping the view
/// releases the handle, completing the send side of the ownership contract
/// whether the write succeeded or not.
pub(crate) struct SendFrame {
    prefix: [u8; 2],
    chunks: Vec<Chunk>,
    len: usize,
    read: usize,
    _message: Message,
}

impl SendFrame {
    pub(crate) fn bind(message: Message) -> SendFrame {
        let (len, chunks) = message.with_buf(|buf| {
            let len = buf.position();
            (len, buf.share_chunks(len))
        });
        SendFrame {
            prefix: (len as u16).to_le_bytes(),
            chunks,
            len,
            read: 0,
            _message: message,
        }
    }

    /// Frame length on the wire, prefix included.
    pub(crate) fn frame_len(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.len
    }
}

impl Buf for SendFrame {
    fn remaining(&self) -> usize {
        self.frame_len() - self.read
    }

    fn chunk(&self) -> &[u8] {
        if self.read < LENGTH_PREFIX_SIZE {
            return &self.prefix[self.read..];
        }
        let offset = self.read - LENGTH_PREFIX_SIZE;
        if offset >= self.len {
            return &[];
        }
        let idx = offset / CHUNK_SIZE;
        let start = offset % CHUNK_SIZE;
        let end = CHUNK_SIZE.min(self.len - idx * CHUNK_SIZE);
        &self.chunks[idx].bytes()[start..end]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining(), "advance past end of frame");
        self.read += cnt;
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        if dst.is_empty() || !self.has_remaining() {
            return 0;
        }
        let mut filled = 0;
        let mut read = self.read;
        if read < LENGTH_PREFIX_SIZE {
            dst[filled] = IoSlice::new(&self.prefix[read..]);
            filled += 1;
            read = LENGTH_PREFIX_SIZE;
        }
        let mut offset = read - LENGTH_PREFIX_SIZE;
        while offset < self.len && filled < dst.len() {
            let idx = offset / CHUNK_SIZE;
            let start = offset % CHUNK_SIZE;
            let end = CHUNK_SIZE.min(self.len - idx * CHUNK_SIZE);
            dst[filled] = IoSlice::new(&self.chunks[idx].bytes()[start..end]);
            filled += 1;
            offset = (idx + 1) * CHUNK_SIZE;
        }
        filled
    }
}
