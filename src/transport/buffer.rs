//! Pooled read buffers and packet framing.
//!
//! Reads land in fixed-size blocks taken from a [`BufferPool`]. Every framed
//! packet is a [`Slice`] that shares the block through reference counting; a
//! block goes back into circulation only after the last slice over it has
//! been dropped.

use std::borrow::Cow;
use std::io;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::TcpStream;

use super::TransportError;
use crate::config::TransportConfig;
use crate::protocol::packet::{self, PacketHeader, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// Cache of fixed-size read blocks
pub struct BufferPool {
    blocks: Mutex<Vec<BytesMut>>,
    block_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(block_size: usize, max_pooled: usize) -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
            block_size,
            max_pooled,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.block_size, config.max_pooled_blocks)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Take a block with at least `block_size` free bytes.
    ///
    /// Cached blocks whose storage is still shared with live slices are skipped
    /// and left to be freed by their last holder.
    pub fn acquire(&self) -> BytesMut {
        let mut blocks = self.blocks.lock();
        while let Some(mut block) = blocks.pop() {
            block.clear();
            if block.try_reclaim(self.block_size) {
                return block;
            }
        }
        drop(blocks);
        BytesMut::with_capacity(self.block_size)
    }

    pub fn release(&self, block: BytesMut) {
        let mut blocks = self.blocks.lock();
        if blocks.len() < self.max_pooled {
            blocks.push(block);
        }
    }

    #[cfg(test)]
    pub(crate) fn cached(&self) -> usize {
        self.blocks.lock().len()
    }
}

/// One complete wire packet (header included, all chunks)
#[derive(Clone, PartialEq, Eq)]
pub struct Slice(Bytes);

impl Slice {
    pub fn new(raw: Bytes) -> Self {
        Self(raw)
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sequence_id(&self) -> u8 {
        packet::first_sequence(&self.0)
    }

    pub fn chunk_count(&self) -> usize {
        packet::chunk_count(&self.0)
    }

    /// Logical payload, joined across chunks if needed
    pub fn payload(&self) -> Cow<'_, [u8]> {
        packet::payload(&self.0)
    }

    /// Independent heap copy that no longer pins the pooled block
    pub fn dump(&self) -> Slice {
        Slice(Bytes::copy_from_slice(&self.0))
    }
}

impl std::fmt::Debug for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slice")
            .field("seq", &self.sequence_id())
            .field("len", &self.0.len())
            .finish()
    }
}

impl From<Bytes> for Slice {
    fn from(raw: Bytes) -> Self {
        Slice(raw)
    }
}

/// Result of [`probe_length`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Total wire length of the next packet
    Complete(usize),
    /// At least this many bytes (from the offset) are required
    Incomplete { needed: usize },
}

/// Length of the next complete packet at `offset`, walking continuation chunks.
/// Never consumes anything.
pub fn probe_length(buf: &[u8], offset: usize, available: usize) -> Probe {
    let available = available.min(buf.len().saturating_sub(offset));
    let mut total = 0usize;
    loop {
        if available - total < PACKET_HEADER_SIZE {
            return Probe::Incomplete {
                needed: total + PACKET_HEADER_SIZE,
            };
        }
        let start = offset + total;
        let header = match PacketHeader::parse(&buf[start..start + PACKET_HEADER_SIZE]) {
            Some(header) => header,
            None => {
                return Probe::Incomplete {
                    needed: total + PACKET_HEADER_SIZE,
                }
            }
        };
        total += PACKET_HEADER_SIZE + header.payload_length;
        if total > available {
            return Probe::Incomplete { needed: total };
        }
        if header.payload_length < MAX_PACKET_SIZE {
            return Probe::Complete(total);
        }
    }
}

/// Non-blocking read source
pub trait TryRead {
    /// Append whatever is readable now; `WouldBlock` when nothing is
    fn read_into(&self, buf: &mut BytesMut) -> io::Result<usize>;
}

impl TryRead for TcpStream {
    fn read_into(&self, buf: &mut BytesMut) -> io::Result<usize> {
        self.try_read_buf(buf)
    }
}

/// Reassembly buffer of one socket
pub struct ReadBuffer {
    buf: BytesMut,
    /// Whether `buf` came from the pool
    pooled: bool,
    low_water_mark: usize,
    max_packet_size: usize,
}

impl ReadBuffer {
    pub fn new(pool: &BufferPool, config: &TransportConfig) -> Self {
        Self {
            buf: pool.acquire(),
            pooled: true,
            low_water_mark: config.low_water_mark,
            max_packet_size: config.max_packet_size,
        }
    }

    /// Unconsumed bytes
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn spare(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }

    /// Read once from `src` into free capacity. `Ok(0)` means EOF.
    pub fn read_from<R: TryRead + ?Sized>(
        &mut self,
        src: &R,
        pool: &BufferPool,
    ) -> io::Result<usize> {
        if self.spare() < self.low_water_mark {
            let needed = (self.buf.len() + self.low_water_mark).max(pool.block_size());
            self.swap(pool, needed);
        }
        src.read_into(&mut self.buf)
    }

    /// Move unconsumed bytes into a buffer that can hold at least `needed` bytes
    fn swap(&mut self, pool: &BufferPool, needed: usize) {
        let mut next = if needed <= pool.block_size() {
            pool.acquire()
        } else {
            BytesMut::with_capacity(needed)
        };
        next.extend_from_slice(&self.buf);
        let old = std::mem::replace(&mut self.buf, next);
        if self.pooled {
            pool.release(old);
        }
        self.pooled = needed <= pool.block_size();
    }

    /// Split every complete packet off the front of the buffer
    pub fn drain_packets(&mut self, pool: &BufferPool) -> Result<Vec<Slice>, TransportError> {
        let mut packets = Vec::new();
        loop {
            match probe_length(&self.buf, 0, self.buf.len()) {
                Probe::Complete(len) => {
                    packets.push(Slice(self.buf.split_to(len).freeze()));
                }
                Probe::Incomplete { needed } => {
                    if needed > self.max_packet_size {
                        return Err(TransportError::PacketTooLarge {
                            size: needed,
                            max: self.max_packet_size,
                        });
                    }
                    if needed > self.buf.capacity() {
                        // room for the whole packet plus a low-water margin
                        self.swap(pool, needed + self.low_water_mark);
                    }
                    return Ok(packets);
                }
            }
        }
    }

    pub fn release(self, pool: &BufferPool) {
        if self.pooled {
            pool.release(self.buf);
        }
    }
}
