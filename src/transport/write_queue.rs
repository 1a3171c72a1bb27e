//! Outbound write queue with coalescing and partial-write tracking.

use std::collections::VecDeque;
use std::io::{self, IoSlice};

use bytes::{Buf, Bytes, BytesMut};
use tokio::net::TcpStream;

/// Upper bound of buffers handed to one vectored write
const MAX_IOVECS: usize = 64;

/// Non-blocking write sink
pub trait TryWrite {
    /// Write what the socket absorbs now; `WouldBlock` when nothing
    fn write_now(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
}

impl TryWrite for TcpStream {
    fn write_now(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.try_write_vectored(bufs)
    }
}

/// Notified once when a write-blocked connection drains
pub trait ResumeListener: Send + Sync {
    fn on_resume(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything queued reached the socket
    Drained,
    /// The socket stopped accepting bytes; the rest stays queued
    Blocked,
}

#[derive(Debug)]
pub struct WriteQueue {
    chunks: VecDeque<Bytes>,
    queued: usize,
    coalesce_threshold: usize,
}

impl WriteQueue {
    pub fn new(coalesce_threshold: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            queued: 0,
            coalesce_threshold,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Bytes waiting to be written
    pub fn queued(&self) -> usize {
        self.queued
    }

    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Append in submission order, merging small neighbours
    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.queued += data.len();
        if let Some(last) = self.chunks.back_mut() {
            if last.len() + data.len() <= self.coalesce_threshold {
                let mut merged = BytesMut::with_capacity(last.len() + data.len());
                merged.extend_from_slice(last);
                merged.extend_from_slice(&data);
                *last = merged.freeze();
                return;
            }
        }
        self.chunks.push_back(data);
    }

    /// Write as much as the sink takes right now
    pub fn flush<W: TryWrite + ?Sized>(&mut self, sink: &W) -> io::Result<(Flush, usize)> {
        let mut written = 0;
        loop {
            if self.chunks.is_empty() {
                return Ok((Flush::Drained, written));
            }
            let slices: Vec<IoSlice<'_>> = self
                .chunks
                .iter()
                .take(MAX_IOVECS)
                .map(|chunk| IoSlice::new(chunk))
                .collect();
            match sink.write_now(&slices) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ))
                }
                Ok(n) => {
                    self.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((Flush::Blocked, written));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn advance(&mut self, mut n: usize) {
        self.queued -= n;
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                self.chunks.pop_front();
            } else {
                front.advance(n);
                n = 0;
            }
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.queued = 0;
    }
}
