//! Non-blocking packet transport.
//!
//! One [`Connection`] per socket, driven by a single task for its whole life.
//! Inbound bytes are framed into [`Slice`]s and handed to a [`PacketHandler`];
//! outbound bytes go through a coalescing [`WriteQueue`] with backpressure.

mod buffer;
mod connection;
mod write_queue;

use std::sync::Arc;

pub use buffer::{probe_length, BufferPool, Probe, ReadBuffer, Slice, TryRead};
pub use connection::{Connection, PacketHandler, PacketSink, ReadControl, Role};
pub use write_queue::{Flush, ResumeListener, TryWrite, WriteQueue};

use crate::config::TransportConfig;
use crate::protocol::ProtocolError;
use crate::registry::ConnectionRegistry;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Packet of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    /// Reset-style failures a peer causes by hanging up
    pub fn is_reset(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Shared state of every connection in the process
pub struct TransportContext {
    pub pool: BufferPool,
    pub config: TransportConfig,
    pub registry: Arc<ConnectionRegistry>,
}

impl TransportContext {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            pool: BufferPool::from_config(&config),
            config,
            registry: Arc::new(ConnectionRegistry::new()),
        })
    }
}

impl Default for TransportContext {
    fn default() -> Self {
        let config = TransportConfig::default();
        Self {
            pool: BufferPool::from_config(&config),
            config,
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }
}
