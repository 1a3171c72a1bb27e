use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::buffer::{ReadBuffer, Slice};
use super::write_queue::{Flush, ResumeListener, WriteQueue};
use super::{TransportContext, TransportError};
use crate::metrics::metrics;
use crate::protocol::ProtocolError;

/// Reads taken per readiness event before yielding to the other arms
const READS_PER_WAKEUP: usize = 16;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which leg of the proxy a socket belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Backend,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Backend => write!(f, "backend"),
        }
    }
}

/// Receives framed packets on the connection's task
pub trait PacketHandler: Send {
    /// Called with one or more whole packets. Slices not kept are dropped on return.
    fn on_packet(&mut self, packets: Vec<Slice>) -> Result<(), ProtocolError>;

    /// Called exactly once after the connection closed
    fn on_close(&mut self, error: Option<&TransportError>);
}

/// Outbound side of a connection, as the protocol layer sees it
pub trait PacketSink: Send + Sync {
    fn write(&self, data: Bytes) -> Result<(), TransportError>;

    /// Enqueue several buffers under one lock so they stay contiguous
    fn write_batch(&self, batch: Vec<Bytes>) -> Result<(), TransportError>;

    fn is_write_blocked(&self) -> bool;

    /// Register for a single drain notification.
    ///
    /// Returns `false` when the sink is no longer blocked, in which case the
    /// listener is not kept and the caller must resume by itself.
    fn register_resume(&self, listener: Weak<dyn ResumeListener>) -> bool;

    /// Capability flags negotiated with the peer
    fn capabilities(&self) -> u32;

    fn is_closed(&self) -> bool;
}

/// Cross-socket read backpressure
pub trait ReadControl: Send + Sync {
    fn enable_read(&self);
    fn disable_read(&self);
}

struct WriteState {
    /// Only owner of the socket apart from the driver task. Cleared on close,
    /// so the peer sees FIN once the driver returns even while handles to the
    /// connection outlive it.
    stream: Option<Arc<TcpStream>>,
    queue: WriteQueue,
    blocked: bool,
    listeners: Vec<Weak<dyn ResumeListener>>,
}

/// One non-blocking socket
pub struct Connection {
    id: u64,
    role: Role,
    peer: SocketAddr,
    ctx: Arc<TransportContext>,
    write: Mutex<WriteState>,
    /// Wakes the driver when the write side became blocked
    write_notify: Notify,
    read_enabled: AtomicBool,
    read_notify: Notify,
    shutdown: CancellationToken,
    closed: AtomicBool,
    capabilities: AtomicU32,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        role: Role,
        ctx: Arc<TransportContext>,
    ) -> Result<Arc<Self>, TransportError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(stream);

        ctx.registry.register(id, role, peer);
        metrics().connections_active.with_label_values(&[role_label(role)]).inc();
        debug!(conn_id = id, peer = %peer, role = %role, "Connection opened");

        Ok(Arc::new(Self {
            id,
            role,
            peer,
            write: Mutex::new(WriteState {
                stream: Some(stream),
                queue: WriteQueue::new(ctx.config.coalesce_threshold),
                blocked: false,
                listeners: Vec::new(),
            }),
            ctx,
            write_notify: Notify::new(),
            read_enabled: AtomicBool::new(true),
            read_notify: Notify::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            capabilities: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn set_capabilities(&self, caps: u32) {
        self.capabilities.store(caps, Ordering::Release);
    }

    pub fn is_read_enabled(&self) -> bool {
        self.read_enabled.load(Ordering::Acquire)
    }

    /// Drive the socket until it closes. Must run on exactly one task.
    pub async fn run<H: PacketHandler>(self: Arc<Self>, mut handler: H) {
        let Some(stream) = self.write.lock().stream.clone() else {
            handler.on_close(None);
            return;
        };
        let mut buffer = ReadBuffer::new(&self.ctx.pool, &self.ctx.config);
        let result = self.drive(&stream, &mut buffer, &mut handler).await;
        buffer.release(&self.ctx.pool);

        match &result {
            Ok(()) => debug!(
                conn_id = self.id,
                peer = %self.peer,
                role = %self.role,
                bytes_sent = self.bytes_sent(),
                bytes_received = self.bytes_received(),
                "Connection closed"
            ),
            Err(e) if e.is_reset() && self.bytes_sent() == 0 => debug!(
                conn_id = self.id,
                peer = %self.peer,
                role = %self.role,
                "Connection reset before any byte was sent, likely a port probe"
            ),
            Err(e) => warn!(
                conn_id = self.id,
                peer = %self.peer,
                role = %self.role,
                bytes_sent = self.bytes_sent(),
                bytes_received = self.bytes_received(),
                pending_writes = self.write.lock().queue.queued(),
                error = %e,
                "Connection failed"
            ),
        }

        self.close();
        drop(stream);
        handler.on_close(result.as_ref().err());
    }

    async fn drive<H: PacketHandler>(
        &self,
        stream: &TcpStream,
        buffer: &mut ReadBuffer,
        handler: &mut H,
    ) -> Result<(), TransportError> {
        loop {
            let blocked = self.write.lock().blocked;
            let reading = self.read_enabled.load(Ordering::Acquire);

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                ready = stream.writable(), if blocked => {
                    ready?;
                    self.on_writable(stream)?;
                }
                ready = stream.readable(), if reading => {
                    ready?;
                    if !self.on_readable(stream, buffer, handler)? {
                        return Ok(());
                    }
                }
                _ = self.write_notify.notified() => {}
                _ = self.read_notify.notified() => {}
            }
        }
    }

    /// Returns `false` on peer EOF
    fn on_readable<H: PacketHandler>(
        &self,
        stream: &TcpStream,
        buffer: &mut ReadBuffer,
        handler: &mut H,
    ) -> Result<bool, TransportError> {
        for _ in 0..READS_PER_WAKEUP {
            if !self.read_enabled.load(Ordering::Acquire) || self.is_closed() {
                break;
            }
            match buffer.read_from(stream, &self.ctx.pool) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    let packets = buffer.drain_packets(&self.ctx.pool)?;
                    if !packets.is_empty() {
                        trace!(conn_id = self.id, count = packets.len(), "Packets framed");
                        handler.on_packet(packets)?;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn on_writable(&self, stream: &TcpStream) -> Result<(), TransportError> {
        let listeners = {
            let mut state = self.write.lock();
            let (flush, written) = state.queue.flush(stream)?;
            self.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
            if flush == Flush::Blocked {
                return Ok(());
            }
            state.blocked = false;
            std::mem::take(&mut state.listeners)
        };
        trace!(conn_id = self.id, listeners = listeners.len(), "Write queue drained");
        fire(listeners);
        Ok(())
    }

    fn enqueue(&self, batch: Vec<Bytes>) -> Result<(), TransportError> {
        let mut state = self.write.lock();
        let Some(stream) = state.stream.clone() else {
            return Err(TransportError::Closed);
        };
        for data in batch {
            state.queue.push(data);
        }
        if state.blocked {
            return Ok(());
        }
        match state.queue.flush(&*stream) {
            Ok((flush, written)) => {
                self.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
                if flush == Flush::Blocked {
                    state.blocked = true;
                    drop(state);
                    metrics().write_blocked_total.inc();
                    trace!(conn_id = self.id, "Write blocked");
                    self.write_notify.notify_one();
                }
                Ok(())
            }
            Err(e) => {
                drop(state);
                warn!(conn_id = self.id, peer = %self.peer, role = %self.role, error = %e, "Write failed");
                self.close();
                Err(e.into())
            }
        }
    }

    /// Close the connection. Idempotent; resume listeners fire so that
    /// paused sources observe the closure.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let listeners = {
            let mut state = self.write.lock();
            state.stream = None;
            state.queue.clear();
            state.blocked = false;
            std::mem::take(&mut state.listeners)
        };
        fire(listeners);
        self.ctx.registry.unregister(self.id);
        metrics().connections_active.with_label_values(&[role_label(self.role)]).dec();
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Client => "client",
        Role::Backend => "backend",
    }
}

fn fire(listeners: Vec<Weak<dyn ResumeListener>>) {
    // listeners whose owner is gone are skipped and dropped
    for listener in listeners.iter().filter_map(Weak::upgrade) {
        listener.on_resume();
    }
}

impl PacketSink for Connection {
    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        self.enqueue(vec![data])
    }

    fn write_batch(&self, batch: Vec<Bytes>) -> Result<(), TransportError> {
        self.enqueue(batch)
    }

    fn is_write_blocked(&self) -> bool {
        self.write.lock().blocked
    }

    fn register_resume(&self, listener: Weak<dyn ResumeListener>) -> bool {
        let mut state = self.write.lock();
        if !state.blocked || state.stream.is_none() {
            return false;
        }
        state.listeners.retain(|kept| kept.strong_count() > 0);
        if !state.listeners.iter().any(|kept| Weak::ptr_eq(kept, &listener)) {
            state.listeners.push(listener);
        }
        true
    }

    fn capabilities(&self) -> u32 {
        self.capabilities.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ReadControl for Connection {
    fn enable_read(&self) {
        if !self.read_enabled.swap(true, Ordering::AcqRel) {
            trace!(conn_id = self.id, "Read enabled");
            self.read_notify.notify_one();
        }
    }

    fn disable_read(&self) {
        if self.read_enabled.swap(false, Ordering::AcqRel) {
            trace!(conn_id = self.id, "Read disabled");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
