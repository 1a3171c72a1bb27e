//! Backend connections: request submission and response dispatch.

mod freshness;

pub use freshness::{BackendRole, Lsn, ReplicaFreshness};

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::ProtocolError;
use crate::request::RequestContext;
use crate::result::{Destination, ResultHandler, ResultListener, ResultStream};
use crate::session::SessionContext;
use crate::transport::{
    Connection, PacketHandler, PacketSink, ReadControl, ResumeListener, Slice, TransportError,
};

/// What a result handler needs from the backend it reads from
pub trait BackendLink: ReadControl {
    fn id(&self) -> u64;

    /// Capability flags negotiated with the backend
    fn capabilities(&self) -> u32;

    /// Replication position and staleness of this backend
    fn freshness(&self) -> &ReplicaFreshness;

    fn applied_lsn(&self) -> Lsn {
        self.freshness().applied_lsn()
    }

    fn is_known_stale(&self) -> bool {
        self.freshness().is_known_stale()
    }

    fn is_leader(&self) -> bool {
        self.freshness().is_leader()
    }

    /// Listener that resumes reading this backend when a client drains
    fn resume_listener(&self) -> Arc<dyn ResumeListener>;
}

/// Re-enables reads on a backend socket
struct ReadResumer {
    conn: Weak<Connection>,
}

impl ResumeListener for ReadResumer {
    fn on_resume(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.enable_read();
        }
    }
}

/// An authenticated backend socket with its outstanding requests in order
pub struct BackendConnection {
    conn: Arc<Connection>,
    freshness: Arc<ReplicaFreshness>,
    outstanding: Mutex<VecDeque<Arc<ResultHandler>>>,
    resumer: Arc<ReadResumer>,
    me: Weak<BackendConnection>,
}

impl BackendConnection {
    pub fn new(conn: Arc<Connection>, freshness: Arc<ReplicaFreshness>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            resumer: Arc::new(ReadResumer {
                conn: Arc::downgrade(&conn),
            }),
            conn,
            freshness,
            outstanding: Mutex::new(VecDeque::new()),
            me: me.clone(),
        })
    }

    /// Start the socket's driver task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let conn = self.conn.clone();
        tokio::spawn(conn.run(BackendDispatch(self.clone())))
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Send `request` and register the handler that will read its response.
    ///
    /// Returns `None` for commands the backend does not answer.
    pub fn execute(
        &self,
        request: Arc<RequestContext>,
        session: Arc<dyn SessionContext>,
        destination: Destination,
        listener: Option<Arc<dyn ResultListener>>,
    ) -> Result<Option<Arc<ResultHandler>>, TransportError> {
        let backend: Arc<dyn BackendLink> = self.me.upgrade().ok_or(TransportError::Closed)?;
        if self.conn.is_closed() {
            return Err(TransportError::Closed);
        }
        let literal = request
            .literal()
            .cloned()
            .ok_or_else(|| ProtocolError::Violation("request without wire bytes".into()))?;
        let request_id = request.id();
        let handler = ResultHandler::new(request, session, backend, destination, listener)?;

        // queue order must match the order requests hit the socket
        let mut outstanding = self.outstanding.lock();
        if let Some(handler) = &handler {
            outstanding.push_back(handler.clone());
        }
        if let Err(e) = self.conn.write(literal) {
            if handler.is_some() {
                outstanding.pop_back();
            }
            return Err(e);
        }
        debug!(
            backend_id = self.conn.id(),
            request_id,
            outstanding = outstanding.len(),
            "Request sent to backend"
        );
        Ok(handler)
    }

    /// Feed response packets to the oldest outstanding handler
    fn dispatch(&self, packets: Vec<Slice>) -> Result<(), ProtocolError> {
        for slice in packets {
            let head = self.outstanding.lock().front().cloned();
            let Some(handler) = head else {
                return Err(ProtocolError::Violation(format!(
                    "unsolicited packet from backend {}",
                    self.conn.id()
                )));
            };
            handler.handle_packet(slice)?;
            if handler.is_done() {
                let mut outstanding = self.outstanding.lock();
                if outstanding
                    .front()
                    .is_some_and(|front| Arc::ptr_eq(front, &handler))
                {
                    outstanding.pop_front();
                }
                if let Some(next) = handler.more() {
                    if !next.is_done() {
                        outstanding.push_front(next);
                    }
                }
            }
        }
        Ok(())
    }

    /// Force every outstanding handler to Abort
    fn abort_outstanding(&self) {
        let drained: Vec<_> = self.outstanding.lock().drain(..).collect();
        if !drained.is_empty() {
            warn!(
                backend_id = self.conn.id(),
                peer = %self.conn.peer(),
                outstanding = drained.len(),
                "Backend closed with requests in flight"
            );
        }
        for handler in drained {
            handler.close();
        }
    }

    pub fn close(&self) {
        self.conn.close();
        self.abort_outstanding();
    }
}

impl ReadControl for BackendConnection {
    fn enable_read(&self) {
        self.conn.enable_read();
    }

    fn disable_read(&self) {
        self.conn.disable_read();
    }
}

impl BackendLink for BackendConnection {
    fn id(&self) -> u64 {
        self.conn.id()
    }

    fn capabilities(&self) -> u32 {
        PacketSink::capabilities(&*self.conn)
    }

    fn freshness(&self) -> &ReplicaFreshness {
        &self.freshness
    }

    fn resume_listener(&self) -> Arc<dyn ResumeListener> {
        self.resumer.clone()
    }
}

/// Transport callbacks of a backend socket
struct BackendDispatch(Arc<BackendConnection>);

impl PacketHandler for BackendDispatch {
    fn on_packet(&mut self, packets: Vec<Slice>) -> Result<(), ProtocolError> {
        self.0.dispatch(packets)
    }

    fn on_close(&mut self, _error: Option<&TransportError>) {
        self.0.abort_outstanding();
    }
}
