//! Per-request result handling.
//!
//! A [`ResultHandler`] is created for every request written to a backend and
//! is fed the backend's response packets in order. Depending on its
//! [`Destination`] it relays them to a client (rewriting EOF framing when the
//! two legs disagree) or decodes rows into a [`RowQueue`]. A handler whose
//! response announces more results opens a chained handler for the next one.

mod forward;
mod local;
mod machine;
mod state;

pub use forward::{EofRewrite, Forwarder};
pub use local::{RowEnd, RowError, RowQueue};
pub use machine::CommandFamily;
pub use state::ResultState;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::backend::BackendLink;
use crate::metrics::metrics;
use crate::protocol::{ColumnDefinition, ErrPacket, ProtocolError, SessionChange};
use crate::request::RequestContext;
use crate::session::SessionContext;
use crate::transport::{PacketSink, Slice};

use machine::{Machine, Step};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Where a handler sends what it reads
pub enum Destination {
    /// Relay to a client socket
    Forward(Arc<dyn PacketSink>),
    /// Decode rows for in-process use
    Local,
}

/// Outcome flags of a logical response, shared by every handler in a chain.
///
/// Each flag is set at most once and never cleared.
#[derive(Debug, Default)]
pub struct Disposition(AtomicU8);

impl Disposition {
    /// A byte of the response reached the client
    pub const FORWARDED: u8 = 1;
    /// The backend was not fresh enough and the response was discarded
    pub const DROPPED_STALE: u8 = 1 << 1;
    /// The backend went away before the response completed
    pub const ABORTED: u8 = 1 << 2;
    /// The backend was known stale when the abort happened
    pub const ABORTED_STALE: u8 = 1 << 3;

    pub fn mark(&self, flag: u8) {
        self.0.fetch_or(flag, Ordering::Release);
    }

    pub fn snapshot(&self) -> DispositionSnapshot {
        DispositionSnapshot(self.0.load(Ordering::Acquire))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispositionSnapshot(u8);

impl DispositionSnapshot {
    pub fn forwarded(self) -> bool {
        self.0 & Disposition::FORWARDED != 0
    }

    pub fn dropped_stale(self) -> bool {
        self.0 & Disposition::DROPPED_STALE != 0
    }

    pub fn aborted(self) -> bool {
        self.0 & Disposition::ABORTED != 0
    }

    pub fn aborted_known_stale(self) -> bool {
        self.0 & Disposition::ABORTED_STALE != 0
    }
}

/// Prepared statement metadata from COM_STMT_PREPARE_OK
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedInfo {
    pub statement_id: u32,
    pub num_params: u16,
    pub num_columns: u16,
    pub warnings: u16,
    /// Parsed in local mode only
    pub params: Vec<ColumnDefinition>,
    pub columns: Vec<ColumnDefinition>,
}

/// Effects of one statement, gathered while its response streamed by
#[derive(Debug, Clone, Default)]
pub struct StatementOutcome {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
    pub session_changes: Vec<SessionChange>,
    /// Column definitions, parsed in local mode
    pub columns: Vec<ColumnDefinition>,
    pub prepared: Option<PreparedInfo>,
    pub error: Option<ErrPacket>,
    pub rows_seen: u64,
}

/// Callbacks of a handler's lifecycle
pub trait ResultListener: Send + Sync {
    /// Runs with the handler's state lock held; must not call back into it
    fn on_state_change(&self, _handler: &ResultHandler, _from: ResultState, _to: ResultState) {}

    /// Runs once per handler, after the lock is released and output flushed
    fn on_complete(&self, handler: &Arc<ResultHandler>);
}

/// Uniform driving interface over every command family
pub trait ResultStream {
    fn handle_packet(&self, slice: Slice) -> Result<(), ProtocolError>;

    fn is_done(&self) -> bool;

    /// A chained handler follows this one
    fn has_more(&self) -> bool;

    /// Force an unfinished handler to Abort
    fn close(&self);
}

pub(crate) enum Emitter {
    Forward(Forwarder),
    Local,
    /// Discarding a stale response
    Dropping,
    /// Output handed over to the chained handler
    Detached,
}

struct HandlerCore {
    state: ResultState,
    machine: Machine,
    emitter: Emitter,
    outcome: StatementOutcome,
    freshness_checked: bool,
}

pub struct ResultHandler {
    id: u64,
    me: Weak<ResultHandler>,
    family: CommandFamily,
    request: Arc<RequestContext>,
    session: Arc<dyn SessionContext>,
    backend: Arc<dyn BackendLink>,
    listener: Option<Arc<dyn ResultListener>>,
    rows: Option<Arc<RowQueue>>,
    core: Mutex<HandlerCore>,
    disposition: Arc<Disposition>,
    completed: AtomicBool,
    has_more: AtomicBool,
    more: Mutex<Option<Arc<ResultHandler>>>,
    previous: Weak<ResultHandler>,
}

impl ResultHandler {
    /// Handler for the response to `request`, `None` if the command gets no response
    pub fn new(
        request: Arc<RequestContext>,
        session: Arc<dyn SessionContext>,
        backend: Arc<dyn BackendLink>,
        destination: Destination,
        listener: Option<Arc<dyn ResultListener>>,
    ) -> Result<Option<Arc<Self>>, ProtocolError> {
        let Some(family) = CommandFamily::for_command(request.command())? else {
            return Ok(None);
        };
        let (emitter, rows) = match destination {
            Destination::Forward(sink) => {
                let forwarder = Forwarder::new(sink, backend.clone());
                (Emitter::Forward(forwarder), None)
            }
            Destination::Local => (Emitter::Local, Some(Arc::new(RowQueue::new()))),
        };
        Ok(Some(Self::build(
            family,
            request,
            session,
            backend,
            listener,
            emitter,
            rows,
            Arc::new(Disposition::default()),
            Weak::new(),
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        family: CommandFamily,
        request: Arc<RequestContext>,
        session: Arc<dyn SessionContext>,
        backend: Arc<dyn BackendLink>,
        listener: Option<Arc<dyn ResultListener>>,
        emitter: Emitter,
        rows: Option<Arc<RowQueue>>,
        disposition: Arc<Disposition>,
        previous: Weak<ResultHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            family,
            request,
            session,
            backend,
            listener,
            rows,
            core: Mutex::new(HandlerCore {
                state: ResultState::Init,
                machine: Machine::new(family),
                emitter,
                outcome: StatementOutcome::default(),
                freshness_checked: false,
            }),
            disposition,
            completed: AtomicBool::new(false),
            has_more: AtomicBool::new(false),
            more: Mutex::new(None),
            previous,
        })
    }

    /// Next handler of a multi-result response, taking over this one's output
    fn chained(&self, emitter: Emitter) -> Arc<Self> {
        let rows = matches!(emitter, Emitter::Local).then(|| Arc::new(RowQueue::new()));
        Self::build(
            self.family,
            self.request.clone(),
            self.session.clone(),
            self.backend.clone(),
            self.listener.clone(),
            emitter,
            rows,
            self.disposition.clone(),
            self.me.clone(),
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn family(&self) -> CommandFamily {
        self.family
    }

    pub fn request(&self) -> &Arc<RequestContext> {
        &self.request
    }

    pub fn session(&self) -> &Arc<dyn SessionContext> {
        &self.session
    }

    pub fn backend(&self) -> &Arc<dyn BackendLink> {
        &self.backend
    }

    pub fn state(&self) -> ResultState {
        self.core.lock().state
    }

    pub fn disposition(&self) -> DispositionSnapshot {
        self.disposition.snapshot()
    }

    pub fn mark(&self, flag: u8) {
        self.disposition.mark(flag);
    }

    /// Rows of this statement, present in local mode
    pub fn rows(&self) -> Option<&Arc<RowQueue>> {
        self.rows.as_ref()
    }

    pub fn outcome(&self) -> StatementOutcome {
        self.core.lock().outcome.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn more(&self) -> Option<Arc<ResultHandler>> {
        self.more.lock().clone()
    }

    pub fn previous(&self) -> Option<Arc<ResultHandler>> {
        self.previous.upgrade()
    }

    /// Every handler of the response, in statement order
    pub fn chain(&self) -> Vec<Arc<ResultHandler>> {
        let Some(mut head) = self.me.upgrade() else {
            return Vec::new();
        };
        while let Some(previous) = head.previous() {
            head = previous;
        }
        let mut chain = vec![head.clone()];
        let mut current = head;
        while let Some(next) = current.more() {
            chain.push(next.clone());
            current = next;
        }
        chain
    }

    fn set_state(&self, state: &mut ResultState, to: ResultState) {
        let from = *state;
        if from == to {
            return;
        }
        *state = to;
        if let Some(listener) = &self.listener {
            listener.on_state_change(self, from, to);
        }
    }

    fn handle(&self, slice: Slice) -> Result<(), ProtocolError> {
        let payload = slice.payload();
        let mut open_more = false;
        let (done, child) = {
            let mut core = self.core.lock();
            if core.state.is_done() {
                return Err(ProtocolError::Violation(format!(
                    "packet after {} on handler {}",
                    core.state, self.id
                )));
            }
            if !core.freshness_checked {
                core.freshness_checked = true;
                self.check_freshness(&mut core);
            }
            if matches!(core.emitter, Emitter::Dropping) {
                metrics().packets_dropped_stale_total.inc();
            }

            let HandlerCore {
                state,
                machine,
                emitter,
                outcome,
                ..
            } = &mut *core;
            let mut step = Step::new(self, state, emitter, outcome, &mut open_more);
            if payload.first() == Some(&crate::protocol::messages::ERR_HEADER) {
                step.fail(&slice, &payload)?;
            } else {
                machine.handle(&mut step, &slice, &payload)?;
            }

            if let Emitter::Forward(forwarder) = &core.emitter {
                if forwarder.has_written() {
                    self.disposition.mark(Disposition::FORWARDED);
                }
            }
            let done = core.state.is_done();
            let child = (done && open_more).then(|| {
                let emitter = std::mem::replace(&mut core.emitter, Emitter::Detached);
                self.chained(emitter)
            });
            (done, child)
        };

        if let Some(child) = child {
            debug!(handler_id = self.id, next = child.id, "More results follow");
            *self.more.lock() = Some(child);
            self.has_more.store(true, Ordering::Release);
        }
        if done {
            self.complete();
        }
        Ok(())
    }

    /// First packet of the response: discard it all if the backend is behind
    fn check_freshness(&self, core: &mut HandlerCore) {
        if matches!(core.emitter, Emitter::Detached | Emitter::Dropping) {
            return;
        }
        let pinned = self.request.pinned_lsn();
        if self.session.is_fresh_enough(&*self.backend, pinned) {
            return;
        }
        info!(
            handler_id = self.id,
            request_id = self.request.id(),
            backend_id = self.backend.id(),
            pinned_lsn = ?pinned,
            applied_lsn = self.backend.applied_lsn(),
            "Backend behind pinned position, dropping result"
        );
        core.emitter = Emitter::Dropping;
        self.disposition.mark(Disposition::DROPPED_STALE);
    }

    /// Force to Abort; no-op if already done apart from aborting the chain
    fn abort(&self) {
        let aborted_here = {
            let mut core = self.core.lock();
            if core.state.is_done() {
                false
            } else {
                self.disposition.mark(Disposition::ABORTED);
                let HandlerCore { state, emitter, .. } = &mut *core;
                self.set_state(state, ResultState::Abort);
                if let Emitter::Forward(forwarder) = emitter {
                    forwarder.discard();
                }
                true
            }
        };
        if let Some(next) = self.more() {
            next.abort();
        }
        if aborted_here {
            debug!(handler_id = self.id, request_id = self.request.id(), "Result aborted");
            self.complete();
        }
    }

    fn complete(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (state, error) = {
            let core = self.core.lock();
            (core.state, core.outcome.error.clone())
        };
        if let Some(rows) = &self.rows {
            let end = if state.is_abort() || self.disposition.snapshot().dropped_stale() {
                RowEnd::Aborted
            } else if let Some(err) = error {
                RowEnd::Error(err)
            } else {
                RowEnd::Done
            };
            rows.finish(end);
        }
        debug!(
            handler_id = self.id,
            request_id = self.request.id(),
            state = %state,
            "Result complete"
        );
        if let (Some(listener), Some(me)) = (&self.listener, self.me.upgrade()) {
            listener.on_complete(&me);
        }
    }
}

impl ResultStream for ResultHandler {
    fn handle_packet(&self, slice: Slice) -> Result<(), ProtocolError> {
        self.handle(slice)
    }

    fn is_done(&self) -> bool {
        self.core.lock().state.is_done()
    }

    fn has_more(&self) -> bool {
        self.has_more.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.abort();
    }
}

impl std::fmt::Debug for ResultHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandler")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("request_id", &self.request.id())
            .field("disposition", &self.disposition.snapshot())
            .finish()
    }
}
