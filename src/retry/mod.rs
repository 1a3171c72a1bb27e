//! Consistency-aware replay of discarded results.
//!
//! The [`RetryCoordinator`] listens to every result handler. When a response
//! ends aborted or dropped as stale it decides, once, between a transparent
//! replay on the leader, a synthesized error, or tearing the client down when
//! part of the response already reached it.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::metrics::metrics;
use crate::protocol::ErrPacket;
use crate::request::{ReadPreference, RequestContext};
use crate::result::{Disposition, ResultHandler, ResultListener, ResultState, ResultStream};
use crate::session::SessionContext;

/// ER_UNKNOWN_ERROR, surfaced when a stale result cannot be replayed
const STALE_ERROR_CODE: u16 = 1105;
/// CR_SERVER_LOST
const LOST_ERROR_CODE: u16 = 2013;

/// Client-side actions the coordinator asks for
pub trait RequestScheduler: Send + Sync {
    /// Run `request` again as a new top-level request
    fn reissue(&self, request: Arc<RequestContext>, session: Arc<dyn SessionContext>);

    /// Answer the client with `err` in place of the lost response
    fn send_error(&self, request: &RequestContext, err: ErrPacket);

    /// Tear the client connection down
    fn close_client(&self, request: &RequestContext, reason: &str);
}

/// Everything the decision depends on, captured at completion time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionInput {
    pub aborted: bool,
    pub dropped_stale: bool,
    pub aborted_known_stale: bool,
    pub forwarded: bool,
    pub has_literal: bool,
    pub in_transaction: bool,
    pub deadline_elapsed: bool,
    pub authenticated: bool,
    pub retry_enabled: bool,
}

impl DecisionInput {
    pub fn gather(handler: &ResultHandler, config: &RetryConfig) -> Self {
        let disposition = handler.disposition();
        let request = handler.request();
        let session = handler.session();
        Self {
            aborted: disposition.aborted(),
            dropped_stale: disposition.dropped_stale(),
            aborted_known_stale: disposition.aborted_known_stale(),
            forwarded: disposition.forwarded(),
            has_literal: request.has_literal(),
            in_transaction: session.in_transaction(),
            deadline_elapsed: request.deadline_elapsed(config.deadline()),
            authenticated: session.is_authenticated(),
            retry_enabled: config.enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetransmitDecision {
    pub should_force_leader: bool,
    pub need_retransmit: bool,
    pub need_send_abort_error: bool,
    pub need_close_client: bool,
}

impl RetransmitDecision {
    /// Only confirmed staleness is replayed. An abort on a backend never
    /// known to be stale ends in an error, never in a blind retry.
    pub fn evaluate(input: &DecisionInput) -> Self {
        let handling = input.aborted || input.dropped_stale;
        if !handling {
            return Self::default();
        }
        let should_force_leader =
            input.dropped_stale || (input.aborted && input.aborted_known_stale);
        let need_retransmit = should_force_leader
            && input.retry_enabled
            && input.has_literal
            && !input.in_transaction
            && !input.deadline_elapsed
            && !input.forwarded
            && input.authenticated;
        Self {
            should_force_leader,
            need_retransmit,
            need_send_abort_error: !need_retransmit && !input.forwarded,
            need_close_client: input.forwarded,
        }
    }

    pub fn is_noop(&self) -> bool {
        !(self.need_retransmit || self.need_send_abort_error || self.need_close_client)
    }
}

pub struct RetryCoordinator {
    config: RetryConfig,
    scheduler: Arc<dyn RequestScheduler>,
    /// Where delayed replays run
    runtime: Handle,
}

impl RetryCoordinator {
    pub fn new(config: RetryConfig, scheduler: Arc<dyn RequestScheduler>, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            config,
            scheduler,
            runtime,
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before attempt number `attempt` (1 for the first replay)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        self.config.base_delay(attempt) + Duration::from_millis(jitter)
    }

    fn schedule_retry(&self, handler: &ResultHandler, input: &DecisionInput, force_leader: bool) {
        let request = handler.request().clone();
        let session = handler.session().clone();
        let scheduler = self.scheduler.clone();
        let attempt = request.attempt() + 1;
        let delay = self.retry_delay(attempt);
        let reason = if input.dropped_stale { "stale" } else { "aborted_stale" };
        metrics().record_retry(reason);
        info!(
            request_id = request.id(),
            handler_id = handler.id(),
            backend_id = handler.backend().id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            attempt_ms = request.attempt_elapsed().as_millis() as u64,
            elapsed_ms = request.elapsed().as_millis() as u64,
            reason,
            "Replaying request"
        );
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let retry = request.derive_retry();
            if force_leader {
                retry.clear_pinned_lsn();
                retry.set_preference(ReadPreference::Leader);
            }
            scheduler.reissue(retry, session);
        });
    }

    fn abort_error(handler: &ResultHandler, input: &DecisionInput) -> ErrPacket {
        if let Some(err) = handler.outcome().error {
            return err;
        }
        if input.dropped_stale {
            ErrPacket::new(
                STALE_ERROR_CODE,
                "HY000",
                "Replica behind required position and request could not be replayed",
            )
        } else {
            ErrPacket::new(LOST_ERROR_CODE, "HY000", "Lost connection to backend during query")
        }
    }
}

impl ResultListener for RetryCoordinator {
    fn on_state_change(&self, handler: &ResultHandler, _from: ResultState, to: ResultState) {
        if to == ResultState::Abort && handler.backend().is_known_stale() {
            handler.mark(Disposition::ABORTED_STALE);
        }
    }

    fn on_complete(&self, handler: &Arc<ResultHandler>) {
        // the last handler of a chain decides for the whole response
        if handler.has_more() {
            return;
        }
        let request = handler.request();
        if request.is_system() {
            return;
        }
        let input = DecisionInput::gather(handler, &self.config);
        let decision = RetransmitDecision::evaluate(&input);
        if decision.is_noop() {
            return;
        }
        debug!(
            request_id = request.id(),
            handler_id = handler.id(),
            ?input,
            ?decision,
            "Result needs handling"
        );

        if decision.need_close_client {
            let reason = if decision.should_force_leader {
                error!(
                    request_id = request.id(),
                    backend_id = handler.backend().id(),
                    "Stale result bytes reached the client"
                );
                "stale result partially forwarded"
            } else {
                warn!(
                    request_id = request.id(),
                    backend_id = handler.backend().id(),
                    "Backend lost after part of the result was forwarded"
                );
                "partial result forwarded"
            };
            metrics().client_teardowns_total.inc();
            self.scheduler.close_client(request, reason);
            return;
        }

        if decision.need_retransmit {
            self.schedule_retry(handler, &input, decision.should_force_leader);
            return;
        }

        if decision.need_send_abort_error {
            let err = Self::abort_error(handler, &input);
            warn!(
                request_id = request.id(),
                attempt = request.attempt(),
                in_transaction = input.in_transaction,
                deadline_elapsed = input.deadline_elapsed,
                error = %err,
                "Request not replayed, sending error"
            );
            metrics().abort_errors_total.inc();
            self.scheduler.send_error(request, err);
        }
    }
}
