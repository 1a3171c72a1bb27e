//! Local (in-process) consumption of result rows.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::LocalResultConfig;
use crate::protocol::{ErrPacket, Row};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RowError {
    #[error("Backend error: {0}")]
    Backend(ErrPacket),

    #[error("Result aborted")]
    Aborted,

    #[error("No row within {0:?}")]
    Timeout(Duration),
}

/// How a row stream ended
#[derive(Debug, Clone)]
pub enum RowEnd {
    Done,
    Error(ErrPacket),
    Aborted,
}

#[derive(Debug, Default)]
struct Inner {
    rows: VecDeque<Row>,
    end: Option<RowEnd>,
    pushed: u64,
}

/// Rows decoded by a handler, read synchronously off the event loop
#[derive(Debug, Default)]
pub struct RowQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl RowQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, row: Row) {
        let mut inner = self.inner.lock();
        if inner.end.is_some() {
            return;
        }
        inner.rows.push_back(row);
        inner.pushed += 1;
        drop(inner);
        self.ready.notify_one();
    }

    /// Mark the end of the stream; only the first call counts. Wakes every reader.
    pub fn finish(&self, end: RowEnd) {
        let mut inner = self.inner.lock();
        if inner.end.is_none() {
            if !matches!(end, RowEnd::Done) {
                inner.rows.clear();
            }
            inner.end = Some(end);
        }
        drop(inner);
        self.ready.notify_all();
    }

    pub fn rows_pushed(&self) -> u64 {
        self.inner.lock().pushed
    }

    /// Next row, `Ok(None)` once the stream ended normally
    pub fn next_row(&self, timeout: Duration) -> Result<Option<Row>, RowError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(row) = inner.rows.pop_front() {
                return Ok(Some(row));
            }
            match &inner.end {
                Some(RowEnd::Done) => return Ok(None),
                Some(RowEnd::Error(err)) => return Err(RowError::Backend(err.clone())),
                Some(RowEnd::Aborted) => return Err(RowError::Aborted),
                None => {}
            }
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                if let Some(row) = inner.rows.pop_front() {
                    return Ok(Some(row));
                }
                if inner.end.is_none() {
                    return Err(RowError::Timeout(timeout));
                }
            }
        }
    }

    /// Read every remaining row
    pub fn collect(&self, timeout: Duration) -> Result<Vec<Row>, RowError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row(timeout)? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// [`collect`](Self::collect) with the configured per-row wait
    pub fn collect_configured(&self, config: &LocalResultConfig) -> Result<Vec<Row>, RowError> {
        self.collect(config.row_wait_timeout())
    }
}
