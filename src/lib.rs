//! Athena relay: the result path of a MySQL proxy.
//!
//! Backend responses are framed by [`transport`], walked by the per-command
//! state machines in [`result`], rewritten when the two legs disagree about
//! EOF framing, and replayed against the leader by [`retry`] when a replica
//! turns out to be behind.

pub mod backend;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod request;
pub mod result;
pub mod retry;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber, filtered by `RUST_LOG` with `info` as default.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .try_init();
}
