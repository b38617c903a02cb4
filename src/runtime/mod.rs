//! Echo reactor runtime.
//!
//! Readiness-based I/O on a single thread using mio (epoll on Linux, kqueue
//! on macOS), built from:
//! - `Descriptor`: owned socket descriptor, closed exactly once
//! - `ListeningEndpoint`: non-blocking listening socket
//! - `Poller`: edge-triggered readiness multiplexer
//! - `ConnectionTable`: per-connection state and pending output
//! - `EventLoop`: accept/read/write dispatch

pub mod connection;
mod descriptor;
pub mod event_loop;
mod listener;
pub mod poller;

pub use connection::{ConnState, Connection, ConnectionTable};
pub use descriptor::Descriptor;
pub use event_loop::{EventLoop, LoopOptions, LoopStats, Mode};
pub use listener::ListeningEndpoint;
pub use poller::{Interest, Poller, Readiness};

use crate::config::Config;
use crate::error::Result;
use tracing::info;

/// Bind the configured port and serve until a fatal error.
pub fn run(config: &Config) -> Result<()> {
    let listener = ListeningEndpoint::bind(config.port)?;
    let mut event_loop = EventLoop::new(listener, config.loop_options())?;

    info!(
        addr = %event_loop.local_addr(),
        max_events = config.max_events,
        buffer_size = config.buffer_size,
        max_pending = ?config.max_pending,
        "Listening"
    );

    event_loop.run(Mode::Indefinitely)
}
