//! edge-echo: a single-threaded, edge-triggered TCP echo server.
//!
//! Every byte a client sends is sent back on the same connection, in order.
//! Slow readers are handled with per-connection backlogs rather than by
//! blocking the reactor.

pub mod config;
pub mod error;
pub mod runtime;

pub use error::{Error, Result};
