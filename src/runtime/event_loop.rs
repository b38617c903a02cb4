//! Single-threaded echo event loop.
//!
//! Readiness-based model: the poller reports which descriptors changed state,
//! then the loop performs non-blocking accept/recv/send until each one reports
//! `WouldBlock`.
//!
//! ## Connection states
//!
//! ```text
//!   accept ──▶ Accepted ──short write──▶ WritePending
//!                 ▲                           │
//!                 └──────backlog drained──────┘
//!   either state ──EOF / hard error──▶ closed (record removed)
//! ```
//!
//! `Accepted` connections are registered readable-only. `WritePending`
//! connections are registered readable and writable and own a non-empty
//! backlog. While a backlog exists, newly received bytes are appended to it
//! rather than sent, so the peer sees bytes in the order it sent them.

use crate::error::{Error, Result};
use crate::runtime::connection::{Connection, ConnectionTable, Echo, Flush};
use crate::runtime::poller::{Interest, Poller, Readiness, DEFAULT_MAX_EVENTS};
use crate::runtime::ListeningEndpoint;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, warn};

/// Default size of the receive scratch buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// How long [`EventLoop::run`] keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One wait followed by dispatch of everything it returned.
    Once,
    /// Wait and dispatch forever.
    Indefinitely,
}

/// Tunables for an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOptions {
    /// Readiness records returned per wait.
    pub max_events: usize,
    /// Size of the receive scratch buffer.
    pub buffer_size: usize,
    /// Per-connection backlog cap. `None` buffers without limit.
    pub max_pending: Option<usize>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_pending: None,
        }
    }
}

/// Counters maintained by the loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub accepted: u64,
    pub closed: u64,
    /// Times a connection entered `WritePending`.
    pub backpressured: u64,
    pub bytes_received: u64,
}

/// Reactor that accepts connections and echoes their bytes.
pub struct EventLoop {
    poller: Poller,
    listener: ListeningEndpoint,
    connections: ConnectionTable,
    scratch: Box<[u8]>,
    ready: Vec<Readiness>,
    max_pending: Option<usize>,
    stats: LoopStats,
}

impl EventLoop {
    /// Create the poller and register the listener for readability.
    pub fn new(listener: ListeningEndpoint, options: LoopOptions) -> Result<Self> {
        let poller = Poller::new(options.max_events)?;
        poller.add(listener.as_raw_fd(), Interest::Readable)?;

        Ok(Self {
            poller,
            listener,
            connections: ConnectionTable::new(),
            scratch: vec![0u8; options.buffer_size].into_boxed_slice(),
            ready: Vec::with_capacity(options.max_events),
            max_pending: options.max_pending,
            stats: LoopStats::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Bytes queued for `fd`, or `None` if it is not an open connection.
    pub fn pending_bytes(&self, fd: RawFd) -> Option<usize> {
        self.connections.get(fd).map(Connection::pending)
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Run wait-and-dispatch passes.
    ///
    /// Returns only on a fatal error, or after one pass with [`Mode::Once`].
    pub fn run(&mut self, mode: Mode) -> Result<()> {
        loop {
            self.run_once()?;
            if mode == Mode::Once {
                return Ok(());
            }
        }
    }

    fn run_once(&mut self) -> Result<()> {
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.poller.wait()?);

        let result = ready.iter().try_for_each(|&event| self.dispatch(event));

        self.ready = ready;
        result
    }

    fn dispatch(&mut self, event: Readiness) -> Result<()> {
        if event.fd == self.listener.as_raw_fd() {
            return self.accept_connections();
        }

        // Drain the backlog first so queued bytes leave before new ones arrive.
        if event.writable {
            self.handle_writable(event.fd);
        }
        if event.readable {
            self.handle_readable(event.fd);
        }
        Ok(())
    }

    /// Accept until the queue is empty. Only a hard accept error escapes.
    fn accept_connections(&mut self) -> Result<()> {
        loop {
            let (fd, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Accept(e)),
            };

            if let Err(e) = fd.set_nonblocking() {
                warn!(fd = fd.raw(), error = %e, "Dropping connection: set non-blocking failed");
                continue;
            }

            // Registration failures drop this connection only.
            if let Err(e) = self.poller.add(fd.raw(), Interest::Readable) {
                warn!(error = %e, "Dropping connection");
                continue;
            }

            let fd = self.connections.insert(Connection::new(fd, peer));
            self.stats.accepted += 1;
            debug!(fd, peer = ?peer, "Accepted connection");
        }
    }

    /// Receive until `WouldBlock`, echoing each chunk.
    fn handle_readable(&mut self, fd: RawFd) {
        loop {
            let Some(conn) = self.connections.get_mut(fd) else {
                return;
            };

            let n = match conn.recv(&mut self.scratch) {
                Ok(0) => {
                    debug!(fd, "Peer closed");
                    self.close_connection(fd);
                    return;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(fd, error = %e, "Receive failed");
                    self.close_connection(fd);
                    return;
                }
            };
            self.stats.bytes_received += n as u64;

            match conn.echo(&self.scratch[..n], self.max_pending) {
                Ok(Echo::Sent) | Ok(Echo::Queued) => {}
                Ok(Echo::Backpressured) => {
                    self.stats.backpressured += 1;
                    debug!(fd, pending = conn.pending(), "Backpressure, waiting for writable");
                    if let Err(e) = self.poller.modify(fd, Interest::ReadWrite) {
                        warn!(error = %e, "Dropping connection");
                        self.close_connection(fd);
                        return;
                    }
                }
                Err(e) => {
                    debug!(fd, error = %e, "Send failed");
                    self.close_connection(fd);
                    return;
                }
            }
        }
    }

    /// Push out as much backlog as the socket takes.
    fn handle_writable(&mut self, fd: RawFd) {
        let Some(conn) = self.connections.get_mut(fd) else {
            return;
        };

        match conn.flush() {
            Ok(Flush::Idle) | Ok(Flush::Pending) => {}
            Ok(Flush::Drained) => {
                debug!(fd, "Backlog drained");
                if let Err(e) = self.poller.modify(fd, Interest::Readable) {
                    warn!(error = %e, "Dropping connection");
                    self.close_connection(fd);
                }
            }
            Err(e) => {
                debug!(fd, error = %e, "Send failed");
                self.close_connection(fd);
            }
        }
    }

    /// Unregister, discard the backlog, and close `fd`.
    ///
    /// Returns `false` if `fd` is not an open connection, so repeated closes
    /// are no-ops.
    pub fn close_connection(&mut self, fd: RawFd) -> bool {
        let Some(conn) = self.connections.remove(fd) else {
            return false;
        };

        // Deregister while the descriptor is still open.
        if let Err(e) = self.poller.remove(fd) {
            warn!(error = %e, "Deregister failed");
        }
        let peer = conn.peer();
        drop(conn);

        self.stats.closed += 1;
        debug!(fd, peer = ?peer, "Connection closed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn event_loop() -> EventLoop {
        let listener = ListeningEndpoint::bind(0).unwrap();
        EventLoop::new(listener, LoopOptions::default()).unwrap()
    }

    fn connect(el: &EventLoop) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", el.local_addr().port())).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    #[test]
    fn test_once_accepts_all_pending() {
        let mut el = event_loop();
        let clients: Vec<_> = (0..16).map(|_| connect(&el)).collect();

        el.run(Mode::Once).unwrap();

        assert_eq!(el.connection_count(), clients.len());
        assert_eq!(el.stats().accepted, clients.len() as u64);
    }

    #[test]
    fn test_round_trip() {
        let mut el = event_loop();
        let mut client = connect(&el);
        el.run(Mode::Once).unwrap();
        assert_eq!(el.connection_count(), 1);

        client.write_all(b"hello\0").unwrap();
        el.run(Mode::Once).unwrap();

        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello\0");
        assert_eq!(el.stats().bytes_received, 6);
        assert_eq!(el.stats().backpressured, 0);
    }

    #[test]
    fn test_peer_close_is_idempotent() {
        let mut el = event_loop();
        let client = connect(&el);
        el.run(Mode::Once).unwrap();

        let (fd, _) = el.connections().iter().next().unwrap();
        assert_eq!(el.pending_bytes(fd), Some(0));

        drop(client);
        el.run(Mode::Once).unwrap();

        assert_eq!(el.connection_count(), 0);
        assert_eq!(el.pending_bytes(fd), None);
        assert_eq!(el.stats().closed, 1);

        assert!(!el.close_connection(fd));
        assert_eq!(el.stats().closed, 1);
    }

    #[test]
    fn test_close_connection_releases_socket() {
        let mut el = event_loop();
        let mut client = connect(&el);
        el.run(Mode::Once).unwrap();

        let (fd, _) = el.connections().iter().next().unwrap();
        assert!(el.close_connection(fd));

        // Server side is gone, so the client sees EOF.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
