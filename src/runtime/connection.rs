//! Connection state machine and the table that owns it.
//!
//! Each accepted socket is a single `Connection` record: the descriptor and
//! the state that says whether echoed bytes are waiting to be sent. Removing a
//! record from the table drops the backlog and closes the descriptor together.

use crate::runtime::Descriptor;
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Current state of a connection.
#[derive(Debug)]
pub enum ConnState {
    /// Registered readable-only; nothing waiting to be sent.
    Accepted,
    /// Registered readable and writable. The backlog is never empty.
    WritePending(BytesMut),
}

/// What happened to bytes handed to [`Connection::echo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    /// The kernel took all of them.
    Sent,
    /// Appended behind an existing backlog.
    Queued,
    /// A short write created the backlog; writable interest is now needed.
    Backpressured,
}

/// Result of a [`Connection::flush`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// No backlog to flush.
    Idle,
    /// Bytes remain; wait for the next writable edge.
    Pending,
    /// Backlog fully sent; writable interest can be dropped.
    Drained,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    fd: Descriptor,
    state: ConnState,
    peer: Option<SocketAddr>,
}

impl Connection {
    /// Wrap an accepted, non-blocking descriptor.
    pub fn new(fd: Descriptor, peer: Option<SocketAddr>) -> Self {
        Self {
            fd,
            state: ConnState::Accepted,
            peer,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.raw()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> &ConnState {
        &self.state
    }

    /// Bytes waiting to be sent.
    pub fn pending(&self) -> usize {
        match &self.state {
            ConnState::Accepted => 0,
            ConnState::WritePending(backlog) => backlog.len(),
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.fd.recv(buf)
    }

    /// Echo `data` back to the peer.
    ///
    /// With a backlog present the bytes are appended and nothing is sent, so
    /// output order matches input order. Otherwise the bytes are sent directly
    /// and any unsent suffix starts a new backlog. `max_pending` caps the
    /// backlog; exceeding it is reported as an error so the caller resets the
    /// connection.
    pub fn echo(&mut self, data: &[u8], max_pending: Option<usize>) -> io::Result<Echo> {
        if let ConnState::WritePending(backlog) = &mut self.state {
            check_limit(backlog.len() + data.len(), max_pending)?;
            backlog.extend_from_slice(data);
            return Ok(Echo::Queued);
        }

        let sent = loop {
            match self.fd.send(data) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break 0,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if sent == data.len() {
            return Ok(Echo::Sent);
        }

        let rest = &data[sent..];
        check_limit(rest.len(), max_pending)?;
        self.state = ConnState::WritePending(BytesMut::from(rest));
        Ok(Echo::Backpressured)
    }

    /// Send from the head of the backlog.
    ///
    /// Stops at `WouldBlock` or after a short write instead of spinning; the
    /// next writable edge resumes. A fully drained backlog returns the
    /// connection to `Accepted`.
    pub fn flush(&mut self) -> io::Result<Flush> {
        let ConnState::WritePending(backlog) = &mut self.state else {
            return Ok(Flush::Idle);
        };

        while !backlog.is_empty() {
            match self.fd.send(&backlog[..]) {
                Ok(n) => {
                    let short = n < backlog.len();
                    backlog.advance(n);
                    if short {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if backlog.is_empty() {
            self.state = ConnState::Accepted;
            Ok(Flush::Drained)
        } else {
            Ok(Flush::Pending)
        }
    }
}

fn check_limit(len: usize, max_pending: Option<usize>) -> io::Result<()> {
    match max_pending {
        Some(max) if len > max => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("pending buffer limit exceeded: {len} > {max}"),
        )),
        _ => Ok(()),
    }
}

/// Active connections keyed by descriptor.
///
/// Presence of a record means the descriptor is open and registered.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<RawFd, Connection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, returning its key.
    pub fn insert(&mut self, conn: Connection) -> RawFd {
        let fd = conn.fd();
        self.connections.insert(fd, conn);
        fd
    }

    pub fn get(&self, fd: RawFd) -> Option<&Connection> {
        self.connections.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.connections.get_mut(&fd)
    }

    /// Remove a connection. Dropping the returned record closes it.
    pub fn remove(&mut self, fd: RawFd) -> Option<Connection> {
        self.connections.remove(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.connections.contains_key(&fd)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = (RawFd, &Connection)> {
        self.connections.iter().map(|(&fd, conn)| (fd, conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (Descriptor, Descriptor) {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "socketpair() failed");
        let pair = (Descriptor::new(fds[0]), Descriptor::new(fds[1]));
        pair.0.set_nonblocking().unwrap();
        pair.1.set_nonblocking().unwrap();
        pair
    }

    /// Echo chunks of `fill` until the peer's buffers are full.
    fn backpressure(conn: &mut Connection, fill: u8) -> usize {
        let chunk = vec![fill; 64 * 1024];
        let mut total = 0;
        for _ in 0..1024 {
            total += chunk.len();
            if conn.echo(&chunk, None).unwrap() == Echo::Backpressured {
                return total;
            }
        }
        panic!("socket never pushed back");
    }

    fn drain(peer: &Descriptor, out: &mut Vec<u8>) {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match peer.recv(&mut buf) {
                Ok(0) => return,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => panic!("recv failed: {e}"),
            }
        }
    }

    #[test]
    fn test_direct_echo() {
        let (server, client) = socketpair();
        let mut conn = Connection::new(server, None);

        assert_eq!(conn.echo(b"hello", None).unwrap(), Echo::Sent);
        assert!(matches!(conn.state(), ConnState::Accepted));
        assert_eq!(conn.flush().unwrap(), Flush::Idle);

        let mut out = Vec::new();
        drain(&client, &mut out);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_backlog_preserves_order() {
        let (server, client) = socketpair();
        let mut conn = Connection::new(server, None);

        let first = backpressure(&mut conn, b'A');
        assert!(conn.pending() > 0);

        // Once backlogged, new bytes queue behind the old ones.
        assert_eq!(conn.echo(b"BBBB", None).unwrap(), Echo::Queued);
        let expected_len = first + 4;

        let mut out = Vec::new();
        loop {
            drain(&client, &mut out);
            match conn.flush().unwrap() {
                Flush::Drained => break,
                Flush::Pending => continue,
                Flush::Idle => panic!("backlog vanished"),
            }
        }
        drain(&client, &mut out);

        assert!(matches!(conn.state(), ConnState::Accepted));
        assert_eq!(conn.pending(), 0);
        assert_eq!(out.len(), expected_len);
        assert!(out[..first].iter().all(|&b| b == b'A'));
        assert_eq!(&out[first..], b"BBBB");
    }

    #[test]
    fn test_pending_limit() {
        let (server, _client) = socketpair();
        let mut conn = Connection::new(server, None);

        backpressure(&mut conn, b'A');
        let limit = conn.pending();
        let err = conn.echo(b"more", Some(limit)).unwrap_err();
        assert!(err.to_string().contains("limit exceeded"));
    }

    #[test]
    fn test_table_remove_is_idempotent() {
        let (server, client) = socketpair();
        let mut table = ConnectionTable::new();
        let fd = table.insert(Connection::new(server, None));

        assert!(table.contains(fd));
        assert_eq!(table.len(), 1);

        assert!(table.remove(fd).is_some());
        assert!(table.remove(fd).is_none());
        assert!(table.is_empty());

        // The record closed the server end.
        let mut buf = [0u8; 1];
        assert_eq!(client.recv(&mut buf).unwrap(), 0);
    }
}
