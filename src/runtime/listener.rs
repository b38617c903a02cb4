//! Listening endpoint construction.

use crate::error::{Error, Result, SetupStep};
use crate::runtime::Descriptor;
use socket2::{Domain, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

/// Non-blocking IPv4 TCP listener bound to all interfaces.
///
/// Construction either yields a listening socket or fails with the step that
/// broke; a half-configured socket is closed by its `Descriptor` on the way out.
#[derive(Debug)]
pub struct ListeningEndpoint {
    fd: Descriptor,
    addr: SocketAddr,
}

impl ListeningEndpoint {
    /// Bind to `0.0.0.0:port` with `SO_REUSEADDR` and the platform's maximum
    /// backlog. Port 0 picks an ephemeral port; see [`Self::local_addr`].
    pub fn bind(port: u16) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)
            .map_err(Error::setup(SetupStep::Socket))?;
        let fd = Descriptor::from(socket);
        {
            let sock = SockRef::from(&fd);

            sock.set_reuse_address(true)
                .map_err(Error::setup(SetupStep::SetSockOpt))?;

            let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
            sock.bind(&addr.into()).map_err(Error::setup(SetupStep::Bind))?;

            sock.set_nonblocking(true)
                .map_err(Error::setup(SetupStep::NonBlocking))?;

            sock.listen(libc::SOMAXCONN)
                .map_err(Error::setup(SetupStep::Listen))?;
        }

        let addr = fd.local_addr().map_err(Error::setup(SetupStep::Bind))?;

        Ok(Self { fd, addr })
    }

    /// Address actually bound, including the resolved port.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Accept one pending connection.
    ///
    /// `WouldBlock` means the accept queue is drained.
    pub fn accept(&self) -> io::Result<(Descriptor, Option<SocketAddr>)> {
        self.fd.accept()
    }
}

impl AsRawFd for ListeningEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = ListeningEndpoint::bind(0).unwrap();
        assert_ne!(listener.port(), 0);
        assert!(listener.local_addr().ip().is_unspecified());
    }

    #[test]
    fn test_accept_is_nonblocking() {
        let listener = ListeningEndpoint::bind(0).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_accept_pending_connection() {
        let listener = ListeningEndpoint::bind(0).unwrap();
        let client = TcpStream::connect(("127.0.0.1", listener.port())).unwrap();

        let (conn, peer) = listener.accept().unwrap();
        assert!(conn.is_valid());
        assert_eq!(peer, Some(client.local_addr().unwrap()));
    }

    #[test]
    fn test_bind_conflict_names_step() {
        let holder = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let taken = holder.local_addr().unwrap().port();

        // SO_REUSEADDR does not allow two live listeners on one port.
        match ListeningEndpoint::bind(taken) {
            Err(Error::Setup { step, .. }) => assert_eq!(step, SetupStep::Bind),
            other => panic!("unexpected: {:?}", other.map(|l| l.local_addr())),
        }
    }
}
