//! Owned socket descriptors.
//!
//! `Descriptor` is the single owner of a raw file descriptor. Dropping it
//! closes the descriptor, so every early return and `?` during setup releases
//! what was already created. The non-blocking socket calls the reactor needs
//! are thin wrappers over socket2 borrowing the descriptor.

use socket2::SockRef;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, RawFd};

/// Value held by a guard that owns nothing.
const INVALID_FD: RawFd = -1;

/// Exclusive owner of one OS file descriptor.
///
/// Move-only. The wrapped descriptor is closed exactly once, when the guard is
/// dropped, unless ownership was handed back with [`Descriptor::release`].
#[derive(Debug)]
pub struct Descriptor {
    fd: RawFd,
}

impl Descriptor {
    /// Take ownership of `fd`.
    ///
    /// A negative value (the result of a failed syscall) produces an empty
    /// guard that closes nothing.
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd: if fd < 0 { INVALID_FD } else { fd },
        }
    }

    /// Whether the guard currently owns a descriptor.
    pub fn is_valid(&self) -> bool {
        self.fd != INVALID_FD
    }

    /// The wrapped raw value, or `-1` for an empty guard.
    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Give up ownership without closing.
    ///
    /// The caller becomes responsible for closing the returned value.
    pub fn release(&mut self) -> RawFd {
        std::mem::replace(&mut self.fd, INVALID_FD)
    }

    /// Borrow the descriptor as a socket for a single call.
    fn sock(&self) -> io::Result<SockRef<'_>> {
        if !self.is_valid() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(SockRef::from(self))
    }

    /// Switch the descriptor to non-blocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        self.sock()?.set_nonblocking(true)
    }

    /// Receive into `buf`. `Ok(0)` means the peer closed its side.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let sock = self.sock()?;
        (&*sock).read(buf)
    }

    /// Send from `buf`, returning how many bytes the kernel accepted.
    ///
    /// Never raises `SIGPIPE` on Linux; socket2 passes `MSG_NOSIGNAL`.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.sock()?.send(buf)
    }

    /// Accept one pending connection from a listening descriptor.
    ///
    /// The returned descriptor inherits nothing from the listener's blocking
    /// mode; callers set it non-blocking themselves.
    pub fn accept(&self) -> io::Result<(Descriptor, Option<SocketAddr>)> {
        let (socket, addr) = self.sock()?.accept()?;
        Ok((Descriptor::from(socket), addr.as_socket()))
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock()?.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket")
        })
    }
}

impl From<socket2::Socket> for Descriptor {
    fn from(socket: socket2::Socket) -> Self {
        Descriptor::new(socket.into_raw_fd())
    }
}

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// # Panics
///
/// Panics if the guard is empty. Check [`Descriptor::is_valid`] first.
impl AsFd for Descriptor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        assert!(self.is_valid(), "borrowing an empty descriptor");
        // SAFETY: the guard owns `fd` and keeps it open for the borrow.
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        if self.is_valid() {
            unsafe { libc::close(self.fd) };
            self.fd = INVALID_FD;
        }
    }
}
