//! Edge-triggered readiness multiplexer.
//!
//! A thin layer over `mio::Poll` keyed by raw descriptor. mio registers every
//! source edge-triggered (`EPOLLET` on Linux, `EV_CLEAR` on kqueue), so one
//! notification only says readiness changed. Consumers must repeat the
//! read/accept/write until it reports `WouldBlock`, or later data is never
//! announced.

use crate::error::{Error, RegistrationOp, Result, SetupStep};
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use std::io;
use std::os::unix::io::RawFd;
use tracing::trace;

/// Default number of readiness records returned per wait.
pub const DEFAULT_MAX_EVENTS: usize = 1024;

/// Interest set of a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    ReadWrite,
}

impl Interest {
    fn to_mio(self) -> mio::Interest {
        match self {
            Interest::Readable => mio::Interest::READABLE,
            Interest::ReadWrite => mio::Interest::READABLE | mio::Interest::WRITABLE,
        }
    }
}

/// One ready descriptor from a wait call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    /// Readable, or an error/hang-up the next receive will surface.
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        let Token(token) = event.token();
        Self {
            fd: token as RawFd,
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable(),
        }
    }
}

/// Owns the kernel readiness instance and its event buffer.
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    /// Create a poller returning at most `max_events` records per wait.
    pub fn new(max_events: usize) -> Result<Self> {
        let poll = Poll::new().map_err(Error::setup(SetupStep::Poller))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(max_events),
        })
    }

    /// Upper bound on readiness records per wait.
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    /// Register `fd` for edge-triggered notification.
    pub fn add(&self, fd: RawFd, interest: Interest) -> Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token(fd), interest.to_mio())
            .map_err(Error::registration(RegistrationOp::Add, fd))
    }

    /// Replace the interest set of a registered `fd`.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token(fd), interest.to_mio())
            .map_err(Error::registration(RegistrationOp::Modify, fd))
    }

    /// Unregister `fd`. Must happen while `fd` is still open.
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        self.poll
            .registry()
            .deregister(&mut SourceFd(&fd))
            .map_err(Error::registration(RegistrationOp::Remove, fd))
    }

    /// Block until at least one registered descriptor is ready.
    ///
    /// There is no timeout. Interrupted waits are retried.
    pub fn wait(&mut self) -> Result<impl Iterator<Item = Readiness> + '_> {
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Wait(e)),
            }
        }
        trace!(ready = self.events.iter().count(), "poll returned");
        Ok(self.events.iter().map(Readiness::from_event))
    }
}

fn token(fd: RawFd) -> Token {
    Token(fd as usize)
}
