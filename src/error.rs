//! Error types for the echo reactor.
//!
//! Only failures that make the reactor unusable live here. Would-block and
//! interrupted syscalls are control flow inside the drain loops, and peer
//! failures are handled by closing the affected connection.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Setup step that failed while building the listener or the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    Socket,
    SetSockOpt,
    Bind,
    NonBlocking,
    Listen,
    Poller,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStep::Socket => "socket()",
            SetupStep::SetSockOpt => "setsockopt()",
            SetupStep::Bind => "bind()",
            SetupStep::NonBlocking => "set non-blocking",
            SetupStep::Listen => "listen()",
            SetupStep::Poller => "poller creation",
        };
        f.write_str(name)
    }
}

/// Poller operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOp {
    Add,
    Modify,
    Remove,
}

impl fmt::Display for RegistrationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationOp::Add => "add",
            RegistrationOp::Modify => "modify",
            RegistrationOp::Remove => "remove",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Listener or poller construction failed.
    #[error("{step} failed: {source}")]
    Setup {
        step: SetupStep,
        #[source]
        source: io::Error,
    },

    /// The kernel rejected a registration change.
    #[error("poller {op} failed for fd {fd}: {source}")]
    Registration {
        op: RegistrationOp,
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// Waiting for readiness failed for a reason other than interruption.
    #[error("poll wait failed: {0}")]
    Wait(#[source] io::Error),

    /// Accepting on the listener failed; the listener is presumed broken.
    #[error("accept() failed: {0}")]
    Accept(#[source] io::Error),
}

impl Error {
    pub(crate) fn setup(step: SetupStep) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Setup { step, source }
    }

    pub(crate) fn registration(op: RegistrationOp, fd: RawFd) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::Registration { op, fd, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_error_names_step() {
        let err = Error::setup(SetupStep::Bind)(io::Error::from(io::ErrorKind::AddrInUse));
        let msg = err.to_string();
        assert!(msg.starts_with("bind() failed"), "{msg}");
    }

    #[test]
    fn test_registration_error_names_op_and_fd() {
        let err = Error::registration(RegistrationOp::Modify, 7)(io::Error::from_raw_os_error(
            libc::ENOENT,
        ));
        let msg = err.to_string();
        assert!(msg.contains("modify"), "{msg}");
        assert!(msg.contains("fd 7"), "{msg}");
    }
}
