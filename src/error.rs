use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors returned by loopline setup paths.
///
/// Runtime invariant violations (calling an in-loop operation from the
/// wrong thread, constructing two loops on one thread, re-entering
/// `run()`) are programmer errors and panic instead.
#[derive(Debug, Error)]
pub enum Error {
    /// An OS call failed during setup or I/O.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Binding the listen socket failed (address in use, no permission, ...).
    #[error("bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying OS error.
        source: io::Error,
    },
    /// Creating the loop's kernel resources (epoll, eventfd, timerfd) failed.
    #[error("event loop setup: {0}")]
    LoopSetup(io::Error),
}
