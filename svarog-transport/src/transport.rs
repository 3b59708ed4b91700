//! The transport seam
//!
//! [`Transport`] is the contract the reactor bridge programs against: a
//! handle-based non-blocking socket API plus a set-based readiness-wait
//! primitive (`poll_*`). Implementations report failures as
//! [`TransportError`] values on the failing call itself; there is no
//! process-global last-error slot.

use std::fmt;
use std::time::Duration;

use crate::endpoint::{Endpoint, RawAddr};
use crate::error::TransportError;

/// Opaque identifier for one transport-level socket.
///
/// Unique while the socket is open; the transport may reuse the value after
/// `close`. Callers must drop readiness registrations before closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(i32);

impl Handle {
    pub fn from_raw(raw: i32) -> Self {
        Handle(raw)
    }

    pub fn raw(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of one multiplex (readiness-wait) set owned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollId(u64);

impl PollId {
    pub fn from_raw(raw: u64) -> Self {
        PollId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Directions a handle is monitored for in a multiplex set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };

    pub fn any(&self) -> bool {
        self.read || self.write
    }
}

/// Handles reported ready by one readiness wait.
#[derive(Debug, Default)]
pub struct ReadyEvents {
    pub readable: Vec<Handle>,
    pub writable: Vec<Handle>,
}

impl ReadyEvents {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }
}

/// Native per-socket options.
///
/// The blocking options follow the transport's sense: `SendBlocking(true)` /
/// `RecvBlocking(true)` mean *blocking* calls. The socket-level
/// [`SocketOption::NonBlocking`] negates into both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOption {
    Rendezvous(bool),
    SendBlocking(bool),
    RecvBlocking(bool),
    ReuseAddress(bool),
}

/// The closed set of named options exposed on sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    Rendezvous(bool),
    NonBlocking(bool),
    ReuseAddress(bool),
}

/// Non-blocking, session-oriented transport as seen by the reactor bridge.
///
/// All socket calls must be non-blocking once the blocking options are
/// cleared; would-block conditions are reported as
/// [`TransportError::AsyncRecv`] / [`TransportError::AsyncSend`]. The only
/// blocking entry point is [`poll_wait`](Transport::poll_wait).
pub trait Transport: Send + Sync + 'static {
    /// Create a fresh, unbound socket.
    fn open(&self) -> Result<Handle, TransportError>;

    /// Bind to a local port; `0` picks an ephemeral port.
    fn bind(&self, handle: Handle, port: u16) -> Result<(), TransportError>;

    /// Put a bound socket into listening state.
    fn listen(&self, handle: Handle, backlog: usize) -> Result<(), TransportError>;

    /// Start a non-blocking connect to `peer`. Completion is signaled by
    /// write readiness; [`is_connected`](Transport::is_connected) tells the
    /// outcome.
    fn connect(&self, handle: Handle, peer: &Endpoint) -> Result<(), TransportError>;

    /// Whether a connect has completed successfully.
    fn is_connected(&self, handle: Handle) -> bool;

    /// Dequeue one pending connection. Would-block is `AsyncRecv`.
    fn accept(&self, handle: Handle) -> Result<(Handle, RawAddr), TransportError>;

    /// Send up to `data.len()` bytes, returning the count written. A full
    /// peer buffer is `AsyncSend`.
    fn send(&self, handle: Handle, data: &[u8]) -> Result<usize, TransportError>;

    /// Receive up to `buf.len()` bytes. No data is `AsyncRecv`; a broken
    /// connection with nothing left to drain is `ConnectionLost`.
    fn recv(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Close the socket and release its handle.
    fn close(&self, handle: Handle) -> Result<(), TransportError>;

    fn set_option(&self, handle: Handle, option: TransportOption) -> Result<(), TransportError>;

    /// Local port the socket is bound to.
    fn local_port(&self, handle: Handle) -> Result<u16, TransportError>;

    /// Create a multiplex set.
    fn poll_create(&self) -> Result<PollId, TransportError>;

    /// Add or replace a handle's membership in a multiplex set.
    fn poll_add(
        &self,
        poll: PollId,
        handle: Handle,
        interest: Interest,
    ) -> Result<(), TransportError>;

    /// Remove a handle from a multiplex set. Removing an absent handle is
    /// not an error.
    fn poll_remove(&self, poll: PollId, handle: Handle) -> Result<(), TransportError>;

    /// Block until at least one monitored handle is ready, the timeout
    /// elapses (`Timeout`), or the set is released. An empty or released set
    /// fails with `InvalidParameter`.
    fn poll_wait(
        &self,
        poll: PollId,
        timeout: Option<Duration>,
    ) -> Result<ReadyEvents, TransportError>;

    /// Release a multiplex set, failing any in-progress or future wait on it.
    fn poll_release(&self, poll: PollId) -> Result<(), TransportError>;
}
