//! Svarog core: the reactor bridge
//!
//! Adapts a session-oriented, non-blocking datagram transport (the seam in
//! `svarog-transport`) to a completion-handler programming model. A
//! [`Reactor`] owns one background thread blocked in the transport's
//! set-based readiness wait; [`Socket`] and [`Acceptor`] attempt their
//! non-blocking calls directly and, on would-block, register cancellable
//! continuations with the reactor. Every completion is delivered exactly
//! once, through the host loop's `post`, never on the caller's stack.

pub mod acceptor;
pub mod error;
pub mod event_loop;
pub mod reactor;
pub mod socket;

pub use acceptor::Acceptor;
pub use error::IoError;
pub use event_loop::{EventLoop, Job, LocalLoop, LoopHandle, WorkGuard};
pub use reactor::Reactor;
pub use socket::Socket;

pub use svarog_transport as transport;
