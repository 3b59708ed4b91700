//! Transport seam for the Svarog reactor bridge
//!
//! The bridge in `svarog-core` treats the underlying session transport as an
//! opaque non-blocking socket API plus a set-based readiness-wait primitive.
//! This crate defines that seam: the [`Transport`] trait, the handle and
//! option types, the [`TransportError`] code space and the [`Endpoint`]
//! address model. It also ships [`MemoryTransport`], an in-process loopback
//! implementation of the contract used by tests and embeddings that do not
//! link a real protocol stack.

pub mod endpoint;
pub mod error;
pub mod memory;
pub mod transport;

pub use endpoint::{AddrFamily, Endpoint, RawAddr};
pub use error::TransportError;
pub use memory::MemoryTransport;
pub use transport::{
    Handle, Interest, PollId, ReadyEvents, SocketOption, Transport, TransportOption,
};
