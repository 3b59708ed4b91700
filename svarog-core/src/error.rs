//! Completion-side errors
//!
//! Handlers see [`IoError`]: the orderly end of a stream and cancellation
//! are distinguished from genuine transport failures, which pass through
//! unchanged.

use svarog_transport::TransportError;
use thiserror::Error;

/// Error delivered to a completion handler.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The peer closed the connection and no buffered data remains.
    #[error("end of stream")]
    EndOfStream,

    /// The operation was canceled before it could complete.
    #[error("operation canceled")]
    Canceled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
