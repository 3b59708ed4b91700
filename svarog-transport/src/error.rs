//! Transport error taxonomy
//!
//! One flat code space covering every condition the transport can report,
//! grouped by category: setup/connection (1xxx, 2xxx), resource (3xxx),
//! file/permission (4xxx), parameter/state (5xxx), async/timeout (6xxx) and
//! peer errors (7xxx), plus a pass-through for local OS errors. Every failing
//! transport call is normalized into this space before it reaches a caller.

use thiserror::Error;

/// Errors reported by a [`Transport`](crate::Transport) implementation.
///
/// The three `Async*` variants are would-block pseudo-errors: the
/// non-blocking call could not complete *yet*. The reactor bridge never
/// surfaces them to completion handlers; they trigger a readiness
/// registration instead.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection setup failure")]
    ConnectionSetup,
    #[error("server does not exist")]
    NoServer,
    #[error("connection request was rejected by server")]
    ConnectionRejected,
    #[error("could not create/configure UDP socket")]
    SocketFail,
    #[error("connection request was aborted due to security reasons")]
    SecurityFail,
    #[error("connection failure")]
    ConnectionFail,
    #[error("connection was broken")]
    ConnectionLost,
    #[error("connection does not exist")]
    NoConnection,
    #[error("system resource failure")]
    Resource,
    #[error("could not create new thread")]
    Thread,
    #[error("no memory space")]
    NoBuffer,
    #[error("file access error")]
    File,
    #[error("invalid read offset")]
    InvalidReadOffset,
    #[error("no read permission")]
    ReadPermission,
    #[error("invalid write offset")]
    InvalidWriteOffset,
    #[error("no write permission")]
    WritePermission,
    #[error("operation not supported")]
    InvalidOperation,
    #[error("cannot execute the operation on a bound socket")]
    BoundSocket,
    #[error("cannot execute the operation on a connected socket")]
    ConnectedSocket,
    #[error("bad parameters")]
    InvalidParameter,
    #[error("invalid transport socket")]
    InvalidSocket,
    #[error("cannot listen on unbound socket")]
    UnboundSocket,
    #[error("accept: socket is not in listening state")]
    NotListening,
    #[error("rendezvous connection process does not allow listen and accept call")]
    RendezvousNoServ,
    #[error("rendezvous connection setup is enabled but bind has not been called before connect")]
    RendezvousUnbound,
    #[error("operation not supported in stream mode")]
    StreamIllegal,
    #[error("operation not supported in message mode")]
    DatagramIllegal,
    #[error("another socket is already listening on the same UDP port")]
    DuplicateListen,
    #[error("message is too large to be held in the sending buffer")]
    LargeMessage,
    #[error("non-blocking call failure")]
    AsyncFail,
    #[error("no buffer available for sending")]
    AsyncSend,
    #[error("no data available for read")]
    AsyncRecv,
    #[error("timeout before operation completes")]
    Timeout,
    #[error("error has happened at the peer side")]
    PeerError,
    #[error("system error {0}")]
    Os(i32),
}

impl TransportError {
    /// Numeric code in the categorised space.
    pub fn code(&self) -> u32 {
        use TransportError::*;
        match self {
            ConnectionSetup => 1000,
            NoServer => 1001,
            ConnectionRejected => 1002,
            SocketFail => 1003,
            SecurityFail => 1004,
            ConnectionFail => 2000,
            ConnectionLost => 2001,
            NoConnection => 2002,
            Resource => 3000,
            Thread => 3001,
            NoBuffer => 3002,
            File => 4000,
            InvalidReadOffset => 4001,
            ReadPermission => 4002,
            InvalidWriteOffset => 4003,
            WritePermission => 4004,
            InvalidOperation => 5000,
            BoundSocket => 5001,
            ConnectedSocket => 5002,
            InvalidParameter => 5003,
            InvalidSocket => 5004,
            UnboundSocket => 5005,
            NotListening => 5006,
            RendezvousNoServ => 5007,
            RendezvousUnbound => 5008,
            StreamIllegal => 5009,
            DatagramIllegal => 5010,
            DuplicateListen => 5011,
            LargeMessage => 5012,
            AsyncFail => 6000,
            AsyncSend => 6001,
            AsyncRecv => 6002,
            Timeout => 6003,
            PeerError => 7000,
            Os(code) => *code as u32,
        }
    }

    /// True for the would-block pseudo-errors that mean "retry after
    /// readiness" rather than "failed".
    pub fn is_would_block(&self) -> bool {
        matches!(self, TransportError::AsyncSend | TransportError::AsyncRecv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_category_grouping() {
        assert_eq!(TransportError::ConnectionSetup.code(), 1000);
        assert_eq!(TransportError::NoServer.code(), 1001);
        assert_eq!(TransportError::ConnectionLost.code(), 2001);
        assert_eq!(TransportError::Resource.code(), 3000);
        assert_eq!(TransportError::File.code(), 4000);
        assert_eq!(TransportError::InvalidParameter.code(), 5003);
        assert_eq!(TransportError::AsyncRecv.code(), 6002);
        assert_eq!(TransportError::PeerError.code(), 7000);
    }

    #[test]
    fn would_block_is_limited_to_async_send_recv() {
        assert!(TransportError::AsyncSend.is_would_block());
        assert!(TransportError::AsyncRecv.is_would_block());
        assert!(!TransportError::AsyncFail.is_would_block());
        assert!(!TransportError::Timeout.is_would_block());
        assert!(!TransportError::ConnectionLost.is_would_block());
    }

    #[test]
    fn messages_are_human_readable() {
        assert_eq!(
            TransportError::AsyncRecv.to_string(),
            "no data available for read"
        );
        assert_eq!(
            TransportError::ConnectionLost.to_string(),
            "connection was broken"
        );
        assert_eq!(TransportError::Os(11).to_string(), "system error 11");
    }
}
