//! Listening-side socket
//!
//! Binds and listens at construction, then hands out connected [`Socket`]s
//! through `async_accept`. The peer's address arrives from the transport in
//! its raw sockaddr-shaped form and is decoded here, for both address
//! families.

use std::sync::Arc;

use svarog_transport::{Endpoint, SocketOption, TransportError};
use tracing::{debug, info, trace};

use crate::error::IoError;
use crate::reactor::{Direction, Reactor};
use crate::socket::{slot, take, HandlerSlot, Socket};

const ACCEPT_BACKLOG: usize = 1024;

/// A listening socket producing connected [`Socket`]s.
#[derive(Clone)]
pub struct Acceptor {
    socket: Socket,
    port: u16,
}

impl Acceptor {
    /// Bind to `port` (`0` picks an ephemeral port) and start listening.
    pub fn new(reactor: &Reactor, port: u16) -> Result<Self, TransportError> {
        let socket = Socket::new(reactor)?;
        socket.set_option(SocketOption::ReuseAddress(true))?;
        socket.bind(port)?;
        let handle = socket.handle()?;
        let shared = socket.shared();
        shared.transport.listen(handle, ACCEPT_BACKLOG)?;
        let port = shared.transport.local_port(handle)?;
        info!(%handle, port, "acceptor listening");
        Ok(Acceptor { socket, port })
    }

    /// Port the acceptor is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one connection; `handler` runs on the event loop with the
    /// connected socket or the failure.
    ///
    /// Failures on this first attempt are returned directly and the handler
    /// is discarded; once the accept is parked, later failures reach the
    /// handler instead, because no caller stack remains to return on.
    pub fn async_accept<H>(&self, handler: H) -> Result<(), TransportError>
    where
        H: FnOnce(Result<Socket, IoError>) + Send + 'static,
    {
        self.attempt(slot(handler))
    }

    fn attempt<H>(&self, pending: HandlerSlot<H>) -> Result<(), TransportError>
    where
        H: FnOnce(Result<Socket, IoError>) + Send + 'static,
    {
        let handle = self.socket.handle()?;
        let shared = self.socket.shared();
        match shared.transport.accept(handle) {
            Ok((accepted, raw)) => {
                let peer = Endpoint::from_raw(&raw);
                debug!(%handle, %accepted, %peer, "accepted connection");
                let connection = Socket::accepted(Arc::clone(shared), accepted, peer)?;
                if let Some(handler) = take(&pending) {
                    shared
                        .event_loop
                        .post(Box::new(move || handler(Ok(connection))));
                }
                Ok(())
            }
            Err(error) if error.is_would_block() => {
                trace!(%handle, "no pending connection, parking retry");
                let action = {
                    let acceptor = self.clone();
                    let pending = Arc::clone(&pending);
                    move || {
                        if let Err(error) = acceptor.attempt(Arc::clone(&pending)) {
                            if let Some(handler) = take(&pending) {
                                acceptor
                                    .socket
                                    .event_loop()
                                    .post(Box::new(move || {
                                        handler(Err(IoError::Transport(error)))
                                    }));
                            }
                        }
                    }
                };
                let cancel = {
                    let event_loop = self.socket.event_loop().clone();
                    move || {
                        if let Some(handler) = take(&pending) {
                            event_loop
                                .post(Box::new(move || handler(Err(IoError::Canceled))));
                        }
                    }
                };
                shared.register(Direction::Read, handle, Box::new(action), Box::new(cancel));
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Cancel a pending accept; its handler resolves with
    /// [`IoError::Canceled`]. A miss is a no-op.
    pub fn cancel(&self) {
        if let Ok(handle) = self.socket.handle() {
            self.socket.shared().cancel(Direction::Read, handle);
        }
    }

    /// Close the listening socket.
    pub fn close(&self) -> Result<(), TransportError> {
        self.socket.close()
    }
}
