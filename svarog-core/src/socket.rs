//! Asynchronous stream socket
//!
//! Each operation tries its non-blocking transport call once on the caller's
//! thread. An immediate outcome is still delivered through the event loop;
//! would-block parks a retry with the reactor. The handler is held in a
//! take-once slot shared by the retry action and the cancel path, which is
//! what makes exactly-once delivery hold even when both race.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use svarog_transport::{
    Endpoint, Handle, SocketOption, Transport, TransportError, TransportOption,
};
use tracing::{debug, trace};

use crate::error::IoError;
use crate::event_loop::LoopHandle;
use crate::reactor::{Direction, Reactor, Shared};

/// Take-once handler slot shared between an operation's retry action and its
/// cancel path.
pub(crate) type HandlerSlot<H> = Arc<Mutex<Option<H>>>;

pub(crate) fn slot<H>(handler: H) -> HandlerSlot<H> {
    Arc::new(Mutex::new(Some(handler)))
}

pub(crate) fn take<H>(slot: &HandlerSlot<H>) -> Option<H> {
    slot.lock().unwrap().take()
}

/// A connectable, readable, writable socket bound to one reactor.
///
/// Clones share the underlying handle; the transport-level socket closes
/// when the last clone drops (or on an explicit [`close`](Socket::close)).
#[derive(Clone)]
pub struct Socket {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Arc<Shared>,
    handle: Mutex<Option<Handle>>,
    peer: Mutex<Option<Endpoint>>,
    connecting: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().unwrap().take() {
            let _ = self.shared.transport.close(handle);
        }
    }
}

impl Socket {
    /// Open a fresh socket on `reactor`'s transport, in non-blocking mode.
    pub fn new(reactor: &Reactor) -> Result<Self, TransportError> {
        let shared = Arc::clone(reactor.shared());
        let handle = shared.transport.open()?;
        Self::from_handle(shared, handle, None)
    }

    /// Wrap a handle the transport produced via accept.
    pub(crate) fn accepted(
        shared: Arc<Shared>,
        handle: Handle,
        peer: Endpoint,
    ) -> Result<Self, TransportError> {
        Self::from_handle(shared, handle, Some(peer))
    }

    fn from_handle(
        shared: Arc<Shared>,
        handle: Handle,
        peer: Option<Endpoint>,
    ) -> Result<Self, TransportError> {
        let socket = Socket {
            inner: Arc::new(Inner {
                shared,
                handle: Mutex::new(Some(handle)),
                peer: Mutex::new(peer),
                connecting: AtomicBool::new(false),
            }),
        };
        // Everything downstream relies on would-block instead of blocking.
        socket.set_option(SocketOption::NonBlocking(true))?;
        Ok(socket)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    pub(crate) fn event_loop(&self) -> &LoopHandle {
        &self.inner.shared.event_loop
    }

    fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.shared.transport
    }

    pub(crate) fn handle(&self) -> Result<Handle, TransportError> {
        self.inner
            .handle
            .lock()
            .unwrap()
            .ok_or(TransportError::InvalidSocket)
    }

    pub fn is_open(&self) -> bool {
        self.inner.handle.lock().unwrap().is_some()
    }

    pub fn bind(&self, port: u16) -> Result<(), TransportError> {
        let handle = self.handle()?;
        self.transport().bind(handle, port)
    }

    pub fn set_option(&self, option: SocketOption) -> Result<(), TransportError> {
        let handle = self.handle()?;
        let transport = self.transport();
        match option {
            SocketOption::Rendezvous(value) => {
                transport.set_option(handle, TransportOption::Rendezvous(value))
            }
            SocketOption::ReuseAddress(value) => {
                transport.set_option(handle, TransportOption::ReuseAddress(value))
            }
            // The native flags mean blocking, so non-blocking negates into
            // both directions.
            SocketOption::NonBlocking(value) => {
                transport.set_option(handle, TransportOption::SendBlocking(!value))?;
                transport.set_option(handle, TransportOption::RecvBlocking(!value))
            }
        }
    }

    /// Local port the socket is bound to, if any.
    pub fn local_port(&self) -> Option<u16> {
        let handle = self.handle().ok()?;
        self.transport().local_port(handle).ok()
    }

    /// Peer endpoint, known once a connect has been started or the socket
    /// was produced by accept.
    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        *self.inner.peer.lock().unwrap()
    }

    /// Start connecting to `peer`; `handler` runs on the event loop once the
    /// attempt resolves.
    ///
    /// Setup failures (closed socket, transport rejection) are returned
    /// directly and the handler is discarded. An absent or unreachable
    /// server is an asynchronous outcome and reaches the handler as
    /// [`TransportError::NoServer`].
    pub fn async_connect<H>(&self, peer: Endpoint, handler: H) -> Result<(), TransportError>
    where
        H: FnOnce(Result<(), IoError>) + Send + 'static,
    {
        let handle = self.handle()?;
        *self.inner.peer.lock().unwrap() = Some(peer);
        self.transport().connect(handle, &peer)?;
        self.inner.connecting.store(true, Ordering::SeqCst);
        debug!(%handle, %peer, "connect in progress");

        // Completion is signaled by write readiness; the outcome needs a
        // separate re-check because readiness alone does not tell success
        // from failure.
        let pending = slot(handler);
        let action = {
            let socket = self.clone();
            let pending = Arc::clone(&pending);
            move || {
                if let Some(handler) = take(&pending) {
                    socket.finish_connect(handler);
                }
            }
        };
        let cancel = {
            let event_loop = self.event_loop().clone();
            move || {
                if let Some(handler) = take(&pending) {
                    event_loop.post(Box::new(move || handler(Err(IoError::Canceled))));
                }
            }
        };
        self.inner
            .shared
            .register(Direction::Write, handle, Box::new(action), Box::new(cancel));
        Ok(())
    }

    fn finish_connect<H>(&self, handler: H)
    where
        H: FnOnce(Result<(), IoError>) + Send + 'static,
    {
        self.inner.connecting.store(false, Ordering::SeqCst);
        let connected = match self.handle() {
            Ok(handle) => self.transport().is_connected(handle),
            Err(_) => false,
        };
        // The transport does not surface the underlying connect error, so an
        // unsuccessful attempt is reported as the server not being there.
        let result = if connected {
            Ok(())
        } else {
            Err(IoError::Transport(TransportError::NoServer))
        };
        trace!(connected, "connect re-check complete");
        self.event_loop().post(Box::new(move || handler(result)));
    }

    /// Read up to `len` bytes. `handler` runs on the event loop with the
    /// bytes read, [`IoError::EndOfStream`] once the peer has closed and the
    /// buffered data is drained, or the failure.
    pub fn async_read_some<H>(&self, len: usize, handler: H)
    where
        H: FnOnce(Result<Bytes, IoError>) + Send + 'static,
    {
        let event_loop = self.event_loop().clone();
        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(error) => {
                event_loop.post(Box::new(move || handler(Err(IoError::Transport(error)))));
                return;
            }
        };
        // A zero-length read must not park: the handle may already be
        // level-triggered ready, which would turn the retry into a spin.
        if len == 0 {
            event_loop.post(Box::new(move || handler(Ok(Bytes::new()))));
            return;
        }
        let mut buf = BytesMut::zeroed(len);
        match self.transport().recv(handle, &mut buf) {
            Ok(n) if n > 0 => {
                trace!(%handle, n, "read completed immediately");
                buf.truncate(n);
                event_loop.post(Box::new(move || handler(Ok(buf.freeze()))));
            }
            Ok(_) | Err(TransportError::AsyncRecv) => {
                trace!(%handle, "read would block, parking retry");
                let pending = slot(handler);
                let action = {
                    let socket = self.clone();
                    let pending = Arc::clone(&pending);
                    move || {
                        if let Some(handler) = take(&pending) {
                            socket.async_read_some(len, handler);
                        }
                    }
                };
                let cancel = move || {
                    if let Some(handler) = take(&pending) {
                        event_loop.post(Box::new(move || handler(Err(IoError::Canceled))));
                    }
                };
                self.inner
                    .shared
                    .register(Direction::Read, handle, Box::new(action), Box::new(cancel));
            }
            Err(TransportError::ConnectionLost) => {
                debug!(%handle, "read found the connection closed");
                event_loop.post(Box::new(move || handler(Err(IoError::EndOfStream))));
            }
            Err(error) => {
                debug!(%handle, %error, code = error.code(), "read failed");
                event_loop.post(Box::new(move || handler(Err(IoError::Transport(error)))));
            }
        }
    }

    /// Write some prefix of `data`. `handler` runs on the event loop with
    /// the count written; a connection broken before anything could be
    /// written reports [`IoError::EndOfStream`].
    pub fn async_write_some<H>(&self, data: Bytes, handler: H)
    where
        H: FnOnce(Result<usize, IoError>) + Send + 'static,
    {
        let event_loop = self.event_loop().clone();
        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(error) => {
                event_loop.post(Box::new(move || handler(Err(IoError::Transport(error)))));
                return;
            }
        };
        // Same fencepost as the zero-length read: nothing to send, so
        // complete instead of parking.
        if data.is_empty() {
            event_loop.post(Box::new(move || handler(Ok(0))));
            return;
        }
        match self.transport().send(handle, &data) {
            Ok(n) if n > 0 => {
                trace!(%handle, n, "write completed immediately");
                event_loop.post(Box::new(move || handler(Ok(n))));
            }
            Ok(_) | Err(TransportError::AsyncSend) => {
                trace!(%handle, "write would block, parking retry");
                let pending = slot(handler);
                let action = {
                    let socket = self.clone();
                    let pending = Arc::clone(&pending);
                    move || {
                        if let Some(handler) = take(&pending) {
                            socket.async_write_some(data, handler);
                        }
                    }
                };
                let cancel = move || {
                    if let Some(handler) = take(&pending) {
                        event_loop.post(Box::new(move || handler(Err(IoError::Canceled))));
                    }
                };
                self.inner
                    .shared
                    .register(Direction::Write, handle, Box::new(action), Box::new(cancel));
            }
            Err(TransportError::ConnectionLost) => {
                debug!(%handle, "write found the connection closed");
                event_loop.post(Box::new(move || handler(Err(IoError::EndOfStream))));
            }
            Err(error) => {
                debug!(%handle, %error, code = error.code(), "write failed");
                event_loop.post(Box::new(move || handler(Err(IoError::Transport(error)))));
            }
        }
    }

    /// Cancel any pending operations; their handlers resolve with
    /// [`IoError::Canceled`]. An in-flight connect is aborted by closing the
    /// handle, since the transport has no narrower way to stop it.
    pub fn cancel(&self) -> Result<(), TransportError> {
        if let Ok(handle) = self.handle() {
            self.inner.shared.cancel(Direction::Read, handle);
            self.inner.shared.cancel(Direction::Write, handle);
        }
        if self.inner.connecting.swap(false, Ordering::SeqCst) {
            self.close()?;
        }
        Ok(())
    }

    /// Close the underlying socket. Idempotent; already closed is `Ok`.
    pub fn close(&self) -> Result<(), TransportError> {
        let mut handle = self.inner.handle.lock().unwrap();
        if let Some(h) = handle.take() {
            debug!(handle = %h, "closing socket");
            if let Err(error) = self.transport().close(h) {
                // Leave the handle in place for a retry or for Drop.
                *handle = Some(h);
                return Err(error);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::LocalLoop;
    use svarog_transport::MemoryTransport;

    #[test]
    fn new_sockets_clear_both_native_blocking_flags() {
        let event_loop = LocalLoop::new();
        let transport = Arc::new(MemoryTransport::new());
        let reactor = Reactor::new(event_loop, transport.clone()).unwrap();

        let socket = Socket::new(&reactor).unwrap();
        let handle = socket.handle().unwrap();
        assert_eq!(transport.blocking_flags(handle), Some((false, false)));

        // Closing drops the handle out of the transport's table.
        socket.close().unwrap();
        assert_eq!(transport.blocking_flags(handle), None);
    }
}
