//! In-process loopback transport
//!
//! [`MemoryTransport`] implements the full [`Transport`] contract without a
//! protocol stack underneath: handles are rows in a table, connections are
//! paired in-memory buffers, and readiness is level-triggered over the same
//! would-block code space a real session transport reports (`AsyncRecv`,
//! `AsyncSend`, `ConnectionLost`, `InvalidParameter` on an empty wait set).
//! It exists so the reactor bridge can be exercised end-to-end in tests and
//! in embeddings that stay inside one process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use crate::endpoint::{AddrFamily, Endpoint, RawAddr};
use crate::error::TransportError;
use crate::transport::{
    Handle, Interest, PollId, ReadyEvents, Transport, TransportOption,
};

/// Default per-connection receive buffer. A full peer buffer makes `send`
/// report `AsyncSend`, which is what drives the bridge's write-retry path.
pub const DEFAULT_SEND_CAPACITY: usize = 64 * 1024;

const EPHEMERAL_BASE: u16 = 49152;

#[derive(Debug, Clone, Copy)]
struct Options {
    rendezvous: bool,
    send_blocking: bool,
    recv_blocking: bool,
    reuse_address: bool,
}

impl Default for Options {
    fn default() -> Self {
        // The transport's native sense is blocking-on, like the protocol
        // stacks this stands in for.
        Options {
            rendezvous: false,
            send_blocking: true,
            recv_blocking: true,
            reuse_address: true,
        }
    }
}

enum Phase {
    Fresh,
    Bound,
    Listening {
        backlog: usize,
        pending: VecDeque<(Handle, RawAddr)>,
    },
    Connected {
        peer: Handle,
        inbox: BytesMut,
        peer_closed: bool,
    },
    /// Connect attempt resolved against no listener; write readiness is
    /// still signaled so the bridge's connect re-check can observe the
    /// failure.
    Failed,
}

struct SocketState {
    options: Options,
    local_port: Option<u16>,
    phase: Phase,
}

impl SocketState {
    fn fresh() -> Self {
        SocketState {
            options: Options::default(),
            local_port: None,
            phase: Phase::Fresh,
        }
    }
}

#[derive(Default)]
struct PollSet {
    interest: HashMap<Handle, Interest>,
    released: bool,
}

#[derive(Default)]
struct State {
    next_handle: i32,
    next_poll: u64,
    next_ephemeral: u16,
    sockets: HashMap<Handle, SocketState>,
    ports: HashMap<u16, Handle>,
    polls: HashMap<PollId, PollSet>,
}

/// Loopback implementation of [`Transport`].
pub struct MemoryTransport {
    state: Mutex<State>,
    readiness: Condvar,
    waits: AtomicU64,
    send_capacity: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_send_capacity(DEFAULT_SEND_CAPACITY)
    }

    /// A small capacity makes the would-block send path easy to reach in
    /// tests.
    pub fn with_send_capacity(send_capacity: usize) -> Self {
        MemoryTransport {
            state: Mutex::new(State::default()),
            readiness: Condvar::new(),
            waits: AtomicU64::new(0),
            send_capacity,
        }
    }

    /// Number of `poll_wait` calls issued so far. Lets tests assert that an
    /// idle reactor sleeps instead of spinning.
    pub fn waits_issued(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }

    /// Native blocking flags of a socket, `(send_blocking, recv_blocking)`.
    pub fn blocking_flags(&self, handle: Handle) -> Option<(bool, bool)> {
        let state = self.state.lock().unwrap();
        state
            .sockets
            .get(&handle)
            .map(|s| (s.options.send_blocking, s.options.recv_blocking))
    }

    fn socket<'a>(
        state: &'a State,
        handle: Handle,
    ) -> Result<&'a SocketState, TransportError> {
        state.sockets.get(&handle).ok_or(TransportError::InvalidSocket)
    }

    fn socket_mut<'a>(
        state: &'a mut State,
        handle: Handle,
    ) -> Result<&'a mut SocketState, TransportError> {
        state
            .sockets
            .get_mut(&handle)
            .ok_or(TransportError::InvalidSocket)
    }

    fn claim_ephemeral(state: &mut State) -> u16 {
        let mut port = state.next_ephemeral.max(EPHEMERAL_BASE);
        while state.ports.contains_key(&port) {
            port = port.checked_add(1).unwrap_or(EPHEMERAL_BASE);
        }
        state.next_ephemeral = port.wrapping_add(1);
        port
    }

    fn release_port(state: &mut State, handle: Handle, port: Option<u16>) {
        if let Some(port) = port {
            if state.ports.get(&port) == Some(&handle) {
                state.ports.remove(&port);
            }
        }
    }

    /// Level-triggered readiness of one handle. A handle that no longer
    /// exists reports ready in both directions so a stale registration
    /// resolves through its operation's own error path instead of hanging.
    fn handle_readiness(&self, state: &State, handle: Handle) -> (bool, bool) {
        let sock = match state.sockets.get(&handle) {
            Some(sock) => sock,
            None => return (true, true),
        };
        match &sock.phase {
            Phase::Fresh | Phase::Bound => (false, false),
            Phase::Listening { pending, .. } => (!pending.is_empty(), false),
            Phase::Failed => (false, true),
            Phase::Connected {
                peer,
                inbox,
                peer_closed,
            } => {
                let readable = !inbox.is_empty() || *peer_closed;
                let writable = if *peer_closed {
                    // Let a pending write run and observe ConnectionLost.
                    true
                } else {
                    match state.sockets.get(peer) {
                        Some(peer_sock) => match &peer_sock.phase {
                            Phase::Connected { inbox, .. } => {
                                inbox.len() < self.send_capacity
                            }
                            _ => true,
                        },
                        None => true,
                    }
                };
                (readable, writable)
            }
        }
    }

    fn wake(&self) {
        self.readiness.notify_all();
    }
}

impl Transport for MemoryTransport {
    fn open(&self) -> Result<Handle, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let handle = Handle::from_raw(state.next_handle);
        state.sockets.insert(handle, SocketState::fresh());
        trace!(%handle, "open socket");
        Ok(handle)
    }

    fn bind(&self, handle: Handle, port: u16) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        match Self::socket(&state, handle)?.phase {
            Phase::Fresh => {}
            _ => return Err(TransportError::BoundSocket),
        }
        let port = if port == 0 {
            Self::claim_ephemeral(&mut state)
        } else {
            if state.ports.contains_key(&port) {
                return Err(TransportError::DuplicateListen);
            }
            port
        };
        state.ports.insert(port, handle);
        let sock = Self::socket_mut(&mut state, handle)?;
        sock.local_port = Some(port);
        sock.phase = Phase::Bound;
        trace!(%handle, port, "bind socket");
        Ok(())
    }

    fn listen(&self, handle: Handle, backlog: usize) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let sock = Self::socket_mut(&mut state, handle)?;
        if sock.options.rendezvous {
            return Err(TransportError::RendezvousNoServ);
        }
        match sock.phase {
            Phase::Bound => {
                sock.phase = Phase::Listening {
                    backlog,
                    pending: VecDeque::new(),
                };
                debug!(%handle, backlog, "socket listening");
                Ok(())
            }
            Phase::Listening { .. } => Ok(()),
            Phase::Fresh => Err(TransportError::UnboundSocket),
            _ => Err(TransportError::ConnectedSocket),
        }
    }

    fn connect(&self, handle: Handle, peer: &Endpoint) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let sock = Self::socket(&state, handle)?;
        match sock.phase {
            Phase::Fresh | Phase::Bound => {}
            Phase::Listening { .. } => return Err(TransportError::InvalidOperation),
            _ => return Err(TransportError::ConnectedSocket),
        }
        if sock.options.rendezvous && sock.local_port.is_none() {
            return Err(TransportError::RendezvousUnbound);
        }

        let local_port = match sock.local_port {
            Some(port) => port,
            None => {
                let port = Self::claim_ephemeral(&mut state);
                state.ports.insert(port, handle);
                Self::socket_mut(&mut state, handle)?.local_port = Some(port);
                port
            }
        };

        // The caller's address, as the listener will see it: loopback in the
        // family the caller dialed.
        let family = match peer.addr {
            std::net::IpAddr::V4(_) => AddrFamily::V4,
            std::net::IpAddr::V6(_) => AddrFamily::V6,
        };
        let local = match family {
            AddrFamily::V4 => Endpoint::v4(std::net::Ipv4Addr::LOCALHOST, local_port),
            AddrFamily::V6 => Endpoint::v6(std::net::Ipv6Addr::LOCALHOST, local_port),
        };
        let raw = RawAddr::from_endpoint(&local);

        let listener = state.ports.get(&peer.port).copied().filter(|h| {
            matches!(
                state.sockets.get(h).map(|s| &s.phase),
                Some(Phase::Listening { .. })
            )
        });

        match listener {
            Some(listener_handle) => {
                state.next_handle += 1;
                let accepted = Handle::from_raw(state.next_handle);

                let room = match &Self::socket(&state, listener_handle)?.phase {
                    Phase::Listening { backlog, pending } => pending.len() < *backlog,
                    _ => false,
                };
                if !room {
                    Self::socket_mut(&mut state, handle)?.phase = Phase::Failed;
                    debug!(%handle, %peer, "connect rejected, backlog full");
                } else {
                    let listener_port =
                        Self::socket(&state, listener_handle)?.local_port;
                    state.sockets.insert(
                        accepted,
                        SocketState {
                            options: Options::default(),
                            local_port: listener_port,
                            phase: Phase::Connected {
                                peer: handle,
                                inbox: BytesMut::new(),
                                peer_closed: false,
                            },
                        },
                    );
                    if let Phase::Listening { pending, .. } =
                        &mut Self::socket_mut(&mut state, listener_handle)?.phase
                    {
                        pending.push_back((accepted, raw));
                    }
                    Self::socket_mut(&mut state, handle)?.phase = Phase::Connected {
                        peer: accepted,
                        inbox: BytesMut::new(),
                        peer_closed: false,
                    };
                    debug!(%handle, %peer, "connect paired with listener");
                }
            }
            None => {
                Self::socket_mut(&mut state, handle)?.phase = Phase::Failed;
                debug!(%handle, %peer, "connect found no listener");
            }
        }
        drop(state);
        self.wake();
        Ok(())
    }

    fn is_connected(&self, handle: Handle) -> bool {
        let state = self.state.lock().unwrap();
        matches!(
            state.sockets.get(&handle).map(|s| &s.phase),
            Some(Phase::Connected { .. })
        )
    }

    fn accept(&self, handle: Handle) -> Result<(Handle, RawAddr), TransportError> {
        let mut state = self.state.lock().unwrap();
        let sock = Self::socket_mut(&mut state, handle)?;
        let pending = match &mut sock.phase {
            Phase::Listening { pending, .. } => pending,
            _ => return Err(TransportError::NotListening),
        };
        match pending.pop_front() {
            Some((accepted, raw)) => {
                drop(state);
                self.wake();
                trace!(%handle, %accepted, "accepted connection");
                Ok((accepted, raw))
            }
            None => Err(TransportError::AsyncRecv),
        }
    }

    fn send(&self, handle: Handle, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        let (peer, peer_closed) = match &Self::socket(&state, handle)?.phase {
            Phase::Connected {
                peer, peer_closed, ..
            } => (*peer, *peer_closed),
            _ => return Err(TransportError::NoConnection),
        };
        if peer_closed {
            return Err(TransportError::ConnectionLost);
        }
        let capacity = self.send_capacity;
        let inbox = match state.sockets.get_mut(&peer).map(|s| &mut s.phase) {
            Some(Phase::Connected { inbox, .. }) => inbox,
            _ => return Err(TransportError::ConnectionLost),
        };
        let room = capacity.saturating_sub(inbox.len());
        if room == 0 {
            return Err(TransportError::AsyncSend);
        }
        let n = data.len().min(room);
        inbox.put_slice(&data[..n]);
        drop(state);
        self.wake();
        Ok(n)
    }

    fn recv(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        let sock = Self::socket_mut(&mut state, handle)?;
        let (inbox, peer_closed) = match &mut sock.phase {
            Phase::Connected {
                inbox, peer_closed, ..
            } => (inbox, *peer_closed),
            _ => return Err(TransportError::NoConnection),
        };
        if inbox.is_empty() {
            return if peer_closed {
                Err(TransportError::ConnectionLost)
            } else {
                Err(TransportError::AsyncRecv)
            };
        }
        let n = buf.len().min(inbox.len());
        buf[..n].copy_from_slice(&inbox.split_to(n));
        drop(state);
        self.wake();
        Ok(n)
    }

    fn close(&self, handle: Handle) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let sock = state
            .sockets
            .remove(&handle)
            .ok_or(TransportError::InvalidSocket)?;
        Self::release_port(&mut state, handle, sock.local_port);
        match sock.phase {
            Phase::Connected { peer, .. } => {
                if let Some(Phase::Connected { peer_closed, .. }) =
                    state.sockets.get_mut(&peer).map(|s| &mut s.phase)
                {
                    *peer_closed = true;
                }
            }
            Phase::Listening { pending, .. } => {
                // Orphan the queued, never-accepted connections.
                for (queued, _) in pending {
                    if let Some(queued_sock) = state.sockets.remove(&queued) {
                        if let Phase::Connected { peer, .. } = queued_sock.phase {
                            if let Some(Phase::Connected { peer_closed, .. }) =
                                state.sockets.get_mut(&peer).map(|s| &mut s.phase)
                            {
                                *peer_closed = true;
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        drop(state);
        self.wake();
        debug!(%handle, "closed socket");
        Ok(())
    }

    fn set_option(
        &self,
        handle: Handle,
        option: TransportOption,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let sock = Self::socket_mut(&mut state, handle)?;
        match option {
            TransportOption::Rendezvous(value) => sock.options.rendezvous = value,
            TransportOption::SendBlocking(value) => sock.options.send_blocking = value,
            TransportOption::RecvBlocking(value) => sock.options.recv_blocking = value,
            TransportOption::ReuseAddress(value) => sock.options.reuse_address = value,
        }
        Ok(())
    }

    fn local_port(&self, handle: Handle) -> Result<u16, TransportError> {
        let state = self.state.lock().unwrap();
        Self::socket(&state, handle)?
            .local_port
            .ok_or(TransportError::UnboundSocket)
    }

    fn poll_create(&self) -> Result<PollId, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.next_poll += 1;
        let poll = PollId::from_raw(state.next_poll);
        state.polls.insert(poll, PollSet::default());
        Ok(poll)
    }

    fn poll_add(
        &self,
        poll: PollId,
        handle: Handle,
        interest: Interest,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let set = state
            .polls
            .get_mut(&poll)
            .ok_or(TransportError::InvalidParameter)?;
        set.interest.insert(handle, interest);
        drop(state);
        self.wake();
        Ok(())
    }

    fn poll_remove(&self, poll: PollId, handle: Handle) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let set = state
            .polls
            .get_mut(&poll)
            .ok_or(TransportError::InvalidParameter)?;
        set.interest.remove(&handle);
        drop(state);
        self.wake();
        Ok(())
    }

    fn poll_wait(
        &self,
        poll: PollId,
        timeout: Option<Duration>,
    ) -> Result<ReadyEvents, TransportError> {
        self.waits.fetch_add(1, Ordering::Relaxed);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            {
                let set = state
                    .polls
                    .get(&poll)
                    .ok_or(TransportError::InvalidParameter)?;
                if set.released || set.interest.is_empty() {
                    // Same condition a released or empty native multiplex
                    // set reports; the reactor's stop/idle handling keys on
                    // it.
                    return Err(TransportError::InvalidParameter);
                }
                let mut events = ReadyEvents::default();
                for (&handle, &interest) in &set.interest {
                    let (readable, writable) = self.handle_readiness(&state, handle);
                    if interest.read && readable {
                        events.readable.push(handle);
                    }
                    if interest.write && writable {
                        events.writable.push(handle);
                    }
                }
                if !events.is_empty() {
                    return Ok(events);
                }
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    self.readiness
                        .wait_timeout(state, deadline - now)
                        .unwrap()
                        .0
                }
                None => self.readiness.wait(state).unwrap(),
            };
        }
    }

    fn poll_release(&self, poll: PollId) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let set = state
            .polls
            .get_mut(&poll)
            .ok_or(TransportError::InvalidParameter)?;
        set.released = true;
        drop(state);
        self.wake();
        Ok(())
    }
}
