//! The reactor
//!
//! One background thread blocks in the transport's readiness wait. Sockets
//! park at most one continuation per direction per handle; when the handle
//! becomes ready the continuation is removed and posted to the event loop.
//! Cancellation removes the continuation and runs its cancel path instead,
//! so every parked operation resolves exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use svarog_transport::{Handle, Interest, PollId, Transport, TransportError};
use tracing::{debug, trace, warn};

use crate::event_loop::{Job, LoopHandle, WorkGuard};

/// A parked operation: what to run on readiness, what to run on
/// cancellation, and the token keeping the loop alive meanwhile.
struct PendingOp {
    action: Job,
    cancel: Job,
    _work: WorkGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

#[derive(Default)]
struct Tables {
    read: HashMap<Handle, PendingOp>,
    write: HashMap<Handle, PendingOp>,
    stop: bool,
}

/// State shared between the public [`Reactor`], its background thread, and
/// the sockets registered with it.
pub(crate) struct Shared {
    pub(crate) event_loop: LoopHandle,
    pub(crate) transport: Arc<dyn Transport>,
    poll: PollId,
    tables: Mutex<Tables>,
    barrier: Condvar,
}

impl Shared {
    /// The panic on a duplicate registration must not poison this mutex
    /// against the shutdown that runs while unwinding.
    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park `action` until `handle` is ready in `direction`.
    ///
    /// At most one operation may be pending per handle and direction;
    /// violating that is a caller bug and panics. After shutdown the
    /// operation resolves through its cancel path instead.
    pub(crate) fn register(&self, direction: Direction, handle: Handle, action: Job, cancel: Job) {
        let mut tables = self.lock_tables();
        if tables.stop {
            drop(tables);
            trace!(%handle, ?direction, "registration after shutdown, resolving as canceled");
            cancel();
            return;
        }
        let occupied = match direction {
            Direction::Read => tables.read.contains_key(&handle),
            Direction::Write => tables.write.contains_key(&handle),
        };
        if occupied {
            drop(tables);
            panic!("{direction:?} operation already pending on {handle}");
        }
        let table = match direction {
            Direction::Read => &mut tables.read,
            Direction::Write => &mut tables.write,
        };
        trace!(%handle, ?direction, "parking continuation");
        table.insert(
            handle,
            PendingOp {
                action,
                cancel,
                _work: WorkGuard::new(self.event_loop.clone()),
            },
        );
        self.refresh_membership(&tables, handle);
        self.barrier.notify_one();
    }

    /// Remove the pending operation for `handle` in `direction`, if any, and
    /// run its cancel path. A miss is a no-op.
    pub(crate) fn cancel(&self, direction: Direction, handle: Handle) {
        let removed = {
            let mut tables = self.lock_tables();
            let removed = match direction {
                Direction::Read => tables.read.remove(&handle),
                Direction::Write => tables.write.remove(&handle),
            };
            if removed.is_some() {
                self.refresh_membership(&tables, handle);
                self.barrier.notify_one();
            }
            removed
        };
        // Run outside the lock; the cancel path may register again.
        if let Some(op) = removed {
            debug!(%handle, ?direction, "canceling pending operation");
            (op.cancel)();
        }
    }

    /// Re-derive a handle's multiplex membership from table occupancy.
    fn refresh_membership(&self, tables: &Tables, handle: Handle) {
        let interest = Interest {
            read: tables.read.contains_key(&handle),
            write: tables.write.contains_key(&handle),
        };
        // The handle may not be in the set; a failed remove is fine.
        let _ = self.transport.poll_remove(self.poll, handle);
        if interest.any() {
            if let Err(error) = self.transport.poll_add(self.poll, handle, interest) {
                warn!(%handle, %error, "failed to refresh multiplex membership");
            }
        }
    }

    fn stopped(&self) -> bool {
        self.lock_tables().stop
    }

    fn run(&self) {
        loop {
            trace!("waiting for transport readiness");
            let events = match self.transport.poll_wait(self.poll, None) {
                Ok(events) => events,
                Err(TransportError::InvalidParameter) => {
                    // The set is empty (nothing parked) or released
                    // (shutdown). Idle on the barrier instead of spinning.
                    let mut tables = self.lock_tables();
                    if tables.stop {
                        debug!("reactor thread stopping");
                        return;
                    }
                    trace!("no parked operations, idling");
                    while tables.read.is_empty() && tables.write.is_empty() {
                        tables = self
                            .barrier
                            .wait(tables)
                            .unwrap_or_else(PoisonError::into_inner);
                        if tables.stop {
                            debug!("reactor thread stopping");
                            return;
                        }
                    }
                    continue;
                }
                Err(error) => {
                    if self.stopped() {
                        debug!("reactor thread stopping");
                        return;
                    }
                    panic!("transport readiness wait failed: {error}");
                }
            };

            let mut tables = self.lock_tables();
            if tables.stop {
                debug!("reactor thread stopping");
                return;
            }
            trace!(
                readable = events.readable.len(),
                writable = events.writable.len(),
                "dispatching readiness"
            );
            for handle in events.readable {
                // A miss lost a race against cancel; nothing to do.
                if let Some(op) = tables.read.remove(&handle) {
                    self.refresh_membership(&tables, handle);
                    debug!(%handle, "read ready, dispatching");
                    self.event_loop.post(Box::new(move || (op.action)()));
                }
            }
            for handle in events.writable {
                if let Some(op) = tables.write.remove(&handle) {
                    self.refresh_membership(&tables, handle);
                    debug!(%handle, "write ready, dispatching");
                    self.event_loop.post(Box::new(move || (op.action)()));
                }
            }
        }
    }
}

/// Owner of the readiness thread and the multiplex set it waits on.
///
/// Dropping the reactor shuts it down: the wait is released, outstanding
/// registrations are dropped without firing, and the thread is joined.
pub struct Reactor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    pub fn new(
        event_loop: LoopHandle,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, TransportError> {
        let poll = transport.poll_create()?;
        let shared = Arc::new(Shared {
            event_loop,
            transport,
            poll,
            tables: Mutex::new(Tables::default()),
            barrier: Condvar::new(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("svarog-reactor".into())
                .spawn(move || shared.run())
                .map_err(|_| TransportError::Thread)?
        };
        debug!("reactor started");
        Ok(Reactor {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn register_read(
        &self,
        handle: Handle,
        action: impl FnOnce() + Send + 'static,
        cancel: impl FnOnce() + Send + 'static,
    ) {
        self.shared
            .register(Direction::Read, handle, Box::new(action), Box::new(cancel));
    }

    pub fn register_write(
        &self,
        handle: Handle,
        action: impl FnOnce() + Send + 'static,
        cancel: impl FnOnce() + Send + 'static,
    ) {
        self.shared
            .register(Direction::Write, handle, Box::new(action), Box::new(cancel));
    }

    pub fn cancel_read(&self, handle: Handle) {
        self.shared.cancel(Direction::Read, handle);
    }

    pub fn cancel_write(&self, handle: Handle) {
        self.shared.cancel(Direction::Write, handle);
    }

    /// Stop the readiness thread and drop all parked operations.
    ///
    /// Neither their actions nor their cancel paths run; the work guards go
    /// with them, letting loop drivers return. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut tables = self.shared.lock_tables();
            if !tables.stop {
                tables.stop = true;
                if let Err(error) = self.shared.transport.poll_release(self.shared.poll) {
                    warn!(%error, "failed to release multiplex set");
                }
                tables.read.clear();
                tables.write.clear();
                self.shared.barrier.notify_all();
            }
        }
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            debug!("joining reactor thread");
            let _ = thread.join();
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn event_loop(&self) -> &LoopHandle {
        &self.shared.event_loop
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
