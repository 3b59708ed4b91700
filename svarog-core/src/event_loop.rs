//! The host event loop seam
//!
//! The bridge never runs completion handlers itself; it hands them to an
//! [`EventLoop`] via `post`. The loop also keeps a count of outstanding work
//! ([`WorkGuard`]) so it does not run dry while an operation is still parked
//! in the reactor. [`LocalLoop`] is the single-threaded FIFO implementation
//! the bridge is normally driven by.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send>;

/// The host event loop as the bridge sees it.
///
/// `post` must never run `job` on the calling stack, even when a completion
/// is already known. The work count keeps `run`-style drivers alive while
/// operations are outstanding but not yet queued.
pub trait EventLoop: Send + Sync {
    /// Schedule `job` to run later, in FIFO order with other posted jobs.
    fn post(&self, job: Job);

    fn work_started(&self);

    fn work_finished(&self);
}

pub type LoopHandle = Arc<dyn EventLoop>;

/// Scoped outstanding-work token.
///
/// Construction counts work started, dropping counts it finished. The
/// reactor holds one per parked operation, released only once the operation
/// has been dispatched, canceled, or dropped at shutdown.
pub struct WorkGuard {
    event_loop: LoopHandle,
}

impl WorkGuard {
    pub fn new(event_loop: LoopHandle) -> Self {
        event_loop.work_started();
        WorkGuard { event_loop }
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.event_loop.work_finished();
    }
}

/// Single-threaded FIFO loop.
///
/// `run` executes jobs as they arrive and returns once the queue is empty
/// and no work guards are held; `poll` drains what is already queued without
/// blocking.
pub struct LocalLoop {
    state: Mutex<LoopState>,
    wakeup: Condvar,
}

#[derive(Default)]
struct LoopState {
    queue: VecDeque<Job>,
    work: usize,
}

impl LocalLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalLoop {
            state: Mutex::new(LoopState::default()),
            wakeup: Condvar::new(),
        })
    }

    /// Run jobs until the queue is empty and no work is outstanding.
    /// Returns the number of jobs executed.
    pub fn run(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.next_job(true) {
            job();
            ran += 1;
        }
        ran
    }

    /// Run whatever is already queued, without waiting for more.
    pub fn poll(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.next_job(false) {
            job();
            ran += 1;
        }
        ran
    }

    fn next_job(&self, block: bool) -> Option<Job> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(job) = state.queue.pop_front() {
                return Some(job);
            }
            if !block || state.work == 0 {
                return None;
            }
            state = self.wakeup.wait(state).unwrap();
        }
    }
}

impl EventLoop for LocalLoop {
    fn post(&self, job: Job) {
        self.state.lock().unwrap().queue.push_back(job);
        self.wakeup.notify_all();
    }

    fn work_started(&self) {
        self.state.lock().unwrap().work += 1;
    }

    fn work_finished(&self) {
        let mut state = self.state.lock().unwrap();
        state.work = state.work.saturating_sub(1);
        drop(state);
        self.wakeup.notify_all();
    }
}
