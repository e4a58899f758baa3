//! Fair reader/writer lock for the Cubby storage core.
//!
//! One `FairRwLock` instance guards the whole database: every store
//! operation takes the reader mode around a single SELECT or the writer
//! mode around a single INSERT/UPDATE/DELETE. Any number of readers may
//! hold the lock together; a writer holds it alone.
//!
//! # Fairness
//!
//! Waiters park on FIFO queues, one for each mode. Writers are granted
//! strictly in arrival order relative to other writers. When a writer
//! releases, exactly one queued reader is granted — and further queued
//! readers are drained only while no writer is waiting — so freshly
//! queued readers interleave with freshly queued writers instead of
//! starving them. Readers that arrive while only other readers hold the
//! lock are granted immediately, even past queued writers; this is a
//! weak fairness policy, not a strict cross-mode FIFO.
//!
//! # Blocking contract
//!
//! Acquisition blocks the calling thread until granted, with no timeout
//! and no cancellation. A holder that never finishes its critical
//! section stalls every waiter of the opposite mode indefinitely.
//! Releasing a mode that was never acquired is a programming error and
//! panics.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// A parked waiter. Granting = flipping the flag and notifying, which is
/// the handshake an acquisition blocks on.
#[derive(Debug)]
struct Waiter {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            granted: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn grant(&self) {
        let mut granted = self
            .granted
            .lock()
            .expect("lock waiter mutex poisoned");
        *granted = true;
        self.cv.notify_one();
    }

    fn block_until_granted(&self) {
        let mut granted = self
            .granted
            .lock()
            .expect("lock waiter mutex poisoned");
        while !*granted {
            granted = self
                .cv
                .wait(granted)
                .expect("lock waiter mutex poisoned");
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    writer_active: bool,
    readers: usize,
    read_queue: VecDeque<Arc<Waiter>>,
    write_queue: VecDeque<Arc<Waiter>>,
}

impl LockState {
    /// Grants one queued reader, then keeps draining queued readers as
    /// long as no writer is waiting. Granting a reader never blocks
    /// other readers, so the drain is transitive; it stops the moment a
    /// writer is queued so that writer gets its turn at the next
    /// reader-count-zero point.
    fn grant_queued_readers(&mut self) {
        if let Some(waiter) = self.read_queue.pop_front() {
            self.readers += 1;
            waiter.grant();
        }
        while self.write_queue.is_empty() {
            match self.read_queue.pop_front() {
                Some(waiter) => {
                    self.readers += 1;
                    waiter.grant();
                }
                None => break,
            }
        }
    }

    /// Grants the writer at the head of the queue, if any.
    fn grant_queued_writer(&mut self) -> bool {
        match self.write_queue.pop_front() {
            Some(waiter) => {
                self.writer_active = true;
                waiter.grant();
                true
            }
            None => false,
        }
    }
}

/// A queued, blocking reader/writer lock with FIFO writer fairness.
///
/// Prefer the scoped [`read`](FairRwLock::read) and
/// [`write`](FairRwLock::write) guards; the raw
/// `acquire_*`/`release_*` protocol is public so that release misuse
/// stays observable (it panics), but every release must pair with
/// exactly one prior successful acquire.
#[derive(Debug)]
pub struct FairRwLock {
    state: Mutex<LockState>,
}

impl FairRwLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
        }
    }

    /// Acquires the reader mode, blocking while a writer is active.
    pub fn acquire_read(&self) {
        let waiter = {
            let mut state = self.state.lock().expect("lock state mutex poisoned");
            if !state.writer_active {
                state.readers += 1;
                return;
            }
            let waiter = Waiter::new();
            state.read_queue.push_back(Arc::clone(&waiter));
            waiter
        };
        waiter.block_until_granted();
    }

    /// Releases one reader acquisition.
    ///
    /// # Panics
    ///
    /// Panics if no reader acquisition is outstanding.
    pub fn release_read(&self) {
        let mut state = self.state.lock().expect("lock state mutex poisoned");
        if state.readers == 0 {
            panic!("released a read lock that was never acquired (reader count is zero)");
        }
        state.readers -= 1;
        if state.readers == 0 && !state.grant_queued_writer() {
            // Writers only ever leave the queue by being granted, so a
            // non-empty read queue here means the drain below cannot be
            // preempted by a waiting writer.
            state.grant_queued_readers();
        }
    }

    /// Acquires the writer mode, blocking while any reader or another
    /// writer holds the lock.
    pub fn acquire_write(&self) {
        let waiter = {
            let mut state = self.state.lock().expect("lock state mutex poisoned");
            if state.readers == 0 && !state.writer_active {
                state.writer_active = true;
                return;
            }
            let waiter = Waiter::new();
            state.write_queue.push_back(Arc::clone(&waiter));
            waiter
        };
        waiter.block_until_granted();
    }

    /// Releases the writer acquisition.
    ///
    /// # Panics
    ///
    /// Panics if no writer acquisition is outstanding.
    pub fn release_write(&self) {
        let mut state = self.state.lock().expect("lock state mutex poisoned");
        if !state.writer_active {
            panic!("released a write lock that was never acquired (no writer is active)");
        }
        state.writer_active = false;
        if !state.read_queue.is_empty() {
            state.grant_queued_readers();
        } else {
            state.grant_queued_writer();
        }
    }

    /// Scoped reader acquisition; released on drop.
    pub fn read(&self) -> ReadGuard<'_> {
        self.acquire_read();
        ReadGuard { lock: self }
    }

    /// Scoped writer acquisition; released on drop.
    pub fn write(&self) -> WriteGuard<'_> {
        self.acquire_write();
        WriteGuard { lock: self }
    }
}

impl Default for FairRwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for a granted reader acquisition.
#[must_use = "the reader mode is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a FairRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// RAII handle for a granted writer acquisition.
#[must_use = "the writer mode is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a FairRwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests;
