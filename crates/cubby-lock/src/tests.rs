//! Unit tests for the fair reader/writer lock.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::FairRwLock;

/// Tracks how many holders of each mode exist at any instant and
/// records whether an illegal overlap was ever observed.
#[derive(Default)]
struct InvariantProbe {
    readers: AtomicIsize,
    writers: AtomicIsize,
    violations: AtomicUsize,
}

impl InvariantProbe {
    fn enter_read(&self) {
        self.readers.fetch_add(1, Ordering::SeqCst);
        if self.writers.load(Ordering::SeqCst) != 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exit_read(&self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }

    fn enter_write(&self) {
        if self.writers.fetch_add(1, Ordering::SeqCst) != 0
            || self.readers.load(Ordering::SeqCst) != 0
        {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exit_write(&self) {
        self.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
fn readers_and_writers_never_overlap() {
    let lock = Arc::new(FairRwLock::new());
    let probe = Arc::new(InvariantProbe::default());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let lock = Arc::clone(&lock);
        let probe = Arc::clone(&probe);
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                let _guard = lock.write();
                probe.enter_write();
                thread::sleep(Duration::from_micros(200));
                probe.exit_write();
            }
        }));
    }
    for _ in 0..6 {
        let lock = Arc::clone(&lock);
        let probe = Arc::clone(&probe);
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                let _guard = lock.read();
                probe.enter_read();
                thread::sleep(Duration::from_micros(100));
                probe.exit_read();
            }
        }));
    }

    for handle in handles {
        handle.join().expect("worker thread panicked");
    }
    assert_eq!(
        probe.violations.load(Ordering::SeqCst),
        0,
        "a writer overlapped with another holder"
    );
}

#[test]
fn concurrent_writers_serialize_their_increments() {
    let lock = Arc::new(FairRwLock::new());
    let counter = Arc::new(std::sync::Mutex::new(0u32));

    // Read-pause-write inside the critical section: any two overlapping
    // writers would lose an increment.
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let _guard = lock.write();
                let observed = *counter.lock().unwrap();
                thread::sleep(Duration::from_millis(10));
                *counter.lock().unwrap() = observed + 1;
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("writer thread panicked");
    }
    assert_eq!(*counter.lock().unwrap(), 10);
}

#[test]
fn readers_share_the_lock_concurrently() {
    let lock = Arc::new(FairRwLock::new());
    let concurrent = Arc::new(AtomicIsize::new(0));
    let peak = Arc::new(AtomicIsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                let _guard = lock.read();
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                concurrent.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("reader thread panicked");
    }
    assert!(
        peak.load(Ordering::SeqCst) > 1,
        "readers were serialized against each other"
    );
}

#[test]
fn single_looping_reader_does_not_starve_writers() {
    let lock = Arc::new(FairRwLock::new());
    let writes_done = Arc::new(AtomicUsize::new(0));

    let reader = {
        let lock = Arc::clone(&lock);
        let writes_done = Arc::clone(&writes_done);
        thread::spawn(move || {
            // Keep re-acquiring until every writer has gotten through.
            while writes_done.load(Ordering::SeqCst) < 5 {
                let _guard = lock.read();
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    let start = Instant::now();
    let writers: Vec<_> = (0..5)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let writes_done = Arc::clone(&writes_done);
            thread::spawn(move || {
                let _guard = lock.write();
                writes_done.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    for handle in writers {
        handle.join().expect("writer thread panicked");
    }
    reader.join().expect("reader thread panicked");

    assert_eq!(writes_done.load(Ordering::SeqCst), 5);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "writers waited unreasonably long behind a single looping reader"
    );
}

#[test]
fn queued_writers_hand_off_to_each_other() {
    // Two writers queued behind a reader must both complete even though
    // no further reader or writer ever shows up to nudge the queue.
    let lock = Arc::new(FairRwLock::new());
    lock.acquire_read();

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.write();
                thread::sleep(Duration::from_millis(5));
            })
        })
        .collect();

    // Let both writers reach the queue before releasing the reader.
    thread::sleep(Duration::from_millis(50));
    lock.release_read();

    for handle in writers {
        handle.join().expect("queued writer never completed");
    }
}

#[test]
fn writer_release_wakes_queued_readers() {
    let lock = Arc::new(FairRwLock::new());
    lock.acquire_write();

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.read();
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    lock.release_write();

    // No writer is queued, so the reader drain is transitive and all
    // three wake from this single release.
    for handle in readers {
        handle.join().expect("queued reader never completed");
    }
}

#[test]
#[should_panic(expected = "released a read lock that was never acquired")]
fn releasing_an_unheld_read_lock_is_fatal() {
    FairRwLock::new().release_read();
}

#[test]
#[should_panic(expected = "released a write lock that was never acquired")]
fn releasing_an_unheld_write_lock_is_fatal() {
    FairRwLock::new().release_write();
}
