//! Background expiry sweeper.
//!
//! Expiry is already enforced on read, so the sweeper is purely about
//! reclaiming storage from files nobody asks for again. It runs on a
//! plain thread, waking at the configured interval, and shuts down
//! promptly when the handle is dropped.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::store::Store;

struct Shutdown {
    requested: Mutex<bool>,
    cv: Condvar,
}

/// Handle to the sweeper thread. Dropping it stops the thread and waits
/// for the in-flight pass, if any, to finish.
pub struct Sweeper {
    shutdown: Arc<Shutdown>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Starts the sweeper for the given store.
    pub fn spawn(store: Store) -> Self {
        let shutdown = Arc::new(Shutdown {
            requested: Mutex::new(false),
            cv: Condvar::new(),
        });
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("expiry-sweeper".to_string())
            .spawn(move || run(store, &thread_shutdown))
            .expect("spawning the sweeper thread should not fail");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        *self
            .shutdown
            .requested
            .lock()
            .expect("sweeper shutdown lock should not be poisoned") = true;
        self.shutdown.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(store: Store, shutdown: &Shutdown) {
    let interval = store.config().sweep_interval();
    loop {
        let mut requested = shutdown
            .requested
            .lock()
            .expect("sweeper shutdown lock should not be poisoned");
        while !*requested {
            let (guard, timeout) = shutdown
                .cv
                .wait_timeout(requested, interval)
                .expect("sweeper shutdown lock should not be poisoned");
            requested = guard;
            if timeout.timed_out() {
                break;
            }
        }
        if *requested {
            tracing::debug!("sweeper shutting down");
            return;
        }
        drop(requested);

        match store.files().delete_all_expired() {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "sweeper removed expired files"),
            // A failed pass is not fatal; the next interval retries.
            Err(err) => tracing::warn!(error = %err, "sweeper pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;
    use tempfile::TempDir;

    use crate::config::StoreConfig;
    use crate::files::NewFile;

    fn test_store(dir: &TempDir, sweep_interval_secs: u64) -> Store {
        let config = StoreConfig {
            db_path: dir.path().join("store.db").to_string_lossy().into_owned(),
            watermark_path: dir
                .path()
                .join("schema_version")
                .to_string_lossy()
                .into_owned(),
            sweep_interval_secs,
            ..StoreConfig::default()
        };
        Store::open(config).expect("store should open")
    }

    #[test]
    fn sweeper_deletes_expired_files() {
        let dir = TempDir::new().expect("should create temp dir");
        let store = test_store(&dir, 1);

        let account = store
            .accounts()
            .create("sweep-owner", Some("sweep@example.com"), None)
            .expect("account should be created");
        let mut new = NewFile::new(account.id(), b"short-lived".to_vec());
        new.lifetime = Some(Duration::milliseconds(50));
        let file = store.files().create(new).expect("file should be created");
        let id = file.id();

        let sweeper = Sweeper::spawn(store.clone());
        std::thread::sleep(std::time::Duration::from_millis(1500));
        drop(sweeper);

        assert!(
            !store.files().exists(id).expect("exists should succeed"),
            "the expired file should be gone after a sweep"
        );
    }

    #[test]
    fn dropping_the_handle_stops_the_thread() {
        let dir = TempDir::new().expect("should create temp dir");
        let store = test_store(&dir, 3600);

        let sweeper = Sweeper::spawn(store);
        // With an hour-long interval the thread is parked in its timed
        // wait; drop must interrupt it rather than block for the hour.
        let start = std::time::Instant::now();
        drop(sweeper);
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }
}
