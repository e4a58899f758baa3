//! The store handle and its startup lifecycle.

use std::path::Path;
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};

use cubby_lock::FairRwLock;
use cubby_types::IdGenerator;

use crate::accounts::Accounts;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::files::Files;
use crate::migrations;
use crate::sessions::Sessions;
use crate::watermark::{read_watermark, write_watermark};

type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug)]
struct StoreInner {
    pool: DbPool,
    lock: FairRwLock,
    ids: IdGenerator,
    config: StoreConfig,
}

/// Handle to the entity store.
///
/// One `Store` is constructed at process start and cloned (cheaply, via
/// a shared inner) into every worker that needs database access — there
/// is no ambient global. All access to the database goes through
/// [`with_read`](Store::with_read) / [`with_write`](Store::with_write),
/// which take the process-wide fair lock in the matching mode around
/// exactly one statement. The lock is never held across statements:
/// composite operations such as a cascade delete are sequences of
/// independently locked statements, and concurrent callers may
/// interleave between them.
#[derive(Clone, Debug)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens the database, then brings the schema to the latest version
    /// under a single writer-lock acquisition.
    ///
    /// The migration watermark is read before and persisted after the
    /// pass. Any migration failure is fatal: the error propagates and
    /// the host must not start serving traffic.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the pool cannot be built, the watermark
    /// file is unreadable, or a migration unit fails.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let pool = build_pool(&config)?;
        let store = Self {
            inner: Arc::new(StoreInner {
                pool,
                lock: FairRwLock::new(),
                ids: IdGenerator::new(),
                config,
            }),
        };

        let watermark_path = store.inner.config.watermark_path.clone();
        let last_applied = read_watermark(Path::new(&watermark_path))?;
        let latest = {
            let _guard = store.inner.lock.write();
            let conn = store.inner.pool.get()?;
            migrations::run_migrations(&conn, last_applied)?
        };
        write_watermark(Path::new(&watermark_path), latest)?;
        tracing::info!(
            db_path = %store.inner.config.db_path,
            watermark = latest,
            "store opened"
        );

        Ok(store)
    }

    /// Account operations.
    pub fn accounts(&self) -> Accounts<'_> {
        Accounts::new(self)
    }

    /// Session operations.
    pub fn sessions(&self) -> Sessions<'_> {
        Sessions::new(self)
    }

    /// Uploaded-file operations.
    pub fn files(&self) -> Files<'_> {
        Files::new(self)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Runs one statement under a reader acquisition.
    ///
    /// The connection must not escape the closure and the closure must
    /// issue exactly one statement; this is the convention that keeps
    /// the whole store consistent.
    pub(crate) fn with_read<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.inner.lock.read();
        let conn = self.inner.pool.get()?;
        op(&conn)
    }

    /// Runs one statement under a writer acquisition.
    pub(crate) fn with_write<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.inner.lock.write();
        let conn = self.inner.pool.get()?;
        op(&conn)
    }

    pub(crate) fn generate_id(&self) -> cubby_types::RecordId {
        self.inner.ids.generate()
    }
}

/// Builds the SQLite pool with WAL mode, foreign keys and busy timeout
/// configured on every connection.
///
/// The fair lock provides exclusion and fairness; the pool exists
/// because a single `rusqlite::Connection` cannot be shared across
/// threads, so each locked statement borrows a per-thread handle to the
/// one shared database.
fn build_pool(config: &StoreConfig) -> Result<DbPool, r2d2::Error> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let busy_timeout_ms = config.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(&config.db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {busy_timeout_ms};"
            ))
        });

    Pool::builder().max_size(config.pool_max_size).build(manager)
}
