//! Embedded entity store over SQLite.
//!
//! The store keeps three kinds of record — accounts, login sessions
//! and uploaded files — in a single SQLite database, fronted by a
//! process-wide fair reader/writer lock. Entities are object-like
//! views: fields load lazily on first access and setters write through
//! immediately, so a handle is always safe to keep around and cheap to
//! construct.
//!
//! [`Store::open`] builds the connection pool, runs any pending schema
//! migrations under a writer acquisition, and persists the migration
//! watermark. [`Sweeper::spawn`] optionally starts the background
//! thread that reclaims expired files; expiry is also enforced on read,
//! so running without the sweeper is merely a storage-usage concern.

pub mod accounts;
pub mod config;
pub mod error;
pub mod files;
pub mod migrations;
pub mod sessions;
pub mod sweep;

mod lazy;
mod store;
mod watermark;

pub use accounts::{Account, Accounts, NAME_MAX_LENGTH, PASSWORD_HASH_LENGTH};
pub use config::{load_config, ConfigError, StoreConfig};
pub use error::{ErrorKind, StoreError};
pub use files::{
    FileMetadata, Files, NewFile, StoredFile, CONTENT_HASH_LENGTH, DEFAULT_MEDIA_TYPE,
};
pub use sessions::{default_session_lifetime, Session, Sessions};
pub use store::Store;
pub use sweep::Sweeper;

pub use cubby_types::RecordId;
