//! Uploaded-file records.
//!
//! A [`StoredFile`] is an object-like view over one `files` row. The
//! payload is the only field [`Files::get`] leaves unloaded — it can be
//! tens of megabytes, so it stays lazy until [`StoredFile::data`] or
//! [`StoredFile::read_payload`] asks for it, while the derived size
//! comes from `LENGTH(data)` without pulling the blob.
//!
//! Expiry is enforced on read: [`Files::get_live`] deletes a file whose
//! expiration has passed and reports it as not found, whether or not
//! the background sweeper has run. Payload reads are counted, and a
//! file with a read cap deletes itself once the cap is exhausted.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use cubby_types::RecordId;

use crate::error::{ErrorKind, StoreError};
use crate::lazy::Lazy;
use crate::store::Store;

/// Exact length of a content-verification hash. Present only when the
/// payload is claimed to be client-encrypted.
pub const CONTENT_HASH_LENGTH: usize = 32;

/// Media type recorded when the uploader declares none.
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// Parameters for [`Files::create`].
pub struct NewFile {
    pub uploader: RecordId,
    /// Anonymize the uploader in metadata responses. Not permitted for
    /// the guest account, which is anonymous by identity already.
    pub uploader_hidden: bool,
    /// `None` picks the uploader's role default: the configured guest
    /// or authenticated lifetime, or no expiry at all for admin.
    pub lifetime: Option<Duration>,
    pub filename: Option<String>,
    pub data: Vec<u8>,
    pub content_hash: Option<String>,
    pub media_type: String,
    pub max_access_count: Option<u64>,
}

impl NewFile {
    pub fn new(uploader: RecordId, data: Vec<u8>) -> Self {
        Self {
            uploader,
            uploader_hidden: false,
            lifetime: None,
            filename: None,
            data,
            content_hash: None,
            media_type: DEFAULT_MEDIA_TYPE.to_string(),
            max_access_count: None,
        }
    }
}

/// Metadata view of a file, with the uploader anonymized when hidden.
#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    pub uploader_id: Option<RecordId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub filename: Option<String>,
    pub content_hash: Option<String>,
    pub media_type: String,
    pub data_access_count: u64,
    pub max_access_count: Option<u64>,
    pub meta_access_count: u64,
    pub size: u64,
}

/// Collection-level file operations.
pub struct Files<'a> {
    store: &'a Store,
}

impl<'a> Files<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn exists(&self, id: RecordId) -> Result<bool, StoreError> {
        self.store.with_read(|conn| {
            Ok(conn
                .query_row("SELECT id FROM files WHERE id = ?1", [id.to_db()], |_| {
                    Ok(())
                })
                .optional()?
                .is_some())
        })
    }

    /// Fetches a file by id, loading every column except the payload.
    pub fn get(&self, id: RecordId) -> Result<StoredFile, StoreError> {
        let row = self.store.with_read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT uploader_id, uploader_hidden, created_at, expires_at, filename,
                            content_hash, media_type, data_access_count, max_access_count,
                            meta_access_count, LENGTH(data)
                     FROM files WHERE id = ?1",
                    [id.to_db()],
                    FileRow::from_row,
                )
                .optional()?)
        })?;
        match row {
            Some(row) => Ok(StoredFile::hydrated(self.store.clone(), id, row)),
            None => Err(StoreError::not_found("file", "id", id)),
        }
    }

    /// Fetches a file by id, enforcing expiry-on-read: an expired row is
    /// deleted and reported as not found.
    pub fn get_live(&self, id: RecordId) -> Result<StoredFile, StoreError> {
        let mut file = self.get(id)?;
        if file.is_expired()? {
            tracing::debug!(%id, "file expired on lookup, deleting");
            delete_row(self.store, id)?;
            return Err(StoreError::not_found("file", "id", id));
        }
        Ok(file)
    }

    /// All files, as lazy views.
    pub fn get_all(&self) -> Result<Vec<StoredFile>, StoreError> {
        let ids = self.store.with_read(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM files")?;
            let ids = stmt
                .query_map([], |row| Ok(RecordId::from_db(row.get(0)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        Ok(ids
            .into_iter()
            .map(|id| StoredFile::lazy(self.store.clone(), id))
            .collect())
    }

    /// Files uploaded by the given account, as lazy views.
    pub fn uploaded_by(&self, uploader: RecordId) -> Result<Vec<StoredFile>, StoreError> {
        let ids = self.store.with_read(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM files WHERE uploader_id = ?1")?;
            let ids = stmt
                .query_map([uploader.to_db()], |row| Ok(RecordId::from_db(row.get(0)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        Ok(ids
            .into_iter()
            .map(|id| StoredFile::lazy(self.store.clone(), id))
            .collect())
    }

    /// Stores a new file.
    ///
    /// Validates the content-hash length, the guest/hidden mismatch,
    /// the uploader's existence, the role-dependent payload ceiling
    /// (guest below authenticated; admin exempt), and the requested
    /// lifetime against the role's maximum.
    pub fn create(&self, new: NewFile) -> Result<StoredFile, StoreError> {
        let config = self.store.config();

        if new.uploader == RecordId::GUEST && new.uploader_hidden {
            return Err(StoreError::Mismatch {
                field: "uploader_hidden",
                detail: "a guest upload is anonymous by identity and cannot also hide its uploader"
                    .to_string(),
            });
        }
        if let Some(hash) = &new.content_hash {
            if hash.len() != CONTENT_HASH_LENGTH {
                return Err(StoreError::WrongHashLength {
                    field: "content",
                    expected: CONTENT_HASH_LENGTH,
                    actual: hash.len(),
                });
            }
        }
        if new.uploader != RecordId::ADMIN {
            let ceiling = if new.uploader == RecordId::GUEST {
                config.guest_max_file_size
            } else {
                config.max_file_size
            };
            if new.data.len() as u64 > ceiling {
                return Err(StoreError::WrongLength {
                    field: "data",
                    units: "bytes",
                    min: None,
                    max: ceiling,
                    actual: new.data.len() as u64,
                });
            }
        }

        // The role ceiling doubles as the role default: admin has
        // neither, guest gets the shorter one.
        let role_lifetime = if new.uploader == RecordId::ADMIN {
            None
        } else if new.uploader == RecordId::GUEST {
            Some(config.guest_file_lifetime())
        } else {
            Some(config.file_lifetime())
        };
        let lifetime = match new.lifetime {
            Some(lifetime) => {
                if let Some(ceiling) = role_lifetime {
                    if lifetime > ceiling {
                        return Err(StoreError::InvalidValue {
                            field: "lifetime",
                            reason: format!(
                                "{} seconds exceeds the maximum of {} seconds",
                                lifetime.num_seconds(),
                                ceiling.num_seconds()
                            ),
                        });
                    }
                }
                Some(lifetime)
            }
            None => role_lifetime,
        };

        if !self.store.accounts().exists(new.uploader)? {
            return Err(StoreError::not_found("account", "id", new.uploader));
        }

        let id = self.store.generate_id();
        let created_at = Utc::now();
        let expires_at = lifetime.map(|lifetime| created_at + lifetime);
        let size = new.data.len() as u64;
        self.store.with_write(|conn| {
            conn.execute(
                "INSERT INTO files (id, uploader_id, uploader_hidden, created_at, expires_at,
                                    filename, data, content_hash, media_type,
                                    data_access_count, max_access_count, meta_access_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, 0)",
                params![
                    id.to_db(),
                    new.uploader.to_db(),
                    new.uploader_hidden,
                    created_at,
                    expires_at,
                    new.filename,
                    new.data,
                    new.content_hash,
                    new.media_type,
                    new.max_access_count.map(|n| n as i64),
                ],
            )?;
            Ok(())
        })?;
        tracing::debug!(%id, uploader = %new.uploader, size, "file stored");

        Ok(StoredFile {
            store: self.store.clone(),
            id,
            uploader_id: Lazy::known(new.uploader),
            uploader_hidden: Lazy::known(new.uploader_hidden),
            created_at: Lazy::known(created_at),
            expires_at: Lazy::known(expires_at),
            filename: Lazy::known(new.filename),
            data: Lazy::known(new.data),
            content_hash: Lazy::known(new.content_hash),
            media_type: Lazy::known(new.media_type),
            data_access_count: Lazy::known(0),
            max_access_count: Lazy::known(new.max_access_count),
            meta_access_count: Lazy::known(0),
            size: Lazy::known(size),
        })
    }

    /// Deletes every file whose expiration has passed. Returns how many
    /// rows went away.
    ///
    /// Used by the background sweeper, but safe to call from anywhere:
    /// deletion is idempotent, so racing the foreground expiry-on-read
    /// path (or another sweep) is harmless.
    pub fn delete_all_expired(&self) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for mut file in self.get_all()? {
            match file.is_expired() {
                Ok(true) => {
                    delete_row(self.store, file.id())?;
                    deleted += 1;
                }
                Ok(false) => {}
                // The row vanished between the enumeration and the
                // expiry check; someone else already deleted it.
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(deleted)
    }
}

/// Deletes a file row, treating an already-deleted row as a no-op.
fn delete_row(store: &Store, id: RecordId) -> Result<(), StoreError> {
    store.with_write(|conn| {
        let affected = conn.execute("DELETE FROM files WHERE id = ?1", [id.to_db()])?;
        if affected == 0 {
            tracing::debug!(%id, "file was already deleted");
        }
        Ok(())
    })
}

struct FileRow {
    uploader_id: RecordId,
    uploader_hidden: bool,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    filename: Option<String>,
    content_hash: Option<String>,
    media_type: String,
    data_access_count: u64,
    max_access_count: Option<u64>,
    meta_access_count: u64,
    size: u64,
}

impl FileRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            uploader_id: RecordId::from_db(row.get(0)?),
            uploader_hidden: row.get(1)?,
            created_at: row.get(2)?,
            expires_at: row.get(3)?,
            filename: row.get(4)?,
            content_hash: row.get(5)?,
            media_type: row.get(6)?,
            data_access_count: row.get::<_, i64>(7)? as u64,
            max_access_count: row.get::<_, Option<i64>>(8)?.map(|n| n as u64),
            meta_access_count: row.get::<_, i64>(9)? as u64,
            size: row.get::<_, i64>(10)? as u64,
        })
    }
}

/// One uploaded-file row, lazily loaded and write-through.
#[derive(Debug)]
pub struct StoredFile {
    store: Store,
    id: RecordId,
    uploader_id: Lazy<RecordId>,
    uploader_hidden: Lazy<bool>,
    created_at: Lazy<DateTime<Utc>>,
    expires_at: Lazy<Option<DateTime<Utc>>>,
    filename: Lazy<Option<String>>,
    data: Lazy<Vec<u8>>,
    content_hash: Lazy<Option<String>>,
    media_type: Lazy<String>,
    data_access_count: Lazy<u64>,
    max_access_count: Lazy<Option<u64>>,
    meta_access_count: Lazy<u64>,
    size: Lazy<u64>,
}

impl StoredFile {
    fn hydrated(store: Store, id: RecordId, row: FileRow) -> Self {
        Self {
            store,
            id,
            uploader_id: Lazy::known(row.uploader_id),
            uploader_hidden: Lazy::known(row.uploader_hidden),
            created_at: Lazy::known(row.created_at),
            expires_at: Lazy::known(row.expires_at),
            filename: Lazy::known(row.filename),
            // The payload stays unloaded; its size is already known.
            data: Lazy::Unknown,
            content_hash: Lazy::known(row.content_hash),
            media_type: Lazy::known(row.media_type),
            data_access_count: Lazy::known(row.data_access_count),
            max_access_count: Lazy::known(row.max_access_count),
            meta_access_count: Lazy::known(row.meta_access_count),
            size: Lazy::known(row.size),
        }
    }

    fn lazy(store: Store, id: RecordId) -> Self {
        Self {
            store,
            id,
            uploader_id: Lazy::Unknown,
            uploader_hidden: Lazy::Unknown,
            created_at: Lazy::Unknown,
            expires_at: Lazy::Unknown,
            filename: Lazy::Unknown,
            data: Lazy::Unknown,
            content_hash: Lazy::Unknown,
            media_type: Lazy::Unknown,
            data_access_count: Lazy::Unknown,
            max_access_count: Lazy::Unknown,
            meta_access_count: Lazy::Unknown,
            size: Lazy::Unknown,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    fn load<T: rusqlite::types::FromSql>(
        store: &Store,
        id: RecordId,
        sql: &str,
    ) -> Result<T, StoreError> {
        store.with_read(|conn| {
            conn.query_row(sql, [id.to_db()], |row| row.get(0))
                .optional()?
                .ok_or_else(|| StoreError::not_found("file", "id", id))
        })
    }

    fn update<P: rusqlite::ToSql>(&self, sql: &str, value: P) -> Result<(), StoreError> {
        let id = self.id;
        self.store.with_write(|conn| {
            conn.execute(sql, params![value, id.to_db()])?;
            Ok(())
        })
    }

    pub fn uploader_id(&mut self) -> Result<RecordId, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.uploader_id.get_or_load(|| {
            Ok(RecordId::from_db(Self::load(
                &store,
                id,
                "SELECT uploader_id FROM files WHERE id = ?1",
            )?))
        })
    }

    /// The uploading account.
    pub fn uploader(&mut self) -> Result<crate::accounts::Account, StoreError> {
        let uploader_id = self.uploader_id()?;
        self.store.accounts().get(uploader_id)
    }

    pub fn uploader_hidden(&mut self) -> Result<bool, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.uploader_hidden.get_or_load(|| {
            Self::load(&store, id, "SELECT uploader_hidden FROM files WHERE id = ?1")
        })
    }

    pub fn set_uploader_hidden(&mut self, hidden: bool) -> Result<(), StoreError> {
        if hidden && self.uploader_id()? == RecordId::GUEST {
            return Err(StoreError::Mismatch {
                field: "uploader_hidden",
                detail: "a guest upload is anonymous by identity and cannot also hide its uploader"
                    .to_string(),
            });
        }
        self.update("UPDATE files SET uploader_hidden = ?1 WHERE id = ?2", hidden)?;
        self.uploader_hidden.set(hidden);
        Ok(())
    }

    pub fn created_at(&mut self) -> Result<DateTime<Utc>, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.created_at
            .get_or_load(|| Self::load(&store, id, "SELECT created_at FROM files WHERE id = ?1"))
    }

    pub fn expires_at(&mut self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.expires_at
            .get_or_load(|| Self::load(&store, id, "SELECT expires_at FROM files WHERE id = ?1"))
    }

    pub fn set_expires_at(
        &mut self,
        new_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.update(
            "UPDATE files SET expires_at = ?1 WHERE id = ?2",
            new_expires_at,
        )?;
        self.expires_at.set(new_expires_at);
        Ok(())
    }

    pub fn filename(&mut self) -> Result<Option<String>, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.filename
            .get_or_load(|| Self::load(&store, id, "SELECT filename FROM files WHERE id = ?1"))
    }

    /// Renames the file.
    ///
    /// Unlike every other setter, this one invalidates its cache slot
    /// instead of storing the new value, so the next
    /// [`filename`](StoredFile::filename) call re-reads the row.
    pub fn set_filename(&mut self, new_filename: Option<&str>) -> Result<(), StoreError> {
        self.update("UPDATE files SET filename = ?1 WHERE id = ?2", new_filename)?;
        self.filename.invalidate();
        Ok(())
    }

    pub fn data(&mut self) -> Result<Vec<u8>, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.data
            .get_or_load(|| Self::load(&store, id, "SELECT data FROM files WHERE id = ?1"))
    }

    pub fn set_data(&mut self, new_data: Vec<u8>) -> Result<(), StoreError> {
        self.update("UPDATE files SET data = ?1 WHERE id = ?2", &new_data)?;
        self.size.set(new_data.len() as u64);
        self.data.set(new_data);
        Ok(())
    }

    pub fn content_hash(&mut self) -> Result<Option<String>, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.content_hash
            .get_or_load(|| Self::load(&store, id, "SELECT content_hash FROM files WHERE id = ?1"))
    }

    pub fn set_content_hash(&mut self, new_hash: Option<&str>) -> Result<(), StoreError> {
        if let Some(hash) = new_hash {
            if hash.len() != CONTENT_HASH_LENGTH {
                return Err(StoreError::WrongHashLength {
                    field: "content",
                    expected: CONTENT_HASH_LENGTH,
                    actual: hash.len(),
                });
            }
        }
        self.update("UPDATE files SET content_hash = ?1 WHERE id = ?2", new_hash)?;
        self.content_hash.set(new_hash.map(str::to_string));
        Ok(())
    }

    pub fn media_type(&mut self) -> Result<String, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.media_type
            .get_or_load(|| Self::load(&store, id, "SELECT media_type FROM files WHERE id = ?1"))
    }

    pub fn set_media_type(&mut self, new_media_type: &str) -> Result<(), StoreError> {
        self.update(
            "UPDATE files SET media_type = ?1 WHERE id = ?2",
            new_media_type,
        )?;
        self.media_type.set(new_media_type.to_string());
        Ok(())
    }

    pub fn data_access_count(&mut self) -> Result<u64, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.data_access_count.get_or_load(|| {
            Ok(Self::load::<i64>(
                &store,
                id,
                "SELECT data_access_count FROM files WHERE id = ?1",
            )? as u64)
        })
    }

    pub fn set_data_access_count(&mut self, count: u64) -> Result<(), StoreError> {
        self.update(
            "UPDATE files SET data_access_count = ?1 WHERE id = ?2",
            count as i64,
        )?;
        self.data_access_count.set(count);
        Ok(())
    }

    pub fn max_access_count(&mut self) -> Result<Option<u64>, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.max_access_count.get_or_load(|| {
            Ok(Self::load::<Option<i64>>(
                &store,
                id,
                "SELECT max_access_count FROM files WHERE id = ?1",
            )?
            .map(|n| n as u64))
        })
    }

    pub fn set_max_access_count(&mut self, max: Option<u64>) -> Result<(), StoreError> {
        self.update(
            "UPDATE files SET max_access_count = ?1 WHERE id = ?2",
            max.map(|n| n as i64),
        )?;
        self.max_access_count.set(max);
        Ok(())
    }

    pub fn meta_access_count(&mut self) -> Result<u64, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.meta_access_count.get_or_load(|| {
            Ok(Self::load::<i64>(
                &store,
                id,
                "SELECT meta_access_count FROM files WHERE id = ?1",
            )? as u64)
        })
    }

    pub fn set_meta_access_count(&mut self, count: u64) -> Result<(), StoreError> {
        self.update(
            "UPDATE files SET meta_access_count = ?1 WHERE id = ?2",
            count as i64,
        )?;
        self.meta_access_count.set(count);
        Ok(())
    }

    /// Payload size in bytes, computed from the stored blob.
    pub fn size(&mut self) -> Result<u64, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.size.get_or_load(|| {
            Ok(Self::load::<i64>(&store, id, "SELECT LENGTH(data) FROM files WHERE id = ?1")? as u64)
        })
    }

    /// Whether the file's expiration timestamp has passed.
    pub fn is_expired(&mut self) -> Result<bool, StoreError> {
        Ok(self
            .expires_at()?
            .map_or(false, |expires_at| Utc::now() > expires_at))
    }

    /// Reads the payload, counting the access and enforcing the read
    /// cap: once the incremented count leaves no further permitted
    /// read, the row is deleted after this (still successful) one.
    ///
    /// The increment and the read are separately locked statements, so
    /// two concurrent readers can observe the same count; the lost
    /// update is an accepted trade-off of the single-statement locking
    /// rule.
    pub fn read_payload(&mut self) -> Result<Vec<u8>, StoreError> {
        let count = self.data_access_count()? + 1;
        self.set_data_access_count(count)?;
        let data = self.data()?;
        if let Some(max) = self.max_access_count()? {
            if count + 1 > max {
                tracing::debug!(id = %self.id, count, max, "read cap exhausted, deleting file");
                delete_row(&self.store, self.id)?;
            }
        }
        Ok(data)
    }

    /// Returns the metadata view, counting the access. The uploader is
    /// anonymized when the file hides it.
    pub fn read_metadata(&mut self) -> Result<FileMetadata, StoreError> {
        let meta_access_count = self.meta_access_count()? + 1;
        self.set_meta_access_count(meta_access_count)?;

        let uploader_id = if self.uploader_hidden()? {
            None
        } else {
            Some(self.uploader_id()?)
        };
        Ok(FileMetadata {
            uploader_id,
            created_at: self.created_at()?,
            expires_at: self.expires_at()?,
            filename: self.filename()?,
            content_hash: self.content_hash()?,
            media_type: self.media_type()?,
            data_access_count: self.data_access_count()?,
            max_access_count: self.max_access_count()?,
            meta_access_count,
            size: self.size()?,
        })
    }

    /// Deletes this file. Deleting an already-deleted file is a no-op.
    pub fn delete(self) -> Result<(), StoreError> {
        delete_row(&self.store, self.id)?;
        tracing::debug!(id = %self.id, "file deleted");
        Ok(())
    }
}
