//! Login session records.
//!
//! A session binds a token identifier to its owning account, with an
//! optional expiration. The reserved guest session (same identifier as
//! the guest account) is permanent: it can be neither mutated nor
//! deleted, so an unauthenticated caller always has a session to act
//! through.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use cubby_types::RecordId;

use crate::accounts::Account;
use crate::error::StoreError;
use crate::lazy::Lazy;
use crate::store::Store;

/// Session lifetime applied when the caller does not choose one.
pub fn default_session_lifetime() -> Duration {
    Duration::days(30)
}

/// Collection-level session operations.
pub struct Sessions<'a> {
    store: &'a Store,
}

impl<'a> Sessions<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn exists(&self, id: RecordId) -> Result<bool, StoreError> {
        self.store.with_read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id FROM sessions WHERE id = ?1",
                    [id.to_db()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
    }

    /// Fetches a session by id, loading every field eagerly.
    pub fn get(&self, id: RecordId) -> Result<Session, StoreError> {
        let row = self.store.with_read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT owner_id, created_at, expires_at FROM sessions WHERE id = ?1",
                    [id.to_db()],
                    |row| {
                        Ok((
                            RecordId::from_db(row.get(0)?),
                            row.get(1)?,
                            row.get(2)?,
                        ))
                    },
                )
                .optional()?)
        })?;
        match row {
            Some((owner_id, created_at, expires_at)) => Ok(Session {
                store: self.store.clone(),
                id,
                owner_id: Lazy::known(owner_id),
                created_at: Lazy::known(created_at),
                expires_at: Lazy::known(expires_at),
            }),
            None => Err(StoreError::not_found("session", "id", id)),
        }
    }

    pub fn get_all(&self) -> Result<Vec<Session>, StoreError> {
        let ids = self.store.with_read(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM sessions")?;
            let ids = stmt
                .query_map([], |row| Ok(RecordId::from_db(row.get(0)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        Ok(ids
            .into_iter()
            .map(|id| Session::lazy(self.store.clone(), id))
            .collect())
    }

    /// Sessions owned by the given account, as lazy views.
    pub fn owned_by(&self, owner: RecordId) -> Result<Vec<Session>, StoreError> {
        let ids = self.store.with_read(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM sessions WHERE owner_id = ?1")?;
            let ids = stmt
                .query_map([owner.to_db()], |row| Ok(RecordId::from_db(row.get(0)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        Ok(ids
            .into_iter()
            .map(|id| Session::lazy(self.store.clone(), id))
            .collect())
    }

    /// Opens a session for an account.
    ///
    /// `lifetime` of `None` means the session never expires.
    pub fn create(
        &self,
        owner: RecordId,
        lifetime: Option<Duration>,
    ) -> Result<Session, StoreError> {
        if !self.store.accounts().exists(owner)? {
            return Err(StoreError::not_found("account", "id", owner));
        }

        let id = self.store.generate_id();
        let created_at = Utc::now();
        let expires_at = lifetime.map(|lifetime| created_at + lifetime);
        self.store.with_write(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, owner_id, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.to_db(), owner.to_db(), created_at, expires_at],
            )?;
            Ok(())
        })?;
        tracing::debug!(%id, owner = %owner, "session created");

        Ok(Session {
            store: self.store.clone(),
            id,
            owner_id: Lazy::known(owner),
            created_at: Lazy::known(created_at),
            expires_at: Lazy::known(expires_at),
        })
    }
}

/// One session row, lazily loaded and write-through.
#[derive(Debug)]
pub struct Session {
    store: Store,
    id: RecordId,
    owner_id: Lazy<RecordId>,
    created_at: Lazy<DateTime<Utc>>,
    expires_at: Lazy<Option<DateTime<Utc>>>,
}

impl Session {
    fn lazy(store: Store, id: RecordId) -> Self {
        Self {
            store,
            id,
            owner_id: Lazy::Unknown,
            created_at: Lazy::Unknown,
            expires_at: Lazy::Unknown,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Whether this is the permanent guest session.
    pub fn is_guest_session(&self) -> bool {
        self.id == RecordId::GUEST
    }

    fn load<T: rusqlite::types::FromSql>(
        store: &Store,
        id: RecordId,
        sql: &str,
    ) -> Result<T, StoreError> {
        store.with_read(|conn| {
            conn.query_row(sql, [id.to_db()], |row| row.get(0))
                .optional()?
                .ok_or_else(|| StoreError::not_found("session", "id", id))
        })
    }

    pub fn owner_id(&mut self) -> Result<RecordId, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.owner_id.get_or_load(|| {
            Ok(RecordId::from_db(Self::load(
                &store,
                id,
                "SELECT owner_id FROM sessions WHERE id = ?1",
            )?))
        })
    }

    /// The owning account.
    pub fn owner(&mut self) -> Result<Account, StoreError> {
        let owner_id = self.owner_id()?;
        self.store.accounts().get(owner_id)
    }

    pub fn created_at(&mut self) -> Result<DateTime<Utc>, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.created_at.get_or_load(|| {
            Self::load(&store, id, "SELECT created_at FROM sessions WHERE id = ?1")
        })
    }

    pub fn expires_at(&mut self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.expires_at.get_or_load(|| {
            Self::load(&store, id, "SELECT expires_at FROM sessions WHERE id = ?1")
        })
    }

    pub fn set_expires_at(
        &mut self,
        new_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if self.is_guest_session() {
            return Err(StoreError::Permission {
                operation: "changing guest session properties",
            });
        }
        let id = self.id;
        self.store.with_write(|conn| {
            conn.execute(
                "UPDATE sessions SET expires_at = ?1 WHERE id = ?2",
                params![new_expires_at, id.to_db()],
            )?;
            Ok(())
        })?;
        self.expires_at.set(new_expires_at);
        Ok(())
    }

    /// Whether the session's expiration timestamp has passed.
    pub fn is_expired(&mut self) -> Result<bool, StoreError> {
        Ok(self
            .expires_at()?
            .map_or(false, |expires_at| Utc::now() > expires_at))
    }

    /// Deletes this session.
    ///
    /// # Errors
    ///
    /// Returns a permission error for the guest session.
    pub fn delete(self) -> Result<(), StoreError> {
        if self.is_guest_session() {
            return Err(StoreError::Permission {
                operation: "deletion of the guest session",
            });
        }
        let id = self.id;
        self.store.with_write(|conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", [id.to_db()])?;
            Ok(())
        })?;
        tracing::debug!(%id, "session deleted");
        Ok(())
    }
}
