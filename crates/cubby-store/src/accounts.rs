//! Account records.
//!
//! An [`Account`] is an object-like view over one `users` row: fields
//! load lazily (one point query each, on first access) and setters
//! write through immediately. Two reserved accounts always exist —
//! guest ([`RecordId::GUEST`]) and admin ([`RecordId::ADMIN`]) — and
//! refuse normal mutation and deletion.

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::{params, OptionalExtension};

use cubby_types::RecordId;

use crate::error::StoreError;
use crate::files::StoredFile;
use crate::lazy::Lazy;
use crate::sessions::{default_session_lifetime, Session};
use crate::store::Store;

/// Maximum display-name length, in characters.
pub const NAME_MAX_LENGTH: usize = 32;

/// Exact length of a stored password-verification hash (bcrypt).
pub const PASSWORD_HASH_LENGTH: usize = 60;

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern must compile");
}

fn validate_email(raw: &str) -> Result<String, StoreError> {
    let normalized = raw.trim().to_ascii_lowercase();
    if !EMAIL_RE.is_match(&normalized) {
        return Err(StoreError::InvalidValue {
            field: "email",
            reason: format!("{raw:?} is not a valid email address"),
        });
    }
    Ok(normalized)
}

/// Collection-level account operations.
pub struct Accounts<'a> {
    store: &'a Store,
}

impl<'a> Accounts<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn exists(&self, id: RecordId) -> Result<bool, StoreError> {
        self.store.with_read(|conn| {
            Ok(conn
                .query_row("SELECT id FROM users WHERE id = ?1", [id.to_db()], |_| {
                    Ok(())
                })
                .optional()?
                .is_some())
        })
    }

    pub fn exists_by_name(&self, name: &str) -> Result<bool, StoreError> {
        self.store.with_read(|conn| {
            Ok(conn
                .query_row("SELECT id FROM users WHERE name = ?1", [name], |_| Ok(()))
                .optional()?
                .is_some())
        })
    }

    pub fn exists_by_email(&self, email: &str) -> Result<bool, StoreError> {
        self.store.with_read(|conn| {
            Ok(conn
                .query_row("SELECT id FROM users WHERE email = ?1", [email], |_| Ok(()))
                .optional()?
                .is_some())
        })
    }

    /// Fetches an account by id, loading every field eagerly.
    pub fn get(&self, id: RecordId) -> Result<Account, StoreError> {
        let row = self.store.with_read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT name, email, password_hash, created_at FROM users WHERE id = ?1",
                    [id.to_db()],
                    Account::row_fields,
                )
                .optional()?)
        })?;
        match row {
            Some(fields) => Ok(Account::hydrated(self.store.clone(), id, fields)),
            None => Err(StoreError::not_found("account", "id", id)),
        }
    }

    pub fn get_all(&self) -> Result<Vec<Account>, StoreError> {
        let rows = self.store.with_read(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, email, password_hash, created_at FROM users")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        RecordId::from_db(row.get(0)?),
                        (row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?),
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows
            .into_iter()
            .map(|(id, fields)| Account::hydrated(self.store.clone(), id, fields))
            .collect())
    }

    /// Fetches an account by its unique display name.
    pub fn find_by_name(&self, name: &str) -> Result<Account, StoreError> {
        let row = self.store.with_read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, email, password_hash, created_at FROM users WHERE name = ?1",
                    [name],
                    |row| {
                        Ok((
                            RecordId::from_db(row.get(0)?),
                            (row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?),
                        ))
                    },
                )
                .optional()?)
        })?;
        match row {
            Some((id, fields)) => Ok(Account::hydrated(self.store.clone(), id, fields)),
            None => Err(StoreError::not_found("account", "name", name)),
        }
    }

    /// Verifies a credential by account name and opens a session.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown name and a mismatch
    /// error for a wrong password; the two are distinguishable, so a
    /// transport layer that wants to hide which one happened must
    /// collapse them itself.
    pub fn authorize(
        &self,
        name: &str,
        password: &str,
        lifetime: Option<Duration>,
    ) -> Result<Session, StoreError> {
        self.find_by_name(name)?.login(password, lifetime)
    }

    /// Creates an account.
    ///
    /// Each constraint fails distinctly: name too long, malformed
    /// email, wrong hash length, name taken, email taken.
    pub fn create(
        &self,
        name: &str,
        email: Option<&str>,
        password_hash: Option<&str>,
    ) -> Result<Account, StoreError> {
        let email = email.map(validate_email).transpose()?;

        if name.chars().count() > NAME_MAX_LENGTH {
            return Err(StoreError::WrongLength {
                field: "name",
                units: "characters",
                min: None,
                max: NAME_MAX_LENGTH as u64,
                actual: name.chars().count() as u64,
            });
        }
        if let Some(hash) = password_hash {
            if hash.len() != PASSWORD_HASH_LENGTH {
                return Err(StoreError::WrongHashLength {
                    field: "password",
                    expected: PASSWORD_HASH_LENGTH,
                    actual: hash.len(),
                });
            }
        }
        if self.exists_by_name(name)? {
            return Err(StoreError::AlreadyTaken {
                field: "name",
                value: name.to_string(),
            });
        }
        if let Some(email) = &email {
            if self.exists_by_email(email)? {
                return Err(StoreError::AlreadyTaken {
                    field: "email",
                    value: email.clone(),
                });
            }
        }

        let id = self.store.generate_id();
        let created_at = Utc::now();
        self.store.with_write(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_db(), name, email, password_hash, created_at],
            )?;
            Ok(())
        })?;
        tracing::debug!(%id, name, "account created");

        Ok(Account {
            store: self.store.clone(),
            id,
            name: Lazy::known(name.to_string()),
            email: Lazy::known(email),
            password_hash: Lazy::known(password_hash.map(str::to_string)),
            created_at: Lazy::known(created_at),
        })
    }
}

/// One account row, lazily loaded and write-through.
pub struct Account {
    store: Store,
    id: RecordId,
    name: Lazy<String>,
    email: Lazy<Option<String>>,
    password_hash: Lazy<Option<String>>,
    created_at: Lazy<DateTime<Utc>>,
}

type AccountFields = (String, Option<String>, Option<String>, DateTime<Utc>);

impl Account {
    fn row_fields(row: &rusqlite::Row<'_>) -> Result<AccountFields, rusqlite::Error> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    fn hydrated(store: Store, id: RecordId, fields: AccountFields) -> Self {
        let (name, email, password_hash, created_at) = fields;
        Self {
            store,
            id,
            name: Lazy::known(name),
            email: Lazy::known(email),
            password_hash: Lazy::known(password_hash),
            created_at: Lazy::known(created_at),
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Whether this is one of the reserved system accounts.
    pub fn is_critical(&self) -> bool {
        self.id.is_reserved()
    }

    fn load<T: rusqlite::types::FromSql>(
        store: &Store,
        id: RecordId,
        sql: &str,
    ) -> Result<T, StoreError> {
        store.with_read(|conn| {
            conn.query_row(sql, [id.to_db()], |row| row.get(0))
                .optional()?
                .ok_or_else(|| StoreError::not_found("account", "id", id))
        })
    }

    fn ensure_mutable(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.is_critical() {
            return Err(StoreError::Permission { operation });
        }
        Ok(())
    }

    pub fn name(&mut self) -> Result<String, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.name
            .get_or_load(|| Self::load(&store, id, "SELECT name FROM users WHERE id = ?1"))
    }

    pub fn set_name(&mut self, new_name: &str) -> Result<(), StoreError> {
        self.ensure_mutable("changing reserved account properties")?;
        if new_name.chars().count() > NAME_MAX_LENGTH {
            return Err(StoreError::WrongLength {
                field: "name",
                units: "characters",
                min: None,
                max: NAME_MAX_LENGTH as u64,
                actual: new_name.chars().count() as u64,
            });
        }
        if self.store.accounts().exists_by_name(new_name)? {
            return Err(StoreError::AlreadyTaken {
                field: "name",
                value: new_name.to_string(),
            });
        }
        let id = self.id;
        self.store.with_write(|conn| {
            conn.execute(
                "UPDATE users SET name = ?1 WHERE id = ?2",
                params![new_name, id.to_db()],
            )?;
            Ok(())
        })?;
        self.name.set(new_name.to_string());
        Ok(())
    }

    pub fn email(&mut self) -> Result<Option<String>, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.email
            .get_or_load(|| Self::load(&store, id, "SELECT email FROM users WHERE id = ?1"))
    }

    pub fn set_email(&mut self, new_email: Option<&str>) -> Result<(), StoreError> {
        self.ensure_mutable("changing reserved account properties")?;
        let new_email = new_email.map(validate_email).transpose()?;
        if let Some(email) = &new_email {
            if self.store.accounts().exists_by_email(email)? {
                return Err(StoreError::AlreadyTaken {
                    field: "email",
                    value: email.clone(),
                });
            }
        }
        let id = self.id;
        self.store.with_write(|conn| {
            conn.execute(
                "UPDATE users SET email = ?1 WHERE id = ?2",
                params![new_email, id.to_db()],
            )?;
            Ok(())
        })?;
        self.email.set(new_email);
        Ok(())
    }

    pub fn password_hash(&mut self) -> Result<Option<String>, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.password_hash.get_or_load(|| {
            Self::load(&store, id, "SELECT password_hash FROM users WHERE id = ?1")
        })
    }

    pub fn set_password_hash(&mut self, new_hash: Option<&str>) -> Result<(), StoreError> {
        self.ensure_mutable("changing reserved account properties")?;
        if let Some(hash) = new_hash {
            if hash.len() != PASSWORD_HASH_LENGTH {
                return Err(StoreError::WrongHashLength {
                    field: "password",
                    expected: PASSWORD_HASH_LENGTH,
                    actual: hash.len(),
                });
            }
        }
        let id = self.id;
        self.store.with_write(|conn| {
            conn.execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                params![new_hash, id.to_db()],
            )?;
            Ok(())
        })?;
        self.password_hash.set(new_hash.map(str::to_string));
        Ok(())
    }

    pub fn created_at(&mut self) -> Result<DateTime<Utc>, StoreError> {
        let (store, id) = (self.store.clone(), self.id);
        self.created_at
            .get_or_load(|| Self::load(&store, id, "SELECT created_at FROM users WHERE id = ?1"))
    }

    /// Sessions owned by this account.
    pub fn sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.store.sessions().owned_by(self.id)
    }

    /// Files uploaded by this account.
    pub fn files(&self) -> Result<Vec<StoredFile>, StoreError> {
        self.store.files().uploaded_by(self.id)
    }

    /// Checks a plaintext credential against the stored hash.
    ///
    /// The admin account additionally accepts the configured
    /// out-of-band admin password, so an operator can always get in
    /// even with no hash on the row.
    pub fn verify_password(&mut self, password: &str) -> Result<bool, StoreError> {
        if self.id == RecordId::ADMIN {
            if let Some(admin_password) = &self.store.config().admin_password {
                if password == admin_password {
                    return Ok(true);
                }
            }
        }
        match self.password_hash()? {
            Some(hash) => Ok(bcrypt::verify(password, &hash).unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// Verifies the credential and opens a session for this account.
    ///
    /// `lifetime` of `None` applies the default session lifetime; a
    /// non-expiring session has to be created explicitly through
    /// [`Sessions::create`](crate::Sessions::create).
    ///
    /// # Errors
    ///
    /// Returns a mismatch error when verification fails.
    pub fn login(
        &mut self,
        password: &str,
        lifetime: Option<Duration>,
    ) -> Result<Session, StoreError> {
        if !self.verify_password(password)? {
            return Err(StoreError::Mismatch {
                field: "password",
                detail: "credential verification failed".to_string(),
            });
        }
        let lifetime = lifetime.unwrap_or_else(default_session_lifetime);
        self.store.sessions().create(self.id, Some(lifetime))
    }

    /// Deletes this account after cascading through everything it owns.
    ///
    /// Each dependent session and file is deleted as an independent
    /// operation with its own lock acquisition; there is no enclosing
    /// transaction, and concurrent callers may interleave.
    ///
    /// # Errors
    ///
    /// Returns a permission error for the reserved accounts.
    pub fn delete(self) -> Result<(), StoreError> {
        if self.is_critical() {
            return Err(StoreError::Permission {
                operation: "deletion of a critical account",
            });
        }

        for session in self.sessions()? {
            session.delete()?;
        }
        for file in self.files()? {
            file.delete()?;
        }

        let id = self.id;
        self.store.with_write(|conn| {
            conn.execute("DELETE FROM users WHERE id = ?1", [id.to_db()])?;
            Ok(())
        })?;
        tracing::debug!(%id, "account deleted");
        Ok(())
    }
}
