//! Versioned schema migration runner.
//!
//! Upgrade units are embedded at compile time and applied in ascending
//! version order at startup, under one writer-lock acquisition taken by
//! [`Store::open`](crate::Store::open). A unit is either a raw SQL
//! script (with optional programmatic pre/post hooks that run
//! immediately around it) or a programmatic step with full access to
//! the connection.
//!
//! Scripts deliberately run without an enclosing transaction: SQLite
//! commits statement by statement, so a script that fails partway
//! leaves its earlier statements applied and the watermark at the last
//! cleanly completed unit. A failed migration is a fatal startup
//! condition; the host must not serve traffic over a half-upgraded
//! schema.

use chrono::Utc;
use rusqlite::{params, Connection};
use thiserror::Error;

use cubby_types::RecordId;

/// A programmatic migration hook or step.
pub type StepFn = fn(&Connection) -> Result<(), rusqlite::Error>;

/// The two kinds of upgrade unit.
pub enum MigrationKind {
    /// A raw schema script, with optional hooks run immediately before
    /// and after it (outside any script statement).
    Script {
        sql: &'static str,
        pre: Option<StepFn>,
        post: Option<StepFn>,
    },
    /// An imperative upgrade routine.
    Step(StepFn),
}

/// A single versioned upgrade unit.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub kind: MigrationKind,
}

/// All migrations in ascending version order. New units are appended here.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 0,
        name: "000__init",
        kind: MigrationKind::Script {
            sql: include_str!("migrations/000__init.sql"),
            pre: None,
            post: None,
        },
    },
    Migration {
        version: 1,
        name: "001__seed_reserved",
        kind: MigrationKind::Step(seed_reserved),
    },
];

/// Inserts the reserved rows that must always exist: the guest and
/// admin accounts and the permanent guest session.
fn seed_reserved(conn: &Connection) -> Result<(), rusqlite::Error> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO users (id, name, email, password_hash, created_at)
         VALUES (?1, 'guest', NULL, NULL, ?3), (?2, 'admin', NULL, NULL, ?3)",
        params![RecordId::GUEST.to_db(), RecordId::ADMIN.to_db(), now],
    )?;
    conn.execute(
        "INSERT INTO sessions (id, owner_id, created_at, expires_at)
         VALUES (?1, ?1, ?2, NULL)",
        params![RecordId::GUEST.to_db(), now],
    )?;
    Ok(())
}

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A statement within a unit failed.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    /// A pre or post hook of a script unit failed.
    #[error("migration '{name}' {hook} hook failed: {source}")]
    HookFailed {
        name: String,
        hook: &'static str,
        source: rusqlite::Error,
    },
}

/// Applies every unit whose version is strictly greater than
/// `last_applied`, in ascending version order.
///
/// Returns the highest version encountered, whether or not it was
/// applied — skipped units still advance the watermark. With no units
/// at all, returns `last_applied` unchanged.
///
/// # Errors
///
/// Returns `MigrationError` as soon as one unit fails; units already
/// completed in this run stay applied and the caller must not advance
/// the watermark past the last clean one.
pub fn run_migrations(conn: &Connection, last_applied: i64) -> Result<i64, MigrationError> {
    run_units(conn, MIGRATIONS, last_applied)
}

pub(crate) fn run_units(
    conn: &Connection,
    units: &[Migration],
    last_applied: i64,
) -> Result<i64, MigrationError> {
    tracing::debug!(last_applied, "applying migrations");

    let mut latest = last_applied;
    for unit in units {
        latest = latest.max(unit.version);
        if unit.version <= last_applied {
            tracing::debug!(migration = unit.name, "migration already applied, skipping");
            continue;
        }

        tracing::info!(migration = unit.name, "applying migration");
        match &unit.kind {
            MigrationKind::Step(step) => {
                step(conn).map_err(|source| MigrationError::ExecutionFailed {
                    name: unit.name.to_string(),
                    source,
                })?;
            }
            MigrationKind::Script { sql, pre, post } => {
                if let Some(pre) = pre {
                    tracing::debug!(migration = unit.name, "running pre migration hook");
                    pre(conn).map_err(|source| MigrationError::HookFailed {
                        name: unit.name.to_string(),
                        hook: "pre",
                        source,
                    })?;
                }

                conn.execute_batch(sql)
                    .map_err(|source| MigrationError::ExecutionFailed {
                        name: unit.name.to_string(),
                        source,
                    })?;

                if let Some(post) = post {
                    tracing::debug!(migration = unit.name, "running post migration hook");
                    post(conn).map_err(|source| MigrationError::HookFailed {
                        name: unit.name.to_string(),
                        hook: "post",
                        source,
                    })?;
                }
            }
        }
    }

    tracing::info!(latest, "finished migrations");
    Ok(latest)
}
