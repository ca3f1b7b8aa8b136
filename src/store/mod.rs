//! Persistent stores.
//!
//! Two narrow interfaces sit between the relay and the database:
//!
//! - [`IdentityStore`]: accounts, friends lists, last-seen stamps and push
//!   subscriptions.
//! - [`MessageStore`]: the pending partition (messages waiting for an
//!   offline recipient, time-boxed) and the archive partition (permanent copy,
//!   never read for routing).
//!
//! [`SqliteStore`] implements both over a single SQLite connection guarded by
//! a mutex. Each method is one statement, so single-record operations are
//! atomic; nothing spans both stores in one transaction.

mod identity;
mod messages;
pub mod schema;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::{RelayError, Result};
use crate::protocol::ChatMessage;

/// An account record.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub username: String,
    pub password_hash: String,
    pub display_name: String,
    pub friends: BTreeSet<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Public view of another account (no credentials).
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub username: String,
    pub display_name: String,
    pub last_seen: Option<DateTime<Utc>>,
}

/// A message waiting in the pending partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    /// Row id; monotonically increasing, so ordering by it is insertion order.
    pub id: i64,
    pub message: ChatMessage,
}

pub trait IdentityStore: Send + Sync {
    fn find_by_username(&self, username: &str) -> Result<Option<Identity>>;

    /// Fails with `Conflict` if the username is taken.
    fn create(&self, username: &str, password_hash: &str, display_name: &str) -> Result<Identity>;

    fn update_display_name(&self, username: &str, display_name: &str) -> Result<()>;

    /// Idempotent. Fails with `RecipientUnknown` if `friend` has no account.
    fn add_friend(&self, username: &str, friend: &str) -> Result<Profile>;

    /// Returns whether an entry was removed.
    fn remove_friend(&self, username: &str, friend: &str) -> Result<bool>;

    /// Profiles of everyone on `username`'s friends list.
    fn friends_of(&self, username: &str) -> Result<Vec<Profile>>;

    fn touch_last_seen(&self, username: &str, at: DateTime<Utc>) -> Result<()>;

    fn set_push_endpoint(&self, username: &str, endpoint: &str) -> Result<()>;

    fn push_endpoint(&self, username: &str) -> Result<Option<String>>;
}

pub trait MessageStore: Send + Sync {
    /// Append to the archive partition.
    fn archive(&self, message: &ChatMessage) -> Result<()>;

    /// Append to the pending partition, returning the entry id.
    fn enqueue_pending(&self, message: &ChatMessage) -> Result<i64>;

    /// Pending entries for `recipient` created at or after `not_before`, in
    /// insertion order.
    fn pending_for(&self, recipient: &str, not_before: DateTime<Utc>) -> Result<Vec<PendingEntry>>;

    fn delete_pending(&self, id: i64) -> Result<bool>;

    /// Delete pending entries created before `cutoff`. Returns how many.
    fn purge_pending_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn pending_count(&self) -> Result<usize>;

    fn archive_count(&self) -> Result<usize>;
}

/// SQLite-backed implementation of both stores.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database.
    ///
    /// `":memory:"` gives a private in-memory database (tests, ephemeral runs).
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(schema::CREATE_TABLES)?;

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![schema::SCHEMA_VERSION],
                )?;
                tracing::info!(version = schema::SCHEMA_VERSION, "Database schema created");
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(RelayError::StoreUnavailable(format!(
                    "database schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(v) => {
                tracing::debug!(version = v, "Database schema up to date");
            }
        }

        Ok(())
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
