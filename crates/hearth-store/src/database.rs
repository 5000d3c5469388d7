//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation. It also owns the
//! [`ChangeBus`] on which every successful write through the [`Backend`]
//! implementation is announced.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use directories::ProjectDirs;
use rusqlite::Connection;
use uuid::Uuid;

use hearth_shared::{ContainerId, MessageId, UserId};

use crate::backend::{Backend, ChangeBus, ChangeEvent, ChangeFilter, Subscription};
use crate::error::{Result, StoreError};
use crate::migrations;
use crate::models::{Membership, MessagePatch, MessageQuery, MessageRow, NewMessage, Profile};

/// SQLite-backed store.
pub struct Database {
    conn: Mutex<Connection>,
    bus: ChangeBus,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/hearth/hearth.db`
    /// - macOS:   `~/Library/Application Support/app.hearth.hearth/hearth.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\hearth\hearth\data\hearth.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("app", "hearth", "hearth").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("hearth.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            bus: ChangeBus::default(),
        })
    }

    /// Lock the underlying connection.
    ///
    /// The guard must be released before calling another `Database` method.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The bus on which change events are published.
    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn().path().map(PathBuf::from)
    }
}

#[async_trait]
impl Backend for Database {
    async fn select(&self, query: &MessageQuery) -> Result<Vec<MessageRow>> {
        self.get_messages_for_container(query)
    }

    async fn select_by_ids(&self, ids: &[MessageId]) -> Result<Vec<MessageRow>> {
        self.get_messages_by_ids(ids)
    }

    async fn insert(&self, message: &NewMessage) -> Result<MessageRow> {
        let row = self.insert_message(message)?;
        self.bus.publish(ChangeEvent::Insert(row.clone()));
        Ok(row)
    }

    async fn update(&self, id: &MessageId, patch: &MessagePatch) -> Result<MessageRow> {
        let row = self.update_message(id, patch)?;
        self.bus.publish(ChangeEvent::Update(row.clone()));
        Ok(row)
    }

    async fn delete(&self, id: &MessageId) -> Result<()> {
        let existing = self.get_message_by_id(id)?;
        if self.delete_message(id)? {
            self.bus.publish(ChangeEvent::Delete {
                id: id.clone(),
                container_id: existing.container_id,
            });
        }
        Ok(())
    }

    async fn select_profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>> {
        self.get_profiles(ids)
    }

    async fn select_memberships(&self, user: UserId) -> Result<Vec<Membership>> {
        self.list_memberships(user)
    }

    async fn select_last_messages(&self, containers: &[ContainerId]) -> Result<Vec<MessageRow>> {
        let mut rows = Vec::with_capacity(containers.len());
        for container in containers {
            if let Some(row) = self.last_message_for_container(*container)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn count_unread(
        &self,
        container: ContainerId,
        user: UserId,
        since: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        self.count_unread_since(container, user, since)
    }

    async fn mark_read(
        &self,
        container: ContainerId,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.set_last_read(container, user, at)? {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription> {
        Ok(self.bus.subscribe(filter))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Timestamps are stored with a fixed precision so text order is time order.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}
