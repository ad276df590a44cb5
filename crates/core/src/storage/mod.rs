//! SQLite storage layer for Huddle

mod migrations;
mod parse;
mod replicas;
mod snapshots;
mod traits;
mod updates;

use rusqlite::Connection;
use std::path::Path;
use tracing::instrument;

use crate::clock::ReplicaId;
use crate::document::{DocumentState, Update};
use crate::error::Result;
use crate::room::RoomId;

pub use replicas::ReplicaStore;
pub use snapshots::SnapshotStore;
pub use traits::{DocumentRepository, LoadedRoom};
pub use updates::UpdateStore;

/// Main database handle
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create database at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open in-memory database (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initialize database schema via migrations
    fn init(&self) -> Result<()> {
        migrations::run_migrations(&self.conn)?;
        Ok(())
    }

    /// Get current schema version
    pub fn schema_version(&self) -> u32 {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap_or(0)
    }

    pub fn updates(&self) -> UpdateStore<'_> {
        UpdateStore::new(&self.conn)
    }

    pub fn snapshots(&self) -> SnapshotStore<'_> {
        SnapshotStore::new(&self.conn)
    }

    pub fn replicas(&self) -> ReplicaStore<'_> {
        ReplicaStore::new(&self.conn)
    }
}

impl DocumentRepository for Database {
    fn start_session(&self, room: &RoomId) -> Result<ReplicaId> {
        self.replicas().start_session(room)
    }

    fn append_update(&self, room: &RoomId, update: &Update) -> Result<bool> {
        self.updates().append(room, update)
    }

    fn load_updates(&self, room: &RoomId) -> Result<Vec<Update>> {
        self.updates().load(room)
    }

    fn save_snapshot(&self, room: &RoomId, state: &DocumentState) -> Result<()> {
        self.snapshots().save(room, state)
    }

    fn latest_snapshot(&self, room: &RoomId) -> Result<Option<DocumentState>> {
        self.snapshots().latest(room)
    }
}
