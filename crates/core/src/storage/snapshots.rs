//! Document snapshot storage

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use crate::document::DocumentState;
use crate::error::Result;
use crate::room::RoomId;

/// Latest full document state per room
pub struct SnapshotStore<'a> {
    conn: &'a Connection,
}

impl<'a> SnapshotStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Store a snapshot, replacing older ones for the room
    #[instrument(skip(self, state), fields(room = %room))]
    pub fn save(&self, room: &RoomId, state: &DocumentState) -> Result<()> {
        let payload = serde_json::to_vec(state)?;
        let version = state.version().total();

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO snapshots (room, version, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![room.as_str(), version as i64, payload, Utc::now().to_rfc3339()],
        )?;
        let latest = tx.last_insert_rowid();
        let pruned = tx.execute(
            "DELETE FROM snapshots WHERE room = ?1 AND id < ?2",
            params![room.as_str(), latest],
        )?;
        tx.commit()?;

        debug!(version, pruned, "Snapshot saved");
        Ok(())
    }

    pub fn latest(&self, room: &RoomId) -> Result<Option<DocumentState>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM snapshots WHERE room = ?1 ORDER BY id DESC LIMIT 1",
                [room.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
