//! Update log storage

use rusqlite::{params, Connection};
use tracing::{instrument, warn};

use crate::document::{Update, UpdateId};
use crate::error::Result;
use crate::room::RoomId;

/// Append-only update log, keyed by room
pub struct UpdateStore<'a> {
    conn: &'a Connection,
}

impl<'a> UpdateStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append an update.
    ///
    /// Returns `false` if the update was already stored.
    #[instrument(skip(self, update), fields(room = %room, update = %update.id))]
    pub fn append(&self, room: &RoomId, update: &Update) -> Result<bool> {
        let payload = update.encode()?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO updates (room, replica_id, seq, payload, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                room.as_str(),
                update.id.replica.to_string(),
                update.id.seq as i64,
                payload,
                update.committed_at.to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// All stored updates for a room, in the order they were appended.
    ///
    /// Rows that fail to decode are skipped.
    #[instrument(skip(self), fields(room = %room))]
    pub fn load(&self, room: &RoomId) -> Result<Vec<Update>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, payload FROM updates WHERE room = ?1 ORDER BY id ASC")?;

        let rows = stmt.query_map([room.as_str()], |row| {
            let id: i64 = row.get(0)?;
            let payload: Vec<u8> = row.get(1)?;
            Ok((id, payload))
        })?;

        let mut updates = Vec::new();
        for row in rows {
            let (id, payload) = row?;
            match Update::decode(&payload) {
                Ok(update) => updates.push(update),
                Err(e) => warn!(row = id, error = %e, "Skipping undecodable update"),
            }
        }
        Ok(updates)
    }

    pub fn contains(&self, room: &RoomId, id: &UpdateId) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM updates WHERE room = ?1 AND replica_id = ?2 AND seq = ?3",
            params![room.as_str(), id.replica.to_string(), id.seq as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn count(&self, room: &RoomId) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM updates WHERE room = ?1",
            [room.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
