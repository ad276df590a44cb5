//! Replica session storage
//!
//! Every time a room is opened it runs under a freshly minted replica id.
//! Update sequence numbers restart at 1 for each id, so an update lost in a
//! crash can never be confused with a different one committed after restart.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{info, instrument};
use uuid::Uuid;

use super::parse::parse_uuid;
use crate::clock::ReplicaId;
use crate::error::Result;
use crate::room::RoomId;

pub struct ReplicaStore<'a> {
    conn: &'a Connection,
}

impl<'a> ReplicaStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Mint and record the replica id for a new session of the room
    #[instrument(skip(self), fields(room = %room))]
    pub fn start_session(&self, room: &RoomId) -> Result<ReplicaId> {
        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO replica_sessions (room, replica_id, started_at) VALUES (?1, ?2, ?3)",
            params![room.as_str(), id.to_string(), Utc::now().to_rfc3339()],
        )?;
        info!(replica = %id, "Started replica session");
        Ok(id)
    }

    /// Replica ids the room has run under, oldest first
    pub fn sessions(&self, room: &RoomId) -> Result<Vec<ReplicaId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT replica_id FROM replica_sessions WHERE room = ?1 ORDER BY id")?;

        let rows = stmt.query_map([room.as_str()], |row| {
            let id: String = row.get(0)?;
            parse_uuid(&id)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use crate::room::RoomId;
    use crate::storage::Database;
    use tempfile::tempdir;

    #[test]
    fn test_each_session_gets_a_new_replica_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let room = RoomId::from_path("standup");

        let first = {
            let db = Database::open(&path).unwrap();
            assert!(db.replicas().sessions(&room).unwrap().is_empty());
            db.replicas().start_session(&room).unwrap()
        };

        let db = Database::open(&path).unwrap();
        let second = db.replicas().start_session(&room).unwrap();
        assert_ne!(second, first);
        assert_eq!(db.replicas().sessions(&room).unwrap(), vec![first, second]);

        db.replicas()
            .start_session(&RoomId::from_path("retro"))
            .unwrap();
        assert_eq!(db.replicas().sessions(&room).unwrap().len(), 2);
    }
}
