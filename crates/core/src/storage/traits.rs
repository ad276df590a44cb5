//! Storage repository traits
//!
//! The persistence writer talks to storage through this trait so it can be
//! exercised against failing backends in tests.

use crate::clock::ReplicaId;
use crate::document::{DocumentState, Update};
use crate::error::Result;
use crate::room::RoomId;

/// Everything persisted for one room, plus the id of the session that
/// loaded it
#[derive(Debug, Clone)]
pub struct LoadedRoom {
    pub replica_id: ReplicaId,
    pub snapshot: Option<DocumentState>,
    /// Full update log in append order
    pub updates: Vec<Update>,
}

/// Room document repository operations
pub trait DocumentRepository {
    /// Record a new session of the room and return its fresh replica id
    fn start_session(&self, room: &RoomId) -> Result<ReplicaId>;

    /// Append a committed update; `false` if it was already stored
    fn append_update(&self, room: &RoomId, update: &Update) -> Result<bool>;

    fn load_updates(&self, room: &RoomId) -> Result<Vec<Update>>;

    fn save_snapshot(&self, room: &RoomId, state: &DocumentState) -> Result<()>;

    fn latest_snapshot(&self, room: &RoomId) -> Result<Option<DocumentState>>;

    /// Start a session, then load the latest snapshot and update log
    fn load_room(&self, room: &RoomId) -> Result<LoadedRoom> {
        Ok(LoadedRoom {
            replica_id: self.start_session(room)?,
            snapshot: self.latest_snapshot(room)?,
            updates: self.load_updates(room)?,
        })
    }
}
