//! Application state management

use std::path::PathBuf;
use std::sync::Arc;

use huddle_core::{lock, Config, Database, ProjectionLayer, RoomId, SharedReplica, SystemClock};
use tracing::info;

use crate::error::AppResult;
use crate::persistence::{Persistence, PersistenceOptions};

const DB_FILE: &str = "huddle.db";

/// Main application state
pub struct AppState {
    pub config: Config,
    pub room: RoomId,
    pub replica: SharedReplica,
    pub projection: Arc<ProjectionLayer>,
    pub persistence: Persistence,
    db_path: PathBuf,
}

impl AppState {
    /// Restore the configured room from disk and attach the projection
    pub async fn open(config: Config) -> AppResult<Self> {
        let room = RoomId::from_path(&config.room);
        let db_path = config.data_dir()?.join(DB_FILE);

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path)?;
        let options = PersistenceOptions {
            snapshot_every: config.snapshot_every,
            ..PersistenceOptions::default()
        };
        let (replica, persistence) =
            Persistence::open(db, room.clone(), Arc::new(SystemClock), options).await?;

        let projection = ProjectionLayer::attach(&mut lock(&replica));

        info!(room = %room, path = %db_path.display(), "Room opened");

        Ok(Self {
            config,
            room,
            replica,
            projection,
            persistence,
            db_path,
        })
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Flush pending writes and stop the writer
    pub async fn close(self) -> AppResult<()> {
        self.persistence.flush().await;
        self.persistence.close().await
    }
}
