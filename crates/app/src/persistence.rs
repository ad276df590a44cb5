//! Local persistence
//!
//! Restores a room from storage at startup, then appends every committed
//! update (local or remote) from a background writer. Storage failures never
//! reach the code that committed the update: they are logged and retried
//! until the store takes the write.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use huddle_core::{
    lock, Committed, DocumentRepository, DocumentState, Replica, RoomId, SharedReplica,
    TimeSource, Update,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AppResult;

/// Backoff delays for failed writes: 1s, 2s, 5s, 10s, 30s (capped)
const RETRY_DELAYS_MS: &[u64] = &[1000, 2000, 5000, 10000, 30000];

#[derive(Debug, Clone)]
pub struct PersistenceOptions {
    /// Persisted updates between snapshots; 0 disables snapshots
    pub snapshot_every: u64,
    pub retry_delays_ms: &'static [u64],
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            snapshot_every: huddle_core::config::DEFAULT_SNAPSHOT_EVERY,
            retry_delays_ms: RETRY_DELAYS_MS,
        }
    }
}

enum WriterCommand {
    Append(Arc<Update>),
    Flush(oneshot::Sender<()>),
    Stop,
}

/// Handle to the background writer
pub struct Persistence {
    tx: mpsc::UnboundedSender<WriterCommand>,
    ready: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl Persistence {
    /// Load `room` from `repo`, rebuild its replica and start the writer.
    ///
    /// The replica runs under the fresh id of a new session, so sequence
    /// numbers are never reused even if the previous run lost its last
    /// commit. It is returned with the writer already registered as a commit
    /// sink, so nothing committed afterwards can be missed.
    pub async fn open<R>(
        repo: R,
        room: RoomId,
        time: Arc<dyn TimeSource>,
        options: PersistenceOptions,
    ) -> AppResult<(SharedReplica, Self)>
    where
        R: DocumentRepository + Send + 'static,
    {
        let load_room = room.clone();
        let (repo, loaded) = tokio::task::spawn_blocking(move || {
            let loaded = repo.load_room(&load_room);
            (repo, loaded)
        })
        .await?;
        let loaded = loaded?;

        let replica = Replica::restore(
            loaded.replica_id,
            room.clone(),
            loaded.snapshot.unwrap_or_default(),
            loaded.updates,
            time,
        );
        let shadow = replica.state().clone();
        let replica: SharedReplica = Arc::new(Mutex::new(replica));

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = tx.clone();
        lock(&replica).add_sink(move |committed: &Committed| {
            sink.send(WriterCommand::Append(committed.update.clone()))
                .is_ok()
        });

        let (ready_tx, ready) = watch::channel(false);
        let task = tokio::task::spawn_blocking(move || {
            writer_loop(repo, room, rx, shadow, options, ready_tx)
        });

        Ok((replica, Self { tx, ready, task }))
    }

    /// Becomes `true` once the writer is accepting updates
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }

    /// Wait until everything committed so far has been written
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Write what is queued, then stop the writer
    pub async fn close(self) -> AppResult<()> {
        let _ = self.tx.send(WriterCommand::Stop);
        self.task.await?;
        Ok(())
    }
}

fn writer_loop<R: DocumentRepository>(
    repo: R,
    room: RoomId,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    mut shadow: DocumentState,
    options: PersistenceOptions,
    ready: watch::Sender<bool>,
) {
    let _ = ready.send(true);
    info!(room = %room, "Persistence writer started");

    let mut since_snapshot = 0u64;

    while let Some(command) = rx.blocking_recv() {
        match command {
            WriterCommand::Append(update) => {
                let stored = retry(&options, "append update", || {
                    repo.append_update(&room, &update)
                });
                if stored {
                    debug!(update = %update.id, "Update persisted");
                }

                // Fed in commit order, so dependencies are always present
                shadow.receive(Update::clone(&update));
                since_snapshot += 1;

                if options.snapshot_every > 0 && since_snapshot >= options.snapshot_every {
                    retry(&options, "save snapshot", || repo.save_snapshot(&room, &shadow));
                    info!(
                        room = %room,
                        updates = shadow.version().total(),
                        "Snapshot saved"
                    );
                    since_snapshot = 0;
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
            WriterCommand::Stop => break,
        }
    }

    let _ = ready.send(false);
    info!(room = %room, "Persistence writer stopped");
}

/// Run `op` until it succeeds, sleeping between attempts
fn retry<T>(
    options: &PersistenceOptions,
    what: &str,
    mut op: impl FnMut() -> huddle_core::Result<T>,
) -> T {
    let mut attempt = 0usize;
    loop {
        match op() {
            Ok(value) => return value,
            Err(e) => {
                let last = options.retry_delays_ms.len().saturating_sub(1);
                let delay_ms = options
                    .retry_delays_ms
                    .get(attempt.min(last))
                    .copied()
                    .unwrap_or(1000);
                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    delay_ms = delay_ms,
                    "Failed to {}, retrying",
                    what
                );
                std::thread::sleep(Duration::from_millis(delay_ms));
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{
        Database, Error, LoadedRoom, ReplicaId, SystemClock, TimerState,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn options(snapshot_every: u64) -> PersistenceOptions {
        PersistenceOptions {
            snapshot_every,
            retry_delays_ms: &[1, 1, 1],
        }
    }

    async fn open_file(
        dir: &TempDir,
        room: &RoomId,
        snapshot_every: u64,
    ) -> (SharedReplica, Persistence) {
        let db = Database::open(dir.path().join("huddle.db")).unwrap();
        Persistence::open(db, room.clone(), Arc::new(SystemClock), options(snapshot_every))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_offline_commits_survive_restart() {
        let dir = TempDir::new().unwrap();
        let room = RoomId::from("team/standup");

        let (replica, persistence) = open_file(&dir, &room, 0).await;
        let id = lock(&replica).id();
        {
            let mut r = lock(&replica);
            r.add("Ana").unwrap();
            r.add("Bo").unwrap();
            r.advance().unwrap();
        }
        persistence.flush().await;
        persistence.close().await.unwrap();
        drop(replica);

        let (replica, persistence) = open_file(&dir, &room, 0).await;
        let r = lock(&replica);
        assert_ne!(r.id(), id);

        let view = r.project();
        assert_eq!(view.people.len(), 2);
        assert_eq!(view.in_progress.map(|s| s.name), Some("Ana".to_string()));
        assert_eq!(view.on_deck, vec!["Bo".to_string()]);
        assert_eq!(view.timer_state, TimerState::Playing);
        drop(r);
        persistence.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_runs_under_new_replica_id() {
        let dir = TempDir::new().unwrap();
        let room = RoomId::from("standup");

        let (replica, persistence) = open_file(&dir, &room, 0).await;
        lock(&replica).add("Ana").unwrap();
        let first = lock(&replica).id();
        persistence.close().await.unwrap();

        let (replica, persistence) = open_file(&dir, &room, 0).await;
        lock(&replica).add("Bo").unwrap();
        let second = lock(&replica).id();
        persistence.close().await.unwrap();

        let db = Database::open(dir.path().join("huddle.db")).unwrap();
        let ids: Vec<(ReplicaId, u64)> = db
            .load_updates(&room)
            .unwrap()
            .iter()
            .map(|u| (u.id.replica, u.id.seq))
            .collect();
        assert_eq!(ids, vec![(first, 1), (second, 1)]);
        assert_eq!(db.replicas().sessions(&room).unwrap(), vec![first, second]);
        drop(replica);
    }

    #[tokio::test]
    async fn test_snapshot_written_periodically() {
        let dir = TempDir::new().unwrap();
        let room = RoomId::from("standup");

        let (replica, persistence) = open_file(&dir, &room, 2).await;
        {
            let mut r = lock(&replica);
            r.add("Ana").unwrap();
            r.add("Bo").unwrap();
            r.add("Cy").unwrap();
        }
        persistence.flush().await;

        let db = Database::open(dir.path().join("huddle.db")).unwrap();
        let snapshot = db.latest_snapshot(&room).unwrap().unwrap();
        assert_eq!(snapshot.version().total(), 2);
        assert_eq!(db.load_updates(&room).unwrap().len(), 3);

        persistence.close().await.unwrap();

        // Snapshot plus the remaining log entry
        let (replica, persistence) = open_file(&dir, &room, 2).await;
        assert_eq!(lock(&replica).project().people.len(), 3);
        persistence.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_signal() {
        let room = RoomId::from("standup");
        let db = Database::open_in_memory().unwrap();
        let (_replica, persistence) =
            Persistence::open(db, room, Arc::new(SystemClock), options(0))
                .await
                .unwrap();

        let mut ready = persistence.ready();
        ready.wait_for(|ready| *ready).await.unwrap();
        persistence.close().await.unwrap();
    }

    /// Fails the first `failures` appends
    struct FlakyRepo {
        db: Arc<Mutex<Database>>,
        failures: Arc<AtomicUsize>,
    }

    impl DocumentRepository for FlakyRepo {
        fn start_session(&self, room: &RoomId) -> huddle_core::Result<ReplicaId> {
            self.db.lock().unwrap().start_session(room)
        }

        fn append_update(&self, room: &RoomId, update: &Update) -> huddle_core::Result<bool> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(Error::InvalidOperation("disk unavailable".into()));
            }
            self.db.lock().unwrap().append_update(room, update)
        }

        fn load_updates(&self, room: &RoomId) -> huddle_core::Result<Vec<Update>> {
            self.db.lock().unwrap().load_updates(room)
        }

        fn save_snapshot(&self, room: &RoomId, state: &DocumentState) -> huddle_core::Result<()> {
            self.db.lock().unwrap().save_snapshot(room, state)
        }

        fn latest_snapshot(&self, room: &RoomId) -> huddle_core::Result<Option<DocumentState>> {
            self.db.lock().unwrap().latest_snapshot(room)
        }
    }

    #[tokio::test]
    async fn test_failed_writes_are_retried() {
        let room = RoomId::from("standup");
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let failures = Arc::new(AtomicUsize::new(2));
        let repo = FlakyRepo {
            db: db.clone(),
            failures: failures.clone(),
        };

        let (replica, persistence) =
            Persistence::open(repo, room.clone(), Arc::new(SystemClock), options(0))
                .await
                .unwrap();

        // The caller never sees the storage failure
        assert!(lock(&replica).add("Ana").unwrap());
        persistence.flush().await;

        assert_eq!(failures.load(Ordering::SeqCst), 0);
        let LoadedRoom { updates, .. } = db.lock().unwrap().load_room(&room).unwrap();
        assert_eq!(updates.len(), 1);

        persistence.close().await.unwrap();
    }
}
