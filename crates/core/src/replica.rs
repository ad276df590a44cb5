//! A running replica of a room document
//!
//! The replica is the single owner of document state. Local intents go
//! through [`Replica::transact`]; peer updates go through
//! [`Replica::apply_remote`]. Both paths end in the same place: the update is
//! appended to the in-memory log, handed to every commit sink (persistence,
//! sync), and announced to observers.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::clock::{ReplicaId, TimeSource};
use crate::document::{Applied, Document, DocumentState, Target, Update, UpdateId, VersionVector};
use crate::error::Result;
use crate::invariants::document_violations;
use crate::observer::{ChangeEvent, ObserverId, Observers, Origin};
use crate::projection::{project, ViewState};
use crate::room::RoomId;
use crate::rotation;
use crate::transaction::Transaction;

/// An update that has landed in the document, as handed to commit sinks
#[derive(Debug, Clone)]
pub struct Committed {
    pub update: Arc<Update>,
    pub origin: Origin,
}

/// Receives every committed update, in application order.
///
/// Called while the replica is locked, so implementations must not block.
/// Returning `false` unregisters the sink.
pub trait CommitSink: Send {
    fn deliver(&mut self, committed: &Committed) -> bool;
}

impl<F> CommitSink for F
where
    F: FnMut(&Committed) -> bool + Send,
{
    fn deliver(&mut self, committed: &Committed) -> bool {
        self(committed)
    }
}

pub type SharedReplica = Arc<Mutex<Replica>>;

/// Lock a shared replica.
///
/// A panic inside an observer poisons the mutex; the replica state is still
/// consistent at that point because updates are installed before observers
/// run.
pub fn lock(replica: &SharedReplica) -> MutexGuard<'_, Replica> {
    replica.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Replica {
    id: ReplicaId,
    room: RoomId,
    state: DocumentState,
    /// Every applied update in application order
    log: Vec<Arc<Update>>,
    next_seq: u64,
    observers: Observers,
    sinks: Vec<Box<dyn CommitSink>>,
    time: Arc<dyn TimeSource>,
}

impl Replica {
    pub fn new(id: ReplicaId, room: RoomId, time: Arc<dyn TimeSource>) -> Self {
        Self::restore(id, room, DocumentState::new(), Vec::new(), time)
    }

    /// Rebuild a replica from a snapshot and the persisted update log.
    ///
    /// Log entries already covered by the snapshot are kept for
    /// reconciliation but not re-applied. `id` should be new for every
    /// restore: a commit lost in a crash may already be on a peer, and
    /// reusing its sequence number for another commit would make the peer
    /// treat the new one as a duplicate.
    pub fn restore(
        id: ReplicaId,
        room: RoomId,
        snapshot: DocumentState,
        log: Vec<Update>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let mut state = snapshot;
        let mut applied = Vec::with_capacity(log.len());
        let mut replayed = 0usize;

        for update in log {
            if state.is_applied(&update.id) {
                applied.push(Arc::new(update));
                continue;
            }
            for Applied { update, .. } in state.receive(update) {
                replayed += 1;
                applied.push(update);
            }
        }

        if state.pending_len() > 0 {
            warn!(
                room = %room,
                pending = state.pending_len(),
                "Restored log has updates with missing dependencies"
            );
        }

        let next_seq = state.version().get(&id) + 1;
        info!(
            room = %room,
            replica = %id,
            updates = applied.len(),
            replayed,
            "Replica restored"
        );

        Self {
            id,
            room,
            state,
            log: applied,
            next_seq,
            observers: Observers::new(),
            sinks: Vec::new(),
            time,
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn document(&self) -> &Document {
        self.state.document()
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn version(&self) -> &VersionVector {
        self.state.version()
    }

    pub fn time_source(&self) -> Arc<dyn TimeSource> {
        self.time.clone()
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Register a change listener
    pub fn observe(
        &mut self,
        target: Target,
        listener: impl FnMut(&ChangeEvent, &Document) + Send + 'static,
    ) -> ObserverId {
        self.observers.register(target, listener)
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    pub fn add_sink(&mut self, sink: impl CommitSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    /// Run `f` as one atomic commit.
    ///
    /// On `Ok` every staged edit is committed as a single update; on `Err`
    /// nothing is kept. A transaction that staged nothing commits nothing.
    pub fn transact<T>(&mut self, f: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        let now = self.time.now();
        let document = self.state.document().clone();
        let mut tx = Transaction::new(self.id, self.state.lamport(), document, now);

        let value = f(&mut tx)?;
        let (document, ops, touched) = tx.finish();
        if ops.is_empty() {
            return Ok(value);
        }

        let update = Update {
            id: UpdateId {
                replica: self.id,
                seq: self.next_seq,
            },
            deps: self.state.version().clone(),
            ops,
            committed_at: now,
        };
        self.next_seq += 1;
        self.state.install(document, &update);

        for violation in document_violations(self.state.document()) {
            debug!(update = %update.id, violation = %violation, "Document anomaly after commit");
        }

        debug!(update = %update.id, ops = update.ops.len(), "Committed local update");
        self.commit(
            Applied {
                update: Arc::new(update),
                touched,
            },
            Origin::Local,
        );
        Ok(value)
    }

    /// Merge an update received from a peer.
    ///
    /// Returns the ids of every update that landed as a result, which can
    /// include previously buffered ones. Duplicates land nothing.
    pub fn apply_remote(&mut self, update: Update, from: Option<ReplicaId>) -> Vec<UpdateId> {
        let applied = self.state.receive(update);

        // Our own updates can come back from a peer after local data was lost
        self.next_seq = self.next_seq.max(self.state.version().get(&self.id) + 1);

        let ids = applied.iter().map(|a| a.update.id).collect();
        for applied in applied {
            self.commit(applied, Origin::Remote(from));
        }
        ids
    }

    pub fn apply_remote_blob(
        &mut self,
        blob: &[u8],
        from: Option<ReplicaId>,
    ) -> Result<Vec<UpdateId>> {
        let update = Update::decode(blob)?;
        Ok(self.apply_remote(update, from))
    }

    /// Updates not covered by `version`, in an order that respects causality
    pub fn updates_since(&self, version: &VersionVector) -> Vec<Arc<Update>> {
        self.log
            .iter()
            .filter(|u| !version.covers(&u.id))
            .cloned()
            .collect()
    }

    fn commit(&mut self, applied: Applied, origin: Origin) {
        self.log.push(applied.update.clone());

        let committed = Committed {
            update: applied.update,
            origin,
        };
        self.sinks.retain_mut(|sink| sink.deliver(&committed));

        let event = ChangeEvent {
            update: committed.update.id,
            origin,
            touched: applied.touched,
        };
        self.observers.notify(&event, self.state.document());
    }

    /// Current view as of now
    pub fn project(&self) -> ViewState {
        project(self.state.document(), self.time.now())
    }

    // Intents

    pub fn add(&mut self, name: &str) -> Result<bool> {
        self.transact(|tx| rotation::add(tx, name))
    }

    pub fn delete(&mut self, name: &str) -> Result<bool> {
        self.transact(|tx| rotation::delete(tx, name))
    }

    pub fn toggle_active(&mut self, name: &str) -> Result<bool> {
        self.transact(|tx| rotation::toggle_active(tx, name))
    }

    pub fn advance(&mut self) -> Result<Option<String>> {
        self.transact(rotation::advance)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.transact(rotation::reset)
    }

    pub fn reorder(&mut self, from: usize, to: usize) -> Result<()> {
        self.transact(|tx| rotation::reorder(tx, from, to))
    }

    pub fn replace_order(&mut self, order: &[String]) -> Result<()> {
        self.transact(|tx| rotation::replace_order(tx, order))
    }

    pub fn shuffle(&mut self) -> Result<()> {
        let mut rng = rand::thread_rng();
        self.transact(|tx| rotation::shuffle(tx, &mut rng))
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("room", &self.room)
            .field("version", self.state.version())
            .field("log", &self.log.len())
            .field("observers", &self.observers)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
