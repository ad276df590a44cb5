//! Causally-consistent document state
//!
//! Wraps a [`Document`] with the version vector of applied updates, the
//! Lamport high-water mark, and a buffer of updates that arrived before
//! their dependencies.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Document, Touched, Update, UpdateId, VersionVector};
use crate::clock::ReplicaId;
use crate::error::Result;

/// An update that has just been integrated
#[derive(Debug, Clone)]
pub struct Applied {
    pub update: Arc<Update>,
    pub touched: Touched,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentState {
    document: Document,
    version: VersionVector,
    lamport: u64,
    #[serde(skip)]
    pending: Vec<Update>,
    /// Lowest sequence per replica that failed to integrate
    #[serde(skip)]
    rejected: BTreeMap<ReplicaId, u64>,
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    /// Highest Lamport counter seen in any applied update
    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    /// Updates waiting on missing dependencies
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_applied(&self, id: &UpdateId) -> bool {
        self.version.covers(id)
    }

    /// Whether `update` follows or depends on an update that failed to
    /// integrate, so it can never become ready
    fn is_stranded(&self, update: &Update) -> bool {
        self.rejected.iter().any(|(replica, seq)| {
            (update.id.replica == *replica && update.id.seq >= *seq)
                || update.deps.get(replica) >= *seq
        })
    }

    /// Receive an update from any source.
    ///
    /// Duplicates are ignored, updates with unmet dependencies are buffered,
    /// and every update this call manages to apply (including previously
    /// buffered ones it unblocked) is returned in application order. Updates
    /// stuck behind one that failed to integrate are dropped.
    pub fn receive(&mut self, update: Update) -> Vec<Applied> {
        if self.is_applied(&update.id) || self.pending.iter().any(|p| p.id == update.id) {
            debug!(update = %update.id, "Ignoring duplicate update");
            return Vec::new();
        }
        if self.is_stranded(&update) {
            warn!(update = %update.id, "Dropping update that depends on a rejected update");
            return Vec::new();
        }

        self.pending.push(update);
        self.drain_ready()
    }

    fn drain_ready(&mut self) -> Vec<Applied> {
        let mut applied = Vec::new();

        loop {
            let Some(index) = self
                .pending
                .iter()
                .position(|u| u.is_ready(&self.version))
            else {
                break;
            };

            let update = self.pending.remove(index);
            match self.integrate(&update) {
                Ok(touched) => applied.push(Applied {
                    update: Arc::new(update),
                    touched,
                }),
                Err(e) => {
                    warn!(
                        update = %update.id,
                        error = %e,
                        "Dropping update that failed to integrate"
                    );
                    let seq = self.rejected.entry(update.id.replica).or_insert(update.id.seq);
                    *seq = (*seq).min(update.id.seq);
                }
            }
        }

        // Anything that can never become ready again
        let stranded: Vec<UpdateId> = self
            .pending
            .iter()
            .filter(|u| self.version.covers(&u.id) || self.is_stranded(u))
            .map(|u| u.id)
            .collect();
        if !stranded.is_empty() {
            for id in &stranded {
                debug!(update = %id, "Evicting buffered update");
            }
            self.pending.retain(|u| !stranded.contains(&u.id));
        }

        applied
    }

    /// Apply every op of a ready update, all or nothing
    fn integrate(&mut self, update: &Update) -> Result<Touched> {
        let mut working = self.document.clone();
        let mut touched = Touched::default();
        for op in &update.ops {
            touched |= working.apply(op)?;
        }

        self.document = working;
        self.version.record(update.id);
        self.lamport = self.lamport.max(update.max_counter());
        Ok(touched)
    }

    /// Install the result of a local transaction.
    ///
    /// `document` already has `update`'s ops applied.
    pub(crate) fn install(&mut self, document: Document, update: &Update) {
        self.document = document;
        self.version.record(update.id);
        self.lamport = self.lamport.max(update.max_counter());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Stamp;
    use crate::document::{Op, SeqId};
    use chrono::Utc;
    use uuid::Uuid;

    fn replica(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn insert_update(
        author: u128,
        seq: u64,
        counter: u64,
        after: Option<Stamp>,
        deps: &VersionVector,
    ) -> Update {
        Update {
            id: UpdateId {
                replica: replica(author),
                seq,
            },
            deps: deps.clone(),
            ops: vec![Op::SeqInsert {
                seq: SeqId::OnDeck,
                id: Stamp::new(counter, replica(author)),
                after,
                name: format!("p{}-{}", author, seq),
            }],
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn test_out_of_order_delivery_buffers() {
        let first = insert_update(1, 1, 1, None, &VersionVector::new());
        let mut deps = VersionVector::new();
        deps.record(first.id);
        let second = insert_update(1, 2, 2, Some(Stamp::new(1, replica(1))), &deps);

        let mut state = DocumentState::new();
        assert!(state.receive(second.clone()).is_empty());
        assert_eq!(state.pending_len(), 1);

        let applied = state.receive(first.clone());
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].update.id, first.id);
        assert_eq!(applied[1].update.id, second.id);
        assert_eq!(state.pending_len(), 0);
        assert_eq!(state.document().on_deck(), vec!["p1-1", "p1-2"]);
        assert_eq!(state.lamport(), 2);
    }

    #[test]
    fn test_duplicate_is_noop() {
        let first = insert_update(1, 1, 1, None, &VersionVector::new());
        let mut state = DocumentState::new();

        assert_eq!(state.receive(first.clone()).len(), 1);
        let before = state.document().clone();
        assert!(state.receive(first).is_empty());
        assert_eq!(state.document(), &before);
    }

    #[test]
    fn test_failed_integration_not_recorded() {
        // Claims no deps but references an origin nobody has seen
        let origin = Some(Stamp::new(4, replica(9)));
        let broken = insert_update(1, 1, 5, origin, &VersionVector::new());
        let mut state = DocumentState::new();

        assert!(state.receive(broken.clone()).is_empty());
        assert!(!state.is_applied(&broken.id));
        assert!(state.document().on_deck().is_empty());
    }

    #[test]
    fn test_successors_of_rejected_update_are_evicted() {
        let origin = Some(Stamp::new(4, replica(9)));
        let broken = insert_update(1, 1, 5, origin, &VersionVector::new());
        let mut deps = VersionVector::new();
        deps.record(broken.id);
        let successor = insert_update(1, 2, 6, None, &deps);
        let dependent = insert_update(2, 1, 7, None, &deps);

        let mut state = DocumentState::new();
        assert!(state.receive(successor).is_empty());
        assert!(state.receive(dependent.clone()).is_empty());
        assert_eq!(state.pending_len(), 2);

        // The broken update fails, and nothing waiting on it stays buffered
        assert!(state.receive(broken.clone()).is_empty());
        assert_eq!(state.pending_len(), 0);

        assert!(state.receive(dependent).is_empty());
        assert!(state.receive(broken).is_empty());
        assert_eq!(state.pending_len(), 0);

        // Unrelated replicas are unaffected
        let other = insert_update(3, 1, 1, None, &VersionVector::new());
        assert_eq!(state.receive(other).len(), 1);
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_version() {
        let first = insert_update(1, 1, 1, None, &VersionVector::new());
        let mut state = DocumentState::new();
        state.receive(first.clone());

        let json = serde_json::to_string(&state).unwrap();
        let restored: DocumentState = serde_json::from_str(&json).unwrap();

        assert!(restored.is_applied(&first.id));
        assert_eq!(restored.document(), state.document());
        assert_eq!(restored.lamport(), 1);
    }
}
