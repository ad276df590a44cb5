//! Primitive ops and the committed update unit exchanged between replicas

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{InProgress, SeqId};
use crate::clock::{ReplicaId, Stamp};
use crate::error::Result;

/// A primitive, mergeable document edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    PersonPresent {
        name: String,
        present: bool,
        stamp: Stamp,
    },
    PersonActive {
        name: String,
        active: bool,
        stamp: Stamp,
    },
    PersonTime {
        name: String,
        seconds: u64,
        stamp: Stamp,
    },
    SeqInsert {
        seq: SeqId,
        id: Stamp,
        after: Option<Stamp>,
        name: String,
    },
    SeqDelete {
        seq: SeqId,
        target: Stamp,
    },
    SetInProgress {
        value: Option<InProgress>,
        stamp: Stamp,
    },
}

impl Op {
    /// Highest Lamport counter carried by this op
    pub fn max_counter(&self) -> u64 {
        match self {
            Op::PersonPresent { stamp, .. }
            | Op::PersonActive { stamp, .. }
            | Op::PersonTime { stamp, .. }
            | Op::SetInProgress { stamp, .. } => stamp.counter,
            Op::SeqInsert { id, .. } => id.counter,
            Op::SeqDelete { target, .. } => target.counter,
        }
    }
}

/// Identity of a committed update: the n-th transaction of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UpdateId {
    pub replica: ReplicaId,
    pub seq: u64,
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.replica, self.seq)
    }
}

/// Highest contiguous update sequence applied, per replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<ReplicaId, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Whether the update has been applied
    pub fn covers(&self, id: &UpdateId) -> bool {
        self.get(&id.replica) >= id.seq
    }

    /// Record an applied update
    pub fn record(&mut self, id: UpdateId) {
        let entry = self.0.entry(id.replica).or_insert(0);
        *entry = (*entry).max(id.seq);
    }

    /// Whether every update covered by `other` is covered here
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other.0.iter().all(|(replica, seq)| self.get(replica) >= *seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of updates covered
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One committed transaction: the unit of persistence and sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub id: UpdateId,
    /// Version the author had applied when committing
    pub deps: VersionVector,
    pub ops: Vec<Op>,
    pub committed_at: DateTime<Utc>,
}

impl Update {
    pub fn max_counter(&self) -> u64 {
        self.ops.iter().map(Op::max_counter).max().unwrap_or(0)
    }

    /// Whether all causal dependencies are covered by `version`
    pub fn is_ready(&self, version: &VersionVector) -> bool {
        if version.get(&self.id.replica) + 1 != self.id.seq {
            return false;
        }
        self.deps
            .iter()
            .filter(|(replica, _)| **replica != self.id.replica)
            .all(|(replica, seq)| version.get(replica) >= *seq)
    }

    /// Encode as the opaque blob handed to storage and peers
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
