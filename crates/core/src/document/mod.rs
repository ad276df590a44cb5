//! The replicated room document
//!
//! A document holds:
//!
//! - `people`: keyed map of person records, one LWW register per field
//! - `on_deck`: RGA sequence of names waiting to speak
//! - `done`: RGA sequence of names that have spoken this round
//! - `in_progress`: LWW register holding the current speaker and start time
//!
//! The document is only mutated by applying [`Op`]s, either staged inside a
//! local transaction or received from a peer.

mod state;
mod update;

use std::collections::BTreeMap;
use std::ops::BitOrAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crdt::{LwwRegister, Sequence};
use crate::error::Result;

pub use state::{Applied, DocumentState};
pub use update::{Op, Update, UpdateId, VersionVector};

/// A participant in the rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub name: String,
    pub active: bool,
    /// Accumulated speaking time in seconds
    pub time: u64,
}

impl PersonRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
            time: 0,
        }
    }
}

/// Per-field registers backing one person record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonEntry {
    present: LwwRegister<bool>,
    active: LwwRegister<bool>,
    time: LwwRegister<u64>,
}

impl PersonEntry {
    pub fn is_present(&self) -> bool {
        *self.present.value()
    }

    fn record(&self, name: &str) -> PersonRecord {
        PersonRecord {
            name: name.to_string(),
            active: *self.active.value(),
            time: *self.time.value(),
        }
    }
}

/// The current speaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgress {
    pub name: String,
    pub start: DateTime<Utc>,
}

/// Which ordered sequence an op addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeqId {
    OnDeck,
    Done,
}

/// Parts of the document an observer can listen to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The people map
    People,
    /// The state map (`on_deck`, `done`, `in_progress`)
    State,
    /// Either of the above
    Any,
}

/// Parts of the document touched by a set of ops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Touched {
    pub people: bool,
    pub state: bool,
}

impl Touched {
    pub fn is_empty(&self) -> bool {
        !self.people && !self.state
    }

    pub fn matches(&self, target: Target) -> bool {
        match target {
            Target::People => self.people,
            Target::State => self.state,
            Target::Any => !self.is_empty(),
        }
    }
}

impl BitOrAssign for Touched {
    fn bitor_assign(&mut self, rhs: Self) {
        self.people |= rhs.people;
        self.state |= rhs.state;
    }
}

/// Replicated room document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    people: BTreeMap<String, PersonEntry>,
    on_deck: Sequence<String>,
    done: Sequence<String>,
    in_progress: LwwRegister<Option<InProgress>>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a person that has not been deleted
    pub fn person(&self, name: &str) -> Option<PersonRecord> {
        self.people
            .get(name)
            .filter(|entry| entry.is_present())
            .map(|entry| entry.record(name))
    }

    pub fn contains_person(&self, name: &str) -> bool {
        self.person(name).is_some()
    }

    /// All live people, ordered by name
    pub fn people(&self) -> impl Iterator<Item = PersonRecord> + '_ {
        self.people
            .iter()
            .filter(|(_, entry)| entry.is_present())
            .map(|(name, entry)| entry.record(name))
    }

    pub fn sequence(&self, seq: SeqId) -> &Sequence<String> {
        match seq {
            SeqId::OnDeck => &self.on_deck,
            SeqId::Done => &self.done,
        }
    }

    fn sequence_mut(&mut self, seq: SeqId) -> &mut Sequence<String> {
        match seq {
            SeqId::OnDeck => &mut self.on_deck,
            SeqId::Done => &mut self.done,
        }
    }

    pub fn on_deck(&self) -> Vec<String> {
        self.on_deck.to_vec()
    }

    pub fn done(&self) -> Vec<String> {
        self.done.to_vec()
    }

    pub fn in_progress(&self) -> Option<&InProgress> {
        self.in_progress.value().as_ref()
    }

    /// Apply a single op.
    ///
    /// Ops are commutative for concurrent pairs and idempotent; the only
    /// failure is an insert whose origin has not been integrated yet.
    pub fn apply(&mut self, op: &Op) -> Result<Touched> {
        match op {
            Op::PersonPresent {
                name,
                present,
                stamp,
            } => {
                self.people
                    .entry(name.clone())
                    .or_default()
                    .present
                    .set(*present, *stamp);
                Ok(Touched {
                    people: true,
                    state: false,
                })
            }
            Op::PersonActive {
                name,
                active,
                stamp,
            } => {
                self.people
                    .entry(name.clone())
                    .or_default()
                    .active
                    .set(*active, *stamp);
                Ok(Touched {
                    people: true,
                    state: false,
                })
            }
            Op::PersonTime {
                name,
                seconds,
                stamp,
            } => {
                self.people
                    .entry(name.clone())
                    .or_default()
                    .time
                    .set(*seconds, *stamp);
                Ok(Touched {
                    people: true,
                    state: false,
                })
            }
            Op::SeqInsert {
                seq,
                id,
                after,
                name,
            } => {
                self.sequence_mut(*seq)
                    .integrate_insert(*id, *after, name.clone())?;
                Ok(Touched {
                    people: false,
                    state: true,
                })
            }
            Op::SeqDelete { seq, target } => {
                self.sequence_mut(*seq).integrate_delete(*target);
                Ok(Touched {
                    people: false,
                    state: true,
                })
            }
            Op::SetInProgress { value, stamp } => {
                self.in_progress.set(value.clone(), *stamp);
                Ok(Touched {
                    people: false,
                    state: true,
                })
            }
        }
    }
}
