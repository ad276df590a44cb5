//! Huddle Core Library
//!
//! Replicated speaking-queue document, its mutation and observation
//! protocol, rotation rules, and local storage.

pub mod clock;
pub mod config;
pub mod crdt;
pub mod document;
pub mod error;
pub mod invariants;
pub mod observer;
pub mod projection;
pub mod replica;
pub mod room;
pub mod rotation;
pub mod storage;
pub mod transaction;

pub use clock::{ManualClock, ReplicaId, Stamp, SystemClock, TimeSource};
pub use config::Config;
pub use document::{
    Document, DocumentState, InProgress, PersonRecord, SeqId, Target, Touched, Update, UpdateId,
    VersionVector,
};
pub use error::{Error, Result};
pub use observer::{ChangeEvent, ObserverId, Origin};
pub use projection::{
    format_time, project, ProjectionLayer, RosterEntry, Speaker, TimerState, Totals, ViewState,
};
pub use replica::{lock, CommitSink, Committed, Replica, SharedReplica};
pub use room::RoomId;
pub use storage::{Database, DocumentRepository, LoadedRoom};
pub use transaction::Transaction;
