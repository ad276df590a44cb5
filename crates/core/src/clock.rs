//! Logical and wall-clock time
//!
//! Every primitive operation carries a [`Stamp`], a Lamport counter tagged
//! with the replica that produced it. Stamps are totally ordered, which is
//! what makes last-writer-wins and sequence integration deterministic.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one running replica of a room document
pub type ReplicaId = Uuid;

/// Lamport timestamp tagged with its producing replica.
///
/// Ordered by `counter`, then by `replica`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    /// Stamp older than anything a replica can produce
    pub const ZERO: Stamp = Stamp {
        counter: 0,
        replica: Uuid::nil(),
    };

    pub fn new(counter: u64, replica: ReplicaId) -> Self {
        Self { counter, replica }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let replica = self.replica.simple().to_string();
        write!(f, "{}@{}", self.counter, &replica[..8])
    }
}

impl Default for Stamp {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Lamport clock owned by one replica
#[derive(Debug, Clone)]
pub struct LamportClock {
    replica: ReplicaId,
    counter: u64,
}

impl LamportClock {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }

    /// Produce a stamp greater than every stamp seen so far
    pub fn tick(&mut self) -> Stamp {
        self.counter += 1;
        Stamp::new(self.counter, self.replica)
    }

    /// Fold in a counter observed from another replica
    pub fn observe(&mut self, counter: u64) {
        self.counter = self.counter.max(counter);
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }
}

/// Source of wall-clock time for speaker timers
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock (for testing)
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, seconds: i64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = *now + Duration::seconds(seconds);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Whole seconds between `start` and `now`, never negative.
///
/// Replicas with skewed clocks can see a start time in their future.
pub fn elapsed_secs(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    now.signed_duration_since(start).num_seconds().max(0) as u64
}
