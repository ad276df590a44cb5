//! Mutation transactor
//!
//! A [`Transaction`] stages primitive edits against a working copy of the
//! document. Reads inside the transaction see its own staged edits. The
//! replica turns a successful transaction into a single [`Update`]; a failed
//! one is discarded whole.
//!
//! [`Update`]: crate::document::Update

use chrono::{DateTime, Utc};

use crate::clock::{LamportClock, ReplicaId, Stamp};
use crate::document::{Document, InProgress, Op, PersonRecord, SeqId, Touched};
use crate::error::{Error, Result};

/// Staged edits for one atomic commit
pub struct Transaction {
    clock: LamportClock,
    document: Document,
    ops: Vec<Op>,
    touched: Touched,
    now: DateTime<Utc>,
}

impl Transaction {
    pub(crate) fn new(
        replica: ReplicaId,
        lamport: u64,
        document: Document,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            clock: LamportClock::new(replica, lamport),
            document,
            ops: Vec::new(),
            touched: Touched::default(),
            now,
        }
    }

    /// Wall-clock time the transaction started
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Working copy including staged edits
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Number of ops staged so far
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    fn stamp(&mut self) -> Stamp {
        self.clock.tick()
    }

    fn stage(&mut self, op: Op) -> Result<()> {
        self.touched |= self.document.apply(&op)?;
        self.ops.push(op);
        Ok(())
    }

    /// Run `f` as part of this transaction.
    ///
    /// Nested transactions flatten into this one. If `f` fails, its staged
    /// edits are rolled back before the error is returned, so a caller that
    /// recovers from the error keeps only its own edits.
    pub fn transact<T>(&mut self, f: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        let document = self.document.clone();
        let op_count = self.ops.len();
        let touched = self.touched;

        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.document = document;
                self.ops.truncate(op_count);
                self.touched = touched;
                Err(e)
            }
        }
    }

    // People map

    pub fn person(&self, name: &str) -> Option<PersonRecord> {
        self.document.person(name)
    }

    pub fn people(&self) -> Vec<PersonRecord> {
        self.document.people().collect()
    }

    /// Create or overwrite a person record, staging only the fields that differ
    pub fn set_person(&mut self, record: &PersonRecord) -> Result<()> {
        let existing = self.document.person(&record.name);

        if existing.is_none() {
            let stamp = self.stamp();
            self.stage(Op::PersonPresent {
                name: record.name.clone(),
                present: true,
                stamp,
            })?;
        }
        if existing.as_ref().map(|p| p.active) != Some(record.active) {
            let stamp = self.stamp();
            self.stage(Op::PersonActive {
                name: record.name.clone(),
                active: record.active,
                stamp,
            })?;
        }
        if existing.as_ref().map(|p| p.time) != Some(record.time) {
            let stamp = self.stamp();
            self.stage(Op::PersonTime {
                name: record.name.clone(),
                seconds: record.time,
                stamp,
            })?;
        }
        Ok(())
    }

    pub fn set_active(&mut self, name: &str, active: bool) -> Result<()> {
        let mut record = self.require_person(name)?;
        record.active = active;
        self.set_person(&record)
    }

    pub fn set_time(&mut self, name: &str, seconds: u64) -> Result<()> {
        let mut record = self.require_person(name)?;
        record.time = seconds;
        self.set_person(&record)
    }

    pub fn delete_person(&mut self, name: &str) -> Result<()> {
        self.require_person(name)?;
        let stamp = self.stamp();
        self.stage(Op::PersonPresent {
            name: name.to_string(),
            present: false,
            stamp,
        })
    }

    fn require_person(&self, name: &str) -> Result<PersonRecord> {
        self.document
            .person(name)
            .ok_or_else(|| Error::NotFound(format!("person '{}'", name)))
    }

    // Ordered sequences

    /// Visible names in a sequence
    pub fn sequence(&self, seq: SeqId) -> Vec<String> {
        self.document.sequence(seq).to_vec()
    }

    pub fn len(&self, seq: SeqId) -> usize {
        self.document.sequence(seq).len()
    }

    pub fn contains(&self, seq: SeqId, name: &str) -> bool {
        self.document.sequence(seq).iter().any(|n| n == name)
    }

    /// Insert before the visible element at `index` (`index == len` appends)
    pub fn insert(&mut self, seq: SeqId, index: usize, name: &str) -> Result<()> {
        let after = self.document.sequence(seq).origin_for(index).ok_or_else(|| {
            Error::Structural(format!(
                "insert at {} past end of {:?} (len {})",
                index,
                seq,
                self.len(seq)
            ))
        })?;
        let id = self.stamp();
        self.stage(Op::SeqInsert {
            seq,
            id,
            after,
            name: name.to_string(),
        })
    }

    pub fn push(&mut self, seq: SeqId, name: &str) -> Result<()> {
        let len = self.len(seq);
        self.insert(seq, len, name)
    }

    /// Delete `count` visible elements starting at `index`
    pub fn delete_range(&mut self, seq: SeqId, index: usize, count: usize) -> Result<()> {
        let targets: Vec<Stamp> = self
            .document
            .sequence(seq)
            .visible()
            .skip(index)
            .take(count)
            .map(|e| e.id)
            .collect();

        if targets.len() != count {
            return Err(Error::Structural(format!(
                "delete {}..{} past end of {:?} (len {})",
                index,
                index + count,
                seq,
                self.len(seq)
            )));
        }

        for target in targets {
            self.stage(Op::SeqDelete { seq, target })?;
        }
        Ok(())
    }

    /// Delete every visible occurrence of `name`, returning how many
    pub fn remove_all(&mut self, seq: SeqId, name: &str) -> Result<usize> {
        let targets: Vec<Stamp> = self
            .document
            .sequence(seq)
            .visible()
            .filter(|e| e.value == name)
            .map(|e| e.id)
            .collect();

        let count = targets.len();
        for target in targets {
            self.stage(Op::SeqDelete { seq, target })?;
        }
        Ok(count)
    }

    /// Replace the whole visible content of a sequence
    pub fn replace(&mut self, seq: SeqId, names: &[String]) -> Result<()> {
        let len = self.len(seq);
        self.delete_range(seq, 0, len)?;
        for name in names {
            self.push(seq, name)?;
        }
        Ok(())
    }

    // Scalars

    pub fn in_progress(&self) -> Option<InProgress> {
        self.document.in_progress().cloned()
    }

    pub fn set_in_progress(&mut self, value: Option<InProgress>) -> Result<()> {
        let stamp = self.stamp();
        self.stage(Op::SetInProgress { value, stamp })
    }

    /// Consume the transaction, yielding the working copy and staged ops
    pub(crate) fn finish(self) -> (Document, Vec<Op>, Touched) {
        (self.document, self.ops, self.touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tx() -> Transaction {
        Transaction::new(Uuid::new_v4(), 0, Document::new(), Utc::now())
    }

    #[test]
    fn test_reads_see_staged_edits() {
        let mut tx = tx();
        tx.set_person(&PersonRecord::new("Andrew")).unwrap();
        tx.push(SeqId::OnDeck, "Andrew").unwrap();

        assert!(tx.person("Andrew").is_some());
        assert_eq!(tx.sequence(SeqId::OnDeck), vec!["Andrew"]);
        assert_eq!(tx.op_count(), 4);
    }

    #[test]
    fn test_set_person_stages_only_changes() {
        let mut tx = tx();
        tx.set_person(&PersonRecord::new("Brian")).unwrap();
        let staged = tx.op_count();

        tx.set_person(&PersonRecord::new("Brian")).unwrap();
        assert_eq!(tx.op_count(), staged);

        tx.set_active("Brian", false).unwrap();
        assert_eq!(tx.op_count(), staged + 1);
        assert!(!tx.person("Brian").unwrap().active);
    }

    #[test]
    fn test_structural_errors() {
        let mut tx = tx();
        tx.push(SeqId::OnDeck, "Greg").unwrap();

        assert!(matches!(tx.insert(SeqId::OnDeck, 5, "x"), Err(Error::Structural(_))));
        assert!(matches!(tx.delete_range(SeqId::OnDeck, 0, 2), Err(Error::Structural(_))));
        assert!(matches!(tx.delete_person("nobody"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_nested_failure_rolls_back_inner_edits() {
        let mut tx = tx();
        tx.push(SeqId::OnDeck, "outer").unwrap();

        let result: Result<()> = tx.transact(|inner| {
            inner.push(SeqId::OnDeck, "inner")?;
            inner.delete_range(SeqId::OnDeck, 10, 1)
        });

        assert!(result.is_err());
        assert_eq!(tx.sequence(SeqId::OnDeck), vec!["outer"]);
        assert_eq!(tx.op_count(), 1);
    }

    #[test]
    fn test_nested_success_flattens() {
        let mut tx = tx();
        tx.transact(|inner| {
            inner.push(SeqId::Done, "a")?;
            inner.transact(|deeper| deeper.push(SeqId::Done, "b"))
        })
        .unwrap();

        assert_eq!(tx.sequence(SeqId::Done), vec!["a", "b"]);
        let (_, ops, touched) = tx.finish();
        assert_eq!(ops.len(), 2);
        assert!(touched.state);
    }

    #[test]
    fn test_replace_and_remove_all() {
        let mut tx = tx();
        for name in ["a", "b", "a"] {
            tx.push(SeqId::OnDeck, name).unwrap();
        }
        assert_eq!(tx.remove_all(SeqId::OnDeck, "a").unwrap(), 2);
        assert_eq!(tx.sequence(SeqId::OnDeck), vec!["b"]);

        tx.replace(SeqId::OnDeck, &["c".to_string(), "d".to_string()])
            .unwrap();
        assert_eq!(tx.sequence(SeqId::OnDeck), vec!["c", "d"]);
    }
}
