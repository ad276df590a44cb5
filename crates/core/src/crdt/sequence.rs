//! Replicated growable array (RGA)
//!
//! Elements are kept in document order, tombstones included. An insert
//! names the element it follows (its origin); integration starts right after
//! the origin and skips over elements carrying a greater stamp, so two
//! replicas inserting at the same spot end up with the same order.
//!
//! Inserts must be delivered causally (origin before dependents). The
//! document state buffers updates until their dependencies land.

use serde::{Deserialize, Serialize};

use crate::clock::Stamp;
use crate::error::{Error, Result};

/// One slot in the sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element<T> {
    pub id: Stamp,
    pub value: T,
    pub deleted: bool,
}

/// Ordered list CRDT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence<T> {
    elements: Vec<Element<T>>,
}

impl<T> Default for Sequence<T> {
    fn default() -> Self {
        Self {
            elements: Vec::new(),
        }
    }
}

impl<T: Clone> Sequence<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible (non-deleted) elements
    pub fn len(&self) -> usize {
        self.elements.iter().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible values in order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.visible().map(|e| &e.value)
    }

    /// Visible elements in order
    pub fn visible(&self) -> impl Iterator<Item = &Element<T>> {
        self.elements.iter().filter(|e| !e.deleted)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.iter().nth(index)
    }

    /// Stamp of the visible element at `index`
    pub fn id_at(&self, index: usize) -> Option<Stamp> {
        self.visible().nth(index).map(|e| e.id)
    }

    /// Origin an insert at visible `index` should name.
    ///
    /// `None` when `index` is past the end; `Some(None)` for the head.
    pub fn origin_for(&self, index: usize) -> Option<Option<Stamp>> {
        if index == 0 {
            return Some(None);
        }
        self.id_at(index - 1).map(Some)
    }

    /// Total slots including tombstones
    pub fn slot_count(&self) -> usize {
        self.elements.len()
    }

    fn position(&self, id: Stamp) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }

    /// Integrate an insert.
    ///
    /// Returns `Ok(false)` if the element is already present.
    pub fn integrate_insert(&mut self, id: Stamp, after: Option<Stamp>, value: T) -> Result<bool> {
        if self.position(id).is_some() {
            return Ok(false);
        }

        let mut pos = match after {
            None => 0,
            Some(origin) => {
                self.position(origin)
                    .ok_or_else(|| Error::Integration(format!("unknown origin {}", origin)))?
                    + 1
            }
        };

        while pos < self.elements.len() && self.elements[pos].id > id {
            pos += 1;
        }

        self.elements.insert(
            pos,
            Element {
                id,
                value,
                deleted: false,
            },
        );
        Ok(true)
    }

    /// Tombstone an element.
    ///
    /// Unknown or already-deleted targets are a no-op; a concurrent replica
    /// may have removed the same element first.
    pub fn integrate_delete(&mut self, target: Stamp) -> bool {
        match self.position(target) {
            Some(pos) if !self.elements[pos].deleted => {
                self.elements[pos].deleted = true;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn stamp(counter: u64, replica: u128) -> Stamp {
        Stamp::new(counter, Uuid::from_u128(replica))
    }

    #[test]
    fn test_append_in_order() {
        let mut seq = Sequence::new();
        seq.integrate_insert(stamp(1, 1), None, "a").unwrap();
        seq.integrate_insert(stamp(2, 1), Some(stamp(1, 1)), "b").unwrap();
        seq.integrate_insert(stamp(3, 1), Some(stamp(2, 1)), "c").unwrap();

        assert_eq!(seq.to_vec(), vec!["a", "b", "c"]);
        assert_eq!(seq.origin_for(3), Some(Some(stamp(3, 1))));
        assert_eq!(seq.origin_for(4), None);
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        let mut base = Sequence::new();
        base.integrate_insert(stamp(1, 1), None, "a").unwrap();

        // Two replicas insert after "a" at the same counter
        let x = (stamp(2, 1), "x");
        let y = (stamp(2, 2), "y");

        let mut left = base.clone();
        left.integrate_insert(x.0, Some(stamp(1, 1)), x.1).unwrap();
        left.integrate_insert(y.0, Some(stamp(1, 1)), y.1).unwrap();

        let mut right = base.clone();
        right.integrate_insert(y.0, Some(stamp(1, 1)), y.1).unwrap();
        right.integrate_insert(x.0, Some(stamp(1, 1)), x.1).unwrap();

        assert_eq!(left, right);
        assert_eq!(left.len(), 3);
    }

    #[test]
    fn test_concurrent_subtree_stays_together() {
        let mut base = Sequence::new();
        base.integrate_insert(stamp(1, 1), None, "a").unwrap();

        // Replica 2 inserts "b" then "c" after it; replica 1 concurrently inserts "x"
        let mut left = base.clone();
        left.integrate_insert(stamp(2, 2), Some(stamp(1, 1)), "b").unwrap();
        left.integrate_insert(stamp(3, 2), Some(stamp(2, 2)), "c").unwrap();
        left.integrate_insert(stamp(2, 1), Some(stamp(1, 1)), "x").unwrap();

        let mut right = base.clone();
        right.integrate_insert(stamp(2, 1), Some(stamp(1, 1)), "x").unwrap();
        right.integrate_insert(stamp(2, 2), Some(stamp(1, 1)), "b").unwrap();
        right.integrate_insert(stamp(3, 2), Some(stamp(2, 2)), "c").unwrap();

        assert_eq!(left.to_vec(), right.to_vec());
        assert_eq!(left.to_vec(), vec!["a", "b", "c", "x"]);
    }

    #[test]
    fn test_insert_idempotent() {
        let mut seq = Sequence::new();
        assert!(seq.integrate_insert(stamp(1, 1), None, "a").unwrap());
        assert!(!seq.integrate_insert(stamp(1, 1), None, "a").unwrap());
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn test_delete_tombstones() {
        let mut seq = Sequence::new();
        seq.integrate_insert(stamp(1, 1), None, "a").unwrap();
        seq.integrate_insert(stamp(2, 1), Some(stamp(1, 1)), "b").unwrap();

        assert!(seq.integrate_delete(stamp(1, 1)));
        assert!(!seq.integrate_delete(stamp(1, 1)));
        assert!(!seq.integrate_delete(stamp(9, 9)));

        assert_eq!(seq.to_vec(), vec!["b"]);
        assert_eq!(seq.slot_count(), 2);

        // Inserting after a tombstone still works
        seq.integrate_insert(stamp(3, 2), Some(stamp(1, 1)), "c").unwrap();
        assert_eq!(seq.to_vec(), vec!["c", "b"]);
    }

    #[test]
    fn test_unknown_origin_rejected() {
        let mut seq: Sequence<&str> = Sequence::new();
        let result = seq.integrate_insert(stamp(2, 1), Some(stamp(1, 1)), "a");
        assert!(result.is_err());
    }
}
