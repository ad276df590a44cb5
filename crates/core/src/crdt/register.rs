//! Last-writer-wins register

use serde::{Deserialize, Serialize};

use crate::clock::Stamp;

/// A value that resolves concurrent writes by the greater stamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: T,
    stamp: Stamp,
}

impl<T: Clone> LwwRegister<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    /// Write `value` if `stamp` is newer than the current one.
    ///
    /// Returns whether the register changed.
    pub fn set(&mut self, value: T, stamp: Stamp) -> bool {
        if stamp > self.stamp {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }

    /// Merge another replica's register into this one
    pub fn merge(&mut self, other: &Self) -> bool {
        self.set(other.value.clone(), other.stamp)
    }
}

impl<T: Default> Default for LwwRegister<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
            stamp: Stamp::ZERO,
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
    fn test_newer_write_wins() {
        let mut reg = LwwRegister::new("a".to_string(), stamp(1, 1));
        assert!(reg.set("b".to_string(), stamp(2, 1)));
        assert!(!reg.set("c".to_string(), stamp(1, 9)));
        assert_eq!(reg.value(), "b");
    }

    #[test]
    fn test_merge_commutes() {
        let base = LwwRegister::new(0u64, Stamp::ZERO);

        let mut left = base.clone();
        left.set(10, stamp(3, 1));
        let mut right = base.clone();
        right.set(20, stamp(3, 2));

        let mut lr = left.clone();
        lr.merge(&right);
        let mut rl = right.clone();
        rl.merge(&left);

        assert_eq!(lr, rl);
        // Equal counters fall back to replica order
        assert_eq!(*lr.value(), 20);
    }

    #[test]
    fn test_merge_idempotent() {
        let mut reg = LwwRegister::new(true, stamp(5, 1));
        let copy = reg.clone();
        assert!(!reg.merge(&copy));
        assert_eq!(reg, copy);
    }
}
