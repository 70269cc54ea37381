//! Last-Writer-Wins Register (LWW-Register).
//!
//! A CRDT that stores a single value. Concurrent writes are resolved by
//! comparing stamps: the write with the highest [`Stamp`] wins. Stamps are
//! unique per operation, so there is never a tie between different writes.
//!
//! Entity fields use this as their storage cell.

use serde::{Deserialize, Serialize};
use tandem_types::{ReplicaId, Stamp};

/// A Last-Writer-Wins Register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: T,
    stamp: Stamp,
}

impl<T> LwwRegister<T> {
    /// Creates a register holding `value` written at `stamp`.
    #[must_use]
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Stamp of the winning write.
    #[must_use]
    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    /// Replica that performed the winning write.
    #[must_use]
    pub fn writer(&self) -> ReplicaId {
        self.stamp.replica()
    }

    /// Offers a write. Only a strictly newer stamp replaces the value.
    /// Returns true if the value was updated.
    pub fn set(&mut self, value: T, stamp: Stamp) -> bool {
        if stamp > self.stamp {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T: Clone> LwwRegister<T> {
    /// Merges another register into this one.
    pub fn merge(&mut self, other: &Self) {
        if other.stamp > self.stamp {
            self.value = other.value.clone();
            self.stamp = other.stamp;
        }
    }

    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }
}

impl<T: Default> Default for LwwRegister<T> {
    fn default() -> Self {
        Self::new(T::default(), Stamp::zero())
    }
}
