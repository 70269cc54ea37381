//! Last-Writer-Wins Element Set.
//!
//! Two maps, element → stamp, one for additions and one for removals. An
//! element is present iff its latest addition is strictly newer than its
//! latest removal. Stamps are totally ordered (clock weight, then replica,
//! then sequence), so replicas always agree on which write is newest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_types::Stamp;

/// An add/remove set with per-element last-writer-wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize + Ord",
    deserialize = "T: Deserialize<'de> + Ord"
))]
pub struct LwwElementSet<T: Ord> {
    #[serde(with = "stamped_entries")]
    adds: BTreeMap<T, Stamp>,
    #[serde(with = "stamped_entries")]
    removes: BTreeMap<T, Stamp>,
}

/// Serializes the element maps as `[element, stamp]` pairs so elements
/// need not be valid JSON object keys.
mod stamped_entries {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S, T>(map: &BTreeMap<T, Stamp>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize + Ord,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<BTreeMap<T, Stamp>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + Ord,
    {
        let pairs: Vec<(T, Stamp)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl<T: Ord> Default for LwwElementSet<T> {
    fn default() -> Self {
        Self {
            adds: BTreeMap::new(),
            removes: BTreeMap::new(),
        }
    }
}

fn raise<T: Ord>(map: &mut BTreeMap<T, Stamp>, element: T, stamp: Stamp) -> bool {
    match map.get_mut(&element) {
        Some(existing) if *existing >= stamp => false,
        Some(existing) => {
            *existing = stamp;
            true
        }
        None => {
            map.insert(element, stamp);
            true
        }
    }
}

impl<T: Ord + Clone> LwwElementSet<T> {
    /// Creates a new empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an addition. Returns true if the add map changed.
    pub fn add(&mut self, element: T, stamp: Stamp) -> bool {
        raise(&mut self.adds, element, stamp)
    }

    /// Records a removal. Removing an element never added is still
    /// recorded so a late, older addition stays hidden.
    pub fn remove(&mut self, element: T, stamp: Stamp) -> bool {
        raise(&mut self.removes, element, stamp)
    }

    #[must_use]
    pub fn added_at(&self, element: &T) -> Option<Stamp> {
        self.adds.get(element).copied()
    }

    #[must_use]
    pub fn removed_at(&self, element: &T) -> Option<Stamp> {
        self.removes.get(element).copied()
    }

    /// True iff the element was added and not removed by a newer write.
    #[must_use]
    pub fn contains(&self, element: &T) -> bool {
        match (self.adds.get(element), self.removes.get(element)) {
            (Some(_), None) => true,
            (Some(added), Some(removed)) => added > removed,
            (None, _) => false,
        }
    }

    /// Present elements in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.adds.keys().filter(|e| self.contains(e))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges another set into this one: per-element max in each map.
    pub fn merge(&mut self, other: &Self) {
        for (element, stamp) in &other.adds {
            raise(&mut self.adds, element.clone(), *stamp);
        }
        for (element, stamp) in &other.removes {
            raise(&mut self.removes, element.clone(), *stamp);
        }
    }

    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_types::{OperationId, ReplicaId};

    fn stamp(weight: u64, replica: u8) -> Stamp {
        let r = ReplicaId::from_uuid(uuid::Uuid::from_bytes([
            replica, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ]));
        Stamp {
            weight,
            id: OperationId::new(r, weight),
        }
    }

    #[test]
    fn add_then_contains() {
        let mut s = LwwElementSet::new();
        s.add("a".to_string(), stamp(1, 1));
        assert!(s.contains(&"a".to_string()));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn newer_remove_hides_element() {
        let mut s = LwwElementSet::new();
        s.add("a", stamp(1, 1));
        s.remove("a", stamp(2, 1));
        assert!(!s.contains(&"a"));
        assert!(s.is_empty());
    }

    #[test]
    fn newer_add_revives_element() {
        let mut s = LwwElementSet::new();
        s.add("a", stamp(1, 1));
        s.remove("a", stamp(2, 1));
        s.add("a", stamp(3, 1));
        assert!(s.contains(&"a"));
    }

    #[test]
    fn remove_before_add_arrives() {
        let mut s = LwwElementSet::new();
        s.remove("a", stamp(5, 1));
        s.add("a", stamp(3, 2));
        assert!(!s.contains(&"a"));
    }

    #[test]
    fn concurrent_add_remove_breaks_ties_by_replica() {
        let mut s = LwwElementSet::new();
        s.add("a", stamp(2, 2));
        s.remove("a", stamp(2, 1));
        assert!(s.contains(&"a"));
    }

    #[test]
    fn older_stamp_does_not_lower_entry() {
        let mut s = LwwElementSet::new();
        assert!(s.add("a", stamp(5, 1)));
        assert!(!s.add("a", stamp(4, 1)));
        assert_eq!(s.added_at(&"a"), Some(stamp(5, 1)));
    }

    #[test]
    fn merge_is_commutative() {
        let mut a = LwwElementSet::new();
        a.add("x", stamp(1, 1));
        a.remove("y", stamp(3, 1));
        let mut b = LwwElementSet::new();
        b.add("y", stamp(2, 2));
        b.add("z", stamp(1, 2));
        assert_eq!(a.merged(&b), b.merged(&a));
        let members: Vec<_> = a.merged(&b).iter().copied().collect();
        assert_eq!(members, vec!["x", "z"]);
    }

    #[test]
    fn serialization_roundtrip() {
        let mut s: LwwElementSet<String> = LwwElementSet::new();
        s.add("tag".into(), stamp(1, 1));
        s.remove("old".into(), stamp(2, 1));
        let json = serde_json::to_string(&s).unwrap();
        let parsed: LwwElementSet<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, s);
    }
}
