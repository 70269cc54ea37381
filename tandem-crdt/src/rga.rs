//! Replicated Growable Array (RGA) for text sequences.
//!
//! Every element carries a unique, totally ordered [`CharId`] and the ID of
//! the element it was inserted after (its origin). Deleted elements become
//! tombstones so concurrent inserts can still anchor to them.
//!
//! The visible order is computed from the origin tree alone: siblings are
//! visited in descending `CharId` order, depth first from the root. Because
//! that traversal depends only on the set of elements, applying the same
//! inserts in any order yields the same sequence.
//!
//! Based on "A comprehensive study of Convergent and Commutative Replicated
//! Data Types" (Shapiro et al.).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tandem_types::{CharId, ReplicaId};

/// An element in the RGA sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Element<T> {
    id: CharId,
    origin: CharId,
    /// `None` once tombstoned.
    value: Option<T>,
}

/// A Replicated Growable Array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize + Clone",
    deserialize = "T: Deserialize<'de> + Clone"
))]
pub struct Rga<T> {
    #[serde(with = "elements_serde")]
    elements: BTreeMap<CharId, Element<T>>,
    /// Deletes that arrived before the insert they target.
    pending_deletes: BTreeSet<CharId>,
    /// Largest counter observed in any ID.
    max_counter: u64,
}

/// Elements are written as a list; `CharId` is not a valid JSON map key.
mod elements_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S, T: Serialize>(
        elements: &BTreeMap<CharId, Element<T>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(elements.values())
    }

    pub fn deserialize<'de, D, T: Deserialize<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<CharId, Element<T>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list: Vec<Element<T>> = Vec::deserialize(deserializer)?;
        Ok(list.into_iter().map(|e| (e.id, e)).collect())
    }
}

impl<T> Default for Rga<T> {
    fn default() -> Self {
        Self {
            elements: BTreeMap::new(),
            pending_deletes: BTreeSet::new(),
            max_counter: 0,
        }
    }
}

impl<T: Clone> Rga<T> {
    /// Creates a new empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the ordered list of element IDs (tombstones included) by
    /// traversing the origin tree.
    fn build_order(&self) -> Vec<CharId> {
        let mut children: HashMap<CharId, Vec<CharId>> = HashMap::new();
        for elem in self.elements.values() {
            children.entry(elem.origin).or_default().push(elem.id);
        }
        // Higher ID = later insert = closer to its origin.
        for siblings in children.values_mut() {
            siblings.sort_by(|a, b| b.cmp(a));
        }

        let mut order = Vec::with_capacity(self.elements.len());
        let mut stack = vec![CharId::root()];
        while let Some(current) = stack.pop() {
            if !current.is_root() {
                order.push(current);
            }
            if let Some(kids) = children.get(&current) {
                stack.extend(kids.iter().rev().copied());
            }
        }
        order
    }

    /// IDs of visible elements in order.
    fn visible_ids(&self) -> Vec<CharId> {
        self.build_order()
            .into_iter()
            .filter(|id| {
                self.elements
                    .get(id)
                    .is_some_and(|e| e.value.is_some())
            })
            .collect()
    }

    /// Number of visible elements reachable from the root. Elements whose
    /// anchor has not arrived are not counted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.visible_ids().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible values in order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.build_order()
            .iter()
            .filter_map(|id| self.elements.get(id).and_then(|e| e.value.clone()))
            .collect()
    }

    /// The ID at a visible index.
    #[must_use]
    pub fn id_at(&self, index: usize) -> Option<CharId> {
        self.visible_ids().get(index).copied()
    }

    /// Whether the ID is known, tombstoned or not.
    #[must_use]
    pub fn contains_id(&self, id: &CharId) -> bool {
        self.elements.contains_key(id)
    }

    #[must_use]
    pub fn is_tombstoned(&self, id: &CharId) -> bool {
        self.elements.get(id).is_some_and(|e| e.value.is_none())
    }

    /// Largest counter seen so far.
    #[must_use]
    pub fn max_counter(&self) -> u64 {
        self.max_counter
    }

    /// Computes the origin and fresh IDs for inserting `values` at a visible
    /// index, without changing the sequence. Indices past the end append.
    #[must_use]
    pub fn plan_insert(
        &self,
        replica: ReplicaId,
        index: usize,
        values: &[T],
    ) -> (CharId, Vec<(CharId, T)>) {
        let origin = if index == 0 {
            CharId::root()
        } else {
            let visible = self.visible_ids();
            visible
                .get(index.min(visible.len()).saturating_sub(1))
                .copied()
                .unwrap_or_else(CharId::root)
        };
        let run = values
            .iter()
            .enumerate()
            .map(|(i, v)| (CharId::new(self.max_counter + 1 + i as u64, replica), v.clone()))
            .collect();
        (origin, run)
    }

    /// IDs of `count` visible elements starting at `start`.
    #[must_use]
    pub fn plan_delete(&self, start: usize, count: usize) -> Vec<CharId> {
        self.visible_ids().into_iter().skip(start).take(count).collect()
    }

    /// Integrates a run: the first element goes after `origin`, each next one
    /// after its predecessor. Already-known IDs are skipped. Returns true if
    /// anything changed.
    pub fn apply_insert(&mut self, origin: CharId, run: &[(CharId, T)]) -> bool {
        let mut changed = false;
        let mut anchor = origin;
        for (id, value) in run {
            changed |= self.integrate(*id, anchor, value.clone());
            anchor = *id;
        }
        changed
    }

    /// Inserts a single value at a visible index and returns its ID.
    pub fn insert(&mut self, replica: ReplicaId, index: usize, value: T) -> CharId {
        let (origin, run) = self.plan_insert(replica, index, std::slice::from_ref(&value));
        let id = run[0].0;
        self.apply_insert(origin, &run);
        id
    }

    /// Adds one element with a known ID (replication path).
    pub fn integrate(&mut self, id: CharId, origin: CharId, value: T) -> bool {
        if id.is_root() || self.elements.contains_key(&id) {
            return false;
        }
        self.max_counter = self.max_counter.max(id.counter);
        let value = if self.pending_deletes.remove(&id) {
            None
        } else {
            Some(value)
        };
        self.elements.insert(id, Element { id, origin, value });
        true
    }

    /// Deletes the element at a visible index, returning its ID.
    pub fn delete(&mut self, index: usize) -> Option<CharId> {
        let id = self.id_at(index)?;
        self.delete_by_id(id);
        Some(id)
    }

    /// Tombstones an element by ID. Unknown IDs are remembered and
    /// tombstoned on arrival, so delete and insert commute.
    pub fn delete_by_id(&mut self, id: CharId) -> bool {
        if id.is_root() {
            return false;
        }
        self.max_counter = self.max_counter.max(id.counter);
        match self.elements.get_mut(&id) {
            Some(elem) if elem.value.is_some() => {
                elem.value = None;
                true
            }
            Some(_) => false,
            None => self.pending_deletes.insert(id),
        }
    }

    /// Merges another RGA into this one.
    ///
    /// Union of elements with delete-wins tombstones; commutative,
    /// associative and idempotent.
    pub fn merge(&mut self, other: &Self) {
        for (id, other_elem) in &other.elements {
            match other_elem.value.clone() {
                Some(value) => {
                    self.integrate(*id, other_elem.origin, value);
                }
                None => {
                    if let Some(existing) = self.elements.get_mut(id) {
                        existing.value = None;
                    } else {
                        self.max_counter = self.max_counter.max(id.counter);
                        self.pending_deletes.remove(id);
                        self.elements.insert(*id, other_elem.clone());
                    }
                }
            }
        }
        for id in &other.pending_deletes {
            self.delete_by_id(*id);
        }
        self.max_counter = self.max_counter.max(other.max_counter);
    }

    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }
}

impl Rga<char> {
    /// Renders the visible characters.
    #[must_use]
    pub fn as_string(&self) -> String {
        self.to_vec().into_iter().collect()
    }

    /// Inserts a string at the given visible index.
    pub fn insert_str(&mut self, replica: ReplicaId, index: usize, s: &str) {
        let chars: Vec<char> = s.chars().collect();
        let (origin, run) = self.plan_insert(replica, index, &chars);
        self.apply_insert(origin, &run);
    }

    /// Deletes `count` characters starting at `start`.
    pub fn delete_range(&mut self, start: usize, count: usize) {
        for id in self.plan_delete(start, count) {
            self.delete_by_id(id);
        }
    }
}
