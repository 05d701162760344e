//! Ordered collections of entity handles.

use std::collections::{HashMap, HashSet};
use std::ops::Index;

use crate::entity::EntityRef;
use crate::value::EntityId;

/// Ordered sequence of entities, the container every relation operation uses.
///
/// The same instance may appear more than once; link reconciliation relies on
/// that to represent repeated membership. Use [`EntityCollection::unique`] for
/// a deduplicated view. Equality ([`EntityCollection::same_members`]) compares
/// instances as a multiset, so order does not matter.
#[derive(Debug, Clone, Default)]
pub struct EntityCollection {
    items: Vec<EntityRef>,
}

impl EntityCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entity: EntityRef) {
        self.items.push(entity);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&EntityRef> {
        self.items.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EntityRef> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[EntityRef] {
        &self.items
    }

    /// Map every entity, preserving order.
    pub fn map<T>(&self, f: impl FnMut(&EntityRef) -> T) -> Vec<T> {
        self.items.iter().map(f).collect()
    }

    /// Keep the entities matching `predicate`, preserving order.
    #[must_use]
    pub fn filter(&self, mut predicate: impl FnMut(&EntityRef) -> bool) -> Self {
        self.items.iter().filter(|e| predicate(*e)).cloned().collect()
    }

    /// Ids of the entities, in order. Entities without an id are skipped.
    pub fn ids(&self) -> Vec<EntityId> {
        self.items.iter().filter_map(EntityRef::id).collect()
    }

    /// Set of ids present in the collection.
    pub fn id_set(&self) -> HashSet<EntityId> {
        self.items.iter().filter_map(EntityRef::id).collect()
    }

    /// Membership by instance.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.items.iter().any(|e| e.same(entity))
    }

    /// Membership by id.
    pub fn contains_id(&self, id: &EntityId) -> bool {
        self.items.iter().any(|e| e.id().as_ref() == Some(id))
    }

    /// Drop repeated instances, keeping first occurrences.
    #[must_use]
    pub fn unique(&self) -> Self {
        let mut seen = HashSet::new();
        self.items
            .iter()
            .filter(|e| seen.insert(e.instance_key()))
            .cloned()
            .collect()
    }

    /// Whether both collections hold the same instances with the same
    /// multiplicities, ignoring order.
    pub fn same_members(&self, other: &EntityCollection) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut counts: HashMap<usize, isize> = HashMap::new();
        for e in &self.items {
            *counts.entry(e.instance_key()).or_default() += 1;
        }
        for e in &other.items {
            *counts.entry(e.instance_key()).or_default() -= 1;
        }
        counts.values().all(|c| *c == 0)
    }
}

impl Index<usize> for EntityCollection {
    type Output = EntityRef;

    fn index(&self, idx: usize) -> &EntityRef {
        &self.items[idx]
    }
}

impl FromIterator<EntityRef> for EntityCollection {
    fn from_iter<I: IntoIterator<Item = EntityRef>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<EntityRef>> for EntityCollection {
    fn from(items: Vec<EntityRef>) -> Self {
        Self { items }
    }
}

impl IntoIterator for EntityCollection {
    type Item = EntityRef;
    type IntoIter = std::vec::IntoIter<EntityRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a EntityCollection {
    type Item = &'a EntityRef;
    type IntoIter = std::slice::Iter<'a, EntityRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
