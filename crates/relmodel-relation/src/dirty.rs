//! Dirty tracking for relation values.
//!
//! A relation value keeps one pair of flags for its entities and one for its
//! links. `set` records that a value was explicitly assigned; `dirty` records
//! that the assignment changed the membership. Entity-level changes made after
//! assignment are picked up separately by [`any_entity_dirty`].

use serde::Serialize;

use relmodel_core::EntityCollection;

/// Options for assigning a current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Do not compare against the previous value; the flags are only marked
    /// `set`. Used when seeding current from initial after a load.
    pub skip_difference_check: bool,
}

impl SetOptions {
    /// Options for an assignment that must not raise the dirty flag.
    #[must_use]
    pub fn seed() -> Self {
        Self {
            skip_difference_check: true,
        }
    }
}

/// Mutation flags for one side (entities or links) of a relation value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirtyFlags {
    /// Membership changed since the last clean.
    pub dirty: bool,
    /// A current value was assigned since the last clean.
    pub set: bool,
}

impl DirtyFlags {
    /// Record the assignment of `next` over `previous`.
    ///
    /// Returns whether the assignment raised the dirty flag.
    pub fn record(
        &mut self,
        previous: &EntityCollection,
        next: &EntityCollection,
        options: SetOptions,
    ) -> bool {
        self.set = true;
        if options.skip_difference_check || previous.same_members(next) {
            return false;
        }
        self.dirty = true;
        true
    }

    /// Raise the dirty flag if a value assigned before the initial one was
    /// known differs from it.
    ///
    /// Returns whether the flag was raised.
    pub fn settle(&mut self, initial: &EntityCollection, current: &EntityCollection) -> bool {
        if !self.set || self.dirty || initial.same_members(current) {
            return false;
        }
        self.dirty = true;
        true
    }

    pub fn clean(&mut self) {
        self.dirty = false;
        self.set = false;
    }
}

/// Whether any entity of the collection has unsaved attribute changes.
pub fn any_entity_dirty(entities: &EntityCollection) -> bool {
    entities.iter().any(relmodel_core::EntityRef::is_dirty)
}

/// The first entity that has no id yet, if any.
///
/// A relation cannot be marked clean while such an entity is current, since
/// nothing persisted refers to it.
pub fn first_unsaved(entities: &EntityCollection) -> Option<&relmodel_core::EntityRef> {
    entities.iter().find(|e| e.id().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmodel_core::{Attribute, EntityClass, EntityId, EntityRef};

    static TAG: EntityClass = EntityClass::new("Tag", &[Attribute::scalar("label")]);

    fn tag(id: i64) -> EntityRef {
        EntityRef::hydrate(&TAG, EntityId::Int(id), []).unwrap()
    }

    #[test]
    fn test_record_same_members_is_not_dirty() {
        let a = tag(1);
        let b = tag(2);
        let previous: EntityCollection = vec![a.clone(), b.clone()].into();
        let next: EntityCollection = vec![b, a].into();

        let mut flags = DirtyFlags::default();
        assert!(!flags.record(&previous, &next, SetOptions::default()));
        assert_eq!(flags, DirtyFlags { dirty: false, set: true });
    }

    #[test]
    fn test_record_changed_members_is_dirty() {
        let previous: EntityCollection = vec![tag(1)].into();
        let next: EntityCollection = vec![tag(1)].into();

        let mut flags = DirtyFlags::default();
        assert!(flags.record(&previous, &next, SetOptions::default()));
        assert!(flags.dirty);
    }

    #[test]
    fn test_seed_skips_difference_check() {
        let previous = EntityCollection::new();
        let next: EntityCollection = vec![tag(1)].into();

        let mut flags = DirtyFlags::default();
        assert!(!flags.record(&previous, &next, SetOptions::seed()));
        assert_eq!(flags, DirtyFlags { dirty: false, set: true });
    }

    #[test]
    fn test_settle_against_loaded_initial() {
        let a = tag(1);
        let initial: EntityCollection = vec![a.clone()].into();

        let mut flags = DirtyFlags { dirty: false, set: true };
        assert!(flags.settle(&initial, &EntityCollection::new()));
        assert!(flags.dirty);

        let mut flags = DirtyFlags { dirty: false, set: true };
        assert!(!flags.settle(&initial, &vec![a].into()));
        assert!(!flags.dirty);

        let mut unassigned = DirtyFlags::default();
        assert!(!unassigned.settle(&initial, &EntityCollection::new()));
    }

    #[test]
    fn test_clean_resets_both_flags() {
        let mut flags = DirtyFlags { dirty: true, set: true };
        flags.clean();
        assert_eq!(flags, DirtyFlags::default());
    }

    #[test]
    fn test_entity_level_checks() {
        let saved = tag(1);
        let fresh = TAG.instantiate();
        let entities: EntityCollection = vec![saved.clone(), fresh.clone()].into();
        assert!(!any_entity_dirty(&entities));
        assert!(first_unsaved(&entities).is_some_and(|e| e.same(&fresh)));

        saved.set("label", "sale").unwrap();
        assert!(any_entity_dirty(&entities));

        let persisted: EntityCollection = vec![saved].into();
        assert!(first_unsaved(&persisted).is_none());
    }
}
