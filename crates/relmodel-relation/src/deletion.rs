//! Orphan deletion.
//!
//! Removes persisted entities (or links) that were part of the initial value
//! but are no longer referenced by the current one. Membership is decided by
//! id. Raw id placeholders in the initial value are never deleted since they
//! were never materialized.

use std::collections::HashSet;

use asupersync::{Cx, Outcome};

use relmodel_core::{EntityCollection, EntityRef, Error, Reference, Store};

/// The resolved initial entities whose id is absent from `current`.
///
/// Each instance appears once, even when several initial references point
/// at it.
pub(crate) fn orphans(initial: &[Reference], current: &EntityCollection) -> Vec<EntityRef> {
    let keep = current.id_set();
    let mut seen = HashSet::new();
    initial
        .iter()
        .filter_map(Reference::entity)
        .filter(|e| e.id().is_some_and(|id| !keep.contains(&id)))
        .filter(|e| seen.insert(e.instance_key()))
        .cloned()
        .collect()
}

/// Delete `orphans` one by one, stopping at the first failure.
///
/// Returns the number of deleted entities.
pub(crate) async fn delete_orphans<S: Store>(
    cx: &Cx,
    store: &S,
    relation: &'static str,
    orphans: Vec<EntityRef>,
) -> Outcome<usize, Error> {
    let mut deleted = 0;
    for entity in orphans {
        tracing::debug!(relation = relation, entity = ?entity, "Deleting orphan");
        match store.delete(cx, &entity).await {
            Outcome::Ok(()) => deleted += 1,
            Outcome::Err(e) => {
                tracing::warn!(relation = relation, entity = ?entity, error = %e, "Orphan delete failed");
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    }
    Outcome::Ok(deleted)
}
