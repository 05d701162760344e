//! Saving a relation together with its owner.
//!
//! Called after the owner itself was saved. The order of steps is:
//!
//! 1. load, so that initial values are known;
//! 2. direct relations: point foreign keys at the owner and save the changed
//!    entities;
//! 3. `auto_save`: save new or changed current entities;
//! 4. link relations: reconcile links, save new or changed links, delete
//!    orphan links;
//! 5. `auto_delete`: delete orphan entities;
//! 6. the current values become the initial ones and the flags are reset.

use asupersync::{Cx, Outcome};
use serde::Serialize;

use relmodel_core::{EntityCollection, EntityRef, Error, Store};

use crate::RelationAttributeValue;

/// Configuration for [`RelationAttributeValue::save`].
#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    /// Save new or changed related entities.
    pub auto_save: bool,
    /// Delete related entities that left the relation.
    pub auto_delete: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            auto_save: true,
            auto_delete: false,
        }
    }
}

impl SaveOptions {
    #[must_use]
    pub fn auto_save(mut self, value: bool) -> Self {
        self.auto_save = value;
        self
    }

    #[must_use]
    pub fn auto_delete(mut self, value: bool) -> Self {
        self.auto_delete = value;
        self
    }
}

/// What a save did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    /// The relation was neither loaded nor assigned, so nothing was done.
    pub skipped: bool,
    pub saved_entities: usize,
    pub saved_links: usize,
    pub deleted_links: usize,
    pub deleted_entities: usize,
    /// Whether the relation ended up clean.
    pub cleaned: bool,
}

fn needs_save(entity: &EntityRef) -> bool {
    entity.id().is_none() || !entity.is_existing() || entity.is_dirty()
}

/// Save every distinct entity of `entities` that is new or changed.
async fn save_pending<S: Store>(
    cx: &Cx,
    store: &S,
    entities: &EntityCollection,
) -> Outcome<usize, Error> {
    let mut saved = 0;
    for entity in entities.unique().iter().filter(|e| needs_save(e)) {
        match store.save(cx, entity).await {
            Outcome::Ok(()) => saved += 1,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    }
    Outcome::Ok(saved)
}

impl RelationAttributeValue {
    /// Persist the relation after its owner was saved.
    ///
    /// The owner must have an id. A relation that was never loaded nor
    /// assigned is skipped without touching storage.
    #[tracing::instrument(level = "debug", skip(self, cx, store), fields(relation = self.config.name))]
    pub async fn save<S: Store>(
        &self,
        cx: &Cx,
        store: &S,
        options: SaveOptions,
    ) -> Outcome<SaveReport, Error> {
        if let Err(e) = self.owner_id() {
            return Outcome::Err(e);
        }

        let mut report = SaveReport::default();
        if !self.is_loaded() && !self.is_set() {
            tracing::debug!("Relation untouched; skipping save");
            report.skipped = true;
            return Outcome::Ok(report);
        }

        let current = match self.load(cx, store).await {
            Outcome::Ok(current) => current,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let foreign_keyed = !self.config.is_linked() && !self.config.to_storage;
        if foreign_keyed {
            if let Err(e) = self.manage_current() {
                return Outcome::Err(e);
            }
        }

        if options.auto_save || foreign_keyed {
            report.saved_entities = match save_pending(cx, store, &current).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
        }

        if self.config.is_linked() {
            let links = match self.manage_current_links(cx, store).await {
                Outcome::Ok(links) => links,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            report.saved_links = match save_pending(cx, store, &links).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            report.deleted_links = match self.delete_initial_links(cx, store).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            self.sync_initial_links();
        }

        if options.auto_delete {
            report.deleted_entities = match self.delete_initial(cx, store).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
        }

        self.sync_initial();
        report.cleaned = self.clean();
        if !report.cleaned {
            tracing::warn!("Relation saved with unsaved members; it stays dirty");
        }

        tracing::info!(
            saved_entities = report.saved_entities,
            saved_links = report.saved_links,
            deleted_links = report.deleted_links,
            deleted_entities = report.deleted_entities,
            "Relation saved"
        );
        Outcome::Ok(report)
    }
}
