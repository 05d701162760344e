//! Lazy, dirty-tracked relation values for relmodel.
//!
//! A [`RelationAttributeValue`] holds one to-many relation of one owner entity.
//! It keeps two views of the relation:
//!
//! - **initial**: what storage held when the relation was loaded (or last
//!   saved), possibly still raw ids;
//! - **current**: what the application wants the relation to be.
//!
//! In link mode the same pair exists for the link entities.
//!
//! # Lifecycle
//!
//! ```text
//! Unloaded --load()--> Loading --ok--> Loaded
//!                         |
//!                         +--error--> Unloaded (next load() retries)
//! ```
//!
//! Concurrent `load()` calls share one fetch (see [`single_flight`]). Once
//! loaded, `load()` only returns the current value.
//!
//! # Example
//!
//! ```ignore
//! static PRODUCTS: RelationConfig =
//!     RelationConfig::new("products", &PRODUCT, "cart").using(&CART_ITEM, "product");
//!
//! let products = RelationAttributeValue::new(&cart, &PRODUCTS);
//! let mut items = products.load(&cx, &store).await?;
//! items.push(new_product);
//! products.set_current(items);
//!
//! products.save(&cx, &store, SaveOptions::default()).await?;
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use asupersync::{Cx, Outcome};
use serde::Serialize;

use relmodel_core::{
    EntityCollection, EntityId, EntityRef, Error, Reference, RelationConfig, RelationError,
    RelationErrorKind, RelationMode, Result, Store, WeakEntityRef,
};

mod deletion;
pub mod dirty;
mod links;
mod loader;
pub mod n1_detection;
mod persist;
mod single_flight;

pub use dirty::{DirtyFlags, SetOptions};
pub use n1_detection::{LoadRecord, N1QueryTracker, N1Stats};
pub use persist::{SaveOptions, SaveReport};

use single_flight::LoadGate;

// ============================================================================
// Load state
// ============================================================================

/// Where a relation value is in its load lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    /// A fetch is in flight; further `load()` calls wait for it.
    Loading,
    Loaded,
}

#[derive(Debug)]
struct RelationState {
    /// `None` until populated by a load, `set_initial` or a save.
    initial: Option<Vec<Reference>>,
    current: Option<EntityCollection>,
    entities: DirtyFlags,
    initial_links: Option<Vec<Reference>>,
    current_links: Option<EntityCollection>,
    links: DirtyFlags,
    load: LoadState,
}

impl RelationState {
    fn new() -> Self {
        Self {
            initial: None,
            current: None,
            entities: DirtyFlags::default(),
            initial_links: None,
            current_links: None,
            links: DirtyFlags::default(),
            load: LoadState::Unloaded,
        }
    }

    /// Seed current values from initial ones unless they were assigned.
    ///
    /// An assigned value is compared with the initial one instead, since it
    /// was only compared with an empty placeholder when it was set.
    fn seed_current(&mut self) {
        let initial = resolved(self.initial.as_deref());
        if !self.entities.set && !self.entities.dirty {
            let previous = self.current.take().unwrap_or_default();
            self.entities.record(&previous, &initial, SetOptions::seed());
            self.current = Some(initial);
        } else if let Some(current) = &self.current {
            self.entities.settle(&initial, current);
        }

        let initial_links = resolved(self.initial_links.as_deref());
        if !self.links.set && !self.links.dirty {
            let previous = self.current_links.take().unwrap_or_default();
            self.links.record(&previous, &initial_links, SetOptions::seed());
            self.current_links = Some(initial_links);
        } else if let Some(current) = &self.current_links {
            self.links.settle(&initial_links, current);
        }
    }
}

/// The resolved entities among `references`, in order.
fn resolved(references: Option<&[Reference]>) -> EntityCollection {
    references
        .unwrap_or_default()
        .iter()
        .filter_map(Reference::entity)
        .cloned()
        .collect()
}

// ============================================================================
// Relation value
// ============================================================================

/// The value of one to-many relation attribute of one owner.
pub struct RelationAttributeValue {
    config: &'static RelationConfig,
    owner: WeakEntityRef,
    state: Mutex<RelationState>,
    gate: LoadGate,
    tracker: Option<Arc<N1QueryTracker>>,
}

impl RelationAttributeValue {
    /// Create an unloaded relation value for `owner`.
    ///
    /// The owner is held weakly; operations that need it fail with
    /// [`RelationErrorKind::OwnerGone`] once it is dropped.
    pub fn new(owner: &EntityRef, config: &'static RelationConfig) -> Self {
        Self {
            config,
            owner: owner.downgrade(),
            state: Mutex::new(RelationState::new()),
            gate: LoadGate::new(),
            tracker: None,
        }
    }

    /// Report every real fetch to a shared N+1 tracker.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<N1QueryTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &'static RelationConfig {
        self.config
    }

    pub fn name(&self) -> &'static str {
        self.config.name
    }

    /// The owner, if still alive.
    pub fn owner(&self) -> Option<EntityRef> {
        self.owner.upgrade()
    }

    fn lock_state(&self) -> MutexGuard<'_, RelationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn error(&self, kind: RelationErrorKind, message: impl Into<String>) -> Error {
        RelationError::new(kind, self.config.name, message).into()
    }

    fn live_owner(&self) -> Result<EntityRef> {
        self.owner
            .upgrade()
            .ok_or_else(|| self.error(RelationErrorKind::OwnerGone, "owner was dropped"))
    }

    fn owner_id(&self) -> Result<EntityId> {
        loader::owner_identity(self.config, &self.live_owner()?)
    }

    // ========================================================================
    // Loading
    // ========================================================================

    pub fn load_state(&self) -> LoadState {
        self.lock_state().load
    }

    pub fn is_loading(&self) -> bool {
        self.load_state() == LoadState::Loading
    }

    pub fn is_loaded(&self) -> bool {
        self.load_state() == LoadState::Loaded
    }

    /// Load the initial value and return the current one.
    ///
    /// Only owners that exist in storage are resolved; for a new owner the
    /// initial value is left as is and the value still counts as loaded. Once
    /// loaded, a value never fetches again, so a relation loaded before its
    /// owner was saved must be rebuilt to see stored data. Concurrent calls
    /// share a single fetch and
    /// are released in arrival order. If the fetch fails, every caller that
    /// waited on it gets the same error and the value goes back to
    /// [`LoadState::Unloaded`].
    #[tracing::instrument(level = "debug", skip(self, cx, store), fields(relation = self.config.name))]
    pub async fn load<S: Store>(&self, cx: &Cx, store: &S) -> Outcome<EntityCollection, Error> {
        if self.is_loaded() {
            return Outcome::Ok(self.current());
        }

        let ticket = self.gate.ticket();
        let Ok(mut slot) = self.gate.slot().lock(cx).await else {
            return Outcome::Err(
                self.error(RelationErrorKind::LoadGate, "failed to acquire the load gate"),
            );
        };

        if self.is_loaded() {
            tracing::trace!("Load finished while waiting");
            return Outcome::Ok(self.current());
        }
        if let Some(error) = slot.shared_failure(ticket) {
            tracing::debug!(%error, "Sharing failure of the load this call waited on");
            return Outcome::Err(error);
        }

        let owner = match self.live_owner() {
            Ok(owner) => owner,
            Err(e) => return Outcome::Err(e),
        };

        let request = {
            let mut state = self.lock_state();
            if !owner.is_existing() {
                tracing::debug!("Owner is not persisted; nothing to load");
                state.seed_current();
                state.load = LoadState::Loaded;
                slot.record_success();
                return Outcome::Ok(state.current.clone().unwrap_or_default());
            }
            state.load = LoadState::Loading;
            loader::LoadRequest {
                config: self.config,
                owner: &owner,
                initial: state.initial.clone().unwrap_or_default(),
                initial_links: state.initial_links.clone().unwrap_or_default(),
            }
        };

        match loader::resolve_initial(cx, store, request).await {
            Outcome::Ok(loaded) => {
                if loaded.fetched {
                    if let Some(tracker) = &self.tracker {
                        tracker.record_load(owner.class().name, self.config.name, owner.id());
                    }
                }

                let mut state = self.lock_state();
                if loaded.fetched {
                    state.initial = Some(loaded.initial);
                    if let Some(links) = loaded.links {
                        state.initial_links = Some(links);
                    }
                }
                state.seed_current();
                state.load = LoadState::Loaded;
                slot.record_success();

                let current = state.current.clone().unwrap_or_default();
                tracing::info!(
                    owner = ?owner,
                    initial = state.initial.as_ref().map_or(0, Vec::len),
                    current = current.len(),
                    fetched = loaded.fetched,
                    "Relation loaded"
                );
                Outcome::Ok(current)
            }
            Outcome::Err(e) => {
                self.lock_state().load = LoadState::Unloaded;
                slot.record_failure(&self.gate, e.clone());
                tracing::warn!(error = %e, "Relation load failed");
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.lock_state().load = LoadState::Unloaded;
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.lock_state().load = LoadState::Unloaded;
                Outcome::Panicked(p)
            }
        }
    }

    // ========================================================================
    // Initial and current values
    // ========================================================================

    /// The initial value as stored: resolved entities or raw ids.
    pub fn initial(&self) -> Vec<Reference> {
        self.lock_state().initial.clone().unwrap_or_default()
    }

    /// The resolved entities of the initial value.
    pub fn initial_entities(&self) -> EntityCollection {
        resolved(self.lock_state().initial.as_deref())
    }

    /// Replace the initial value, e.g. with ids read from the owner's row.
    pub fn set_initial(&self, initial: Vec<Reference>) {
        self.lock_state().initial = Some(initial);
    }

    pub fn has_initial(&self) -> bool {
        self.lock_state().initial.is_some()
    }

    /// The current value; empty until loaded or assigned.
    pub fn current(&self) -> EntityCollection {
        self.lock_state().current.clone().unwrap_or_default()
    }

    pub fn has_current(&self) -> bool {
        self.lock_state().current.is_some()
    }

    /// Assign the current value, raising the dirty flag if membership changed.
    ///
    /// Returns whether the flag was raised by this call.
    pub fn set_current(&self, current: impl Into<EntityCollection>) -> bool {
        self.set_current_with(current, SetOptions::default())
    }

    pub fn set_current_with(&self, current: impl Into<EntityCollection>, options: SetOptions) -> bool {
        let next = current.into();
        let mut state = self.lock_state();
        let previous = state.current.take().unwrap_or_default();
        let raised = state.entities.record(&previous, &next, options);
        if raised {
            tracing::debug!(
                relation = self.config.name,
                before = previous.len(),
                after = next.len(),
                "Relation membership changed"
            );
        }
        state.current = Some(next);
        raised
    }

    // ========================================================================
    // Links
    // ========================================================================

    pub fn initial_links(&self) -> Vec<Reference> {
        self.lock_state().initial_links.clone().unwrap_or_default()
    }

    /// Replace the initial links, e.g. with link ids stored on the owner.
    pub fn set_initial_links(&self, links: Vec<Reference>) {
        self.lock_state().initial_links = Some(links);
    }

    pub fn has_initial_links(&self) -> bool {
        self.lock_state().initial_links.is_some()
    }

    pub fn current_links(&self) -> EntityCollection {
        self.lock_state().current_links.clone().unwrap_or_default()
    }

    pub fn has_current_links(&self) -> bool {
        self.lock_state().current_links.is_some()
    }

    pub fn set_current_links(&self, links: impl Into<EntityCollection>) -> bool {
        self.set_current_links_with(links, SetOptions::default())
    }

    pub fn set_current_links_with(
        &self,
        links: impl Into<EntityCollection>,
        options: SetOptions,
    ) -> bool {
        let next = links.into();
        let mut state = self.lock_state();
        let previous = state.current_links.take().unwrap_or_default();
        let raised = state.links.record(&previous, &next, options);
        state.current_links = Some(next);
        raised
    }

    // ========================================================================
    // Dirty tracking
    // ========================================================================

    /// Whether membership changed or any current entity has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        let state = self.lock_state();
        state.entities.dirty || state.current.as_ref().is_some_and(dirty::any_entity_dirty)
    }

    pub fn is_clean(&self) -> bool {
        !self.is_dirty()
    }

    /// Whether a current value was assigned (or seeded) since the last clean.
    pub fn is_set(&self) -> bool {
        self.lock_state().entities.set
    }

    /// Whether the link membership changed since the last clean.
    pub fn links_dirty(&self) -> bool {
        self.lock_state().links.dirty
    }

    /// Reset the entity and link flags.
    ///
    /// Refused while a current entity has no id; returns whether the flags
    /// were reset. Entity-level dirtiness is not touched.
    pub fn clean(&self) -> bool {
        let mut state = self.lock_state();
        if let Some(unsaved) = state.current.as_ref().and_then(dirty::first_unsaved) {
            tracing::debug!(
                relation = self.config.name,
                entity = ?unsaved,
                "Not cleaning: current value holds an unsaved entity"
            );
            return false;
        }
        state.entities.clean();
        state.links.clean();
        true
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Point every current entity's foreign key at the owner.
    ///
    /// Only direct relations found through a foreign key have one; for other
    /// modes this does nothing.
    pub fn manage_current(&self) -> Result<()> {
        if self.config.is_linked() || self.config.to_storage {
            return Ok(());
        }
        let owner_id = self.owner_id()?;
        for entity in &self.current() {
            entity.set(self.config.entities.attribute, Reference::Id(owner_id.clone()))?;
        }
        Ok(())
    }

    /// Rebuild the current links from the current entities.
    ///
    /// Existing links are reused where their target matches; missing ones are
    /// instantiated (not saved). The result becomes the current link value.
    #[tracing::instrument(level = "debug", skip(self, cx, store), fields(relation = self.config.name))]
    pub async fn manage_current_links<S: Store>(
        &self,
        cx: &Cx,
        store: &S,
    ) -> Outcome<EntityCollection, Error> {
        let Some(using) = self.config.using else {
            return Outcome::Err(
                self.error(RelationErrorKind::Misconfigured, "relation has no link class"),
            );
        };
        let owner_id = match self.owner_id() {
            Ok(id) => id,
            Err(e) => return Outcome::Err(e),
        };
        let (current, initial_links) = {
            let state = self.lock_state();
            (
                state.current.clone().unwrap_or_default(),
                state.initial_links.clone().unwrap_or_default(),
            )
        };

        let plan = links::LinkPlan {
            relation: self.config.name,
            using,
            owner_attribute: self.config.entities.attribute,
            owner_id,
            current: &current,
            initial_links: &initial_links,
        };
        match links::reconcile_links(cx, store, plan).await {
            Outcome::Ok(reconciled) => {
                self.set_current_links(reconciled.links.clone());
                Outcome::Ok(reconciled.links)
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Delete initial entities that are no longer current.
    ///
    /// Does nothing, and never loads, when the initial value is empty.
    /// Returns the number of deleted entities.
    #[tracing::instrument(level = "debug", skip(self, cx, store), fields(relation = self.config.name))]
    pub async fn delete_initial<S: Store>(&self, cx: &Cx, store: &S) -> Outcome<usize, Error> {
        let orphans = {
            let state = self.lock_state();
            match &state.initial {
                Some(initial) if !initial.is_empty() => deletion::orphans(
                    initial,
                    &state.current.clone().unwrap_or_default(),
                ),
                _ => return Outcome::Ok(0),
            }
        };
        deletion::delete_orphans(cx, store, self.config.name, orphans).await
    }

    /// Delete initial links that are no longer current.
    #[tracing::instrument(level = "debug", skip(self, cx, store), fields(relation = self.config.name))]
    pub async fn delete_initial_links<S: Store>(
        &self,
        cx: &Cx,
        store: &S,
    ) -> Outcome<usize, Error> {
        let orphans = {
            let state = self.lock_state();
            match &state.initial_links {
                Some(initial) if !initial.is_empty() => deletion::orphans(
                    initial,
                    &state.current_links.clone().unwrap_or_default(),
                ),
                _ => return Outcome::Ok(0),
            }
        };
        deletion::delete_orphans(cx, store, self.config.name, orphans).await
    }

    /// Make the current value the new initial value.
    pub fn sync_initial(&self) {
        let mut state = self.lock_state();
        let current = state.current.clone().unwrap_or_default();
        state.initial = Some(current.into_iter().map(Reference::Entity).collect());
    }

    /// Make the current links the new initial links.
    pub fn sync_initial_links(&self) {
        let mut state = self.lock_state();
        let current = state.current_links.clone().unwrap_or_default();
        state.initial_links = Some(current.into_iter().map(Reference::Entity).collect());
    }

    /// Ids the owner stores for this relation: current link ids in link mode,
    /// current entity ids otherwise. Entities without an id are skipped.
    pub fn storage_value(&self) -> Vec<EntityId> {
        let state = self.lock_state();
        let source = match self.config.mode() {
            RelationMode::Linked => state.current_links.as_ref(),
            RelationMode::Direct => state.current.as_ref(),
        };
        source.map(EntityCollection::ids).unwrap_or_default()
    }

    /// Snapshot of the internal state for debugging.
    pub fn debug_state(&self) -> RelationDebugInfo {
        let state = self.lock_state();
        RelationDebugInfo {
            relation: self.config.name,
            mode: self.config.mode(),
            load: state.load,
            initial: state.initial.as_ref().map(Vec::len),
            current: state.current.as_ref().map(EntityCollection::len),
            initial_links: state.initial_links.as_ref().map(Vec::len),
            current_links: state.current_links.as_ref().map(EntityCollection::len),
            entities: state.entities,
            links: state.links,
        }
    }
}

impl std::fmt::Debug for RelationAttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationAttributeValue")
            .field("relation", &self.config.name)
            .field("owner", &self.owner)
            .field("state", &self.debug_state())
            .finish_non_exhaustive()
    }
}

/// Debug information about a relation value.
#[derive(Debug, Clone, Serialize)]
pub struct RelationDebugInfo {
    pub relation: &'static str,
    #[serde(serialize_with = "serialize_mode")]
    pub mode: RelationMode,
    pub load: LoadState,
    /// Sizes, `None` while unpopulated.
    pub initial: Option<usize>,
    pub current: Option<usize>,
    pub initial_links: Option<usize>,
    pub current_links: Option<usize>,
    pub entities: DirtyFlags,
    pub links: DirtyFlags,
}

fn serialize_mode<S: serde::Serializer>(
    mode: &RelationMode,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(match mode {
        RelationMode::Direct => "direct",
        RelationMode::Linked => "linked",
    })
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use relmodel_core::{Attribute, EntityClass};
    use relmodel_memory::{MemoryStore, Operation};

    static CART: EntityClass = EntityClass::new("Cart", &[Attribute::scalar("owner")]);
    static PRODUCT: EntityClass = EntityClass::new(
        "Product",
        &[Attribute::scalar("name"), Attribute::reference("cart", &CART)],
    );
    static CART_ITEM: EntityClass = EntityClass::new(
        "CartItem",
        &[
            Attribute::reference("cart", &CART),
            Attribute::reference("product", &PRODUCT),
        ],
    );

    static PRODUCTS: RelationConfig =
        RelationConfig::new("products", &PRODUCT, "cart").using(&CART_ITEM, "product");
    static OWNED: RelationConfig = RelationConfig::new("owned", &PRODUCT, "cart");
    static STORED: RelationConfig = RelationConfig::new("stored", &PRODUCT, "cart").to_storage(true);

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn product(id: i64) -> EntityRef {
        EntityRef::hydrate(&PRODUCT, EntityId::Int(id), []).unwrap()
    }

    fn cart(id: i64) -> EntityRef {
        EntityRef::hydrate(&CART, EntityId::Int(id), []).unwrap()
    }

    #[test]
    fn test_new_value_is_unloaded_and_empty() {
        let owner = cart(7);
        let value = RelationAttributeValue::new(&owner, &PRODUCTS);
        assert_eq!(value.load_state(), LoadState::Unloaded);
        assert!(!value.has_initial());
        assert!(!value.has_current());
        assert!(value.current().is_empty());
        assert!(value.is_clean());
        assert_eq!(value.name(), "products");
    }

    #[test]
    fn test_set_current_tracks_membership_changes() {
        let owner = cart(7);
        let value = RelationAttributeValue::new(&owner, &OWNED);
        let a = product(1);
        let b = product(2);

        assert!(value.set_current(vec![a.clone(), b.clone()]));
        assert!(value.is_dirty());
        assert!(value.is_set());
        assert!(value.clean());
        assert!(value.is_clean());

        assert!(!value.set_current(vec![b.clone(), a.clone()]));
        assert!(value.is_clean());

        assert!(value.set_current(vec![b]));
        assert!(value.is_dirty());
    }

    #[test]
    fn test_seeded_assignment_is_not_dirty() {
        let owner = cart(7);
        let value = RelationAttributeValue::new(&owner, &OWNED);
        assert!(!value.set_current_with(vec![product(1)], SetOptions::seed()));
        assert!(value.is_set());
        assert!(value.is_clean());
    }

    #[test]
    fn test_clean_refused_with_unsaved_entity() {
        let owner = cart(7);
        let value = RelationAttributeValue::new(&owner, &OWNED);
        value.set_current(vec![PRODUCT.instantiate()]);
        assert!(value.is_dirty());
        assert!(!value.clean());
        assert!(value.is_dirty());
        assert!(value.debug_state().entities.dirty);
    }

    #[test]
    fn test_entity_changes_cascade_to_relation() {
        let owner = cart(7);
        let value = RelationAttributeValue::new(&owner, &OWNED);
        let a = product(1);
        value.set_current_with(vec![a.clone()], SetOptions::seed());
        assert!(value.is_clean());

        a.set("name", "Lamp").unwrap();
        assert!(value.is_dirty());
        assert!(value.clean());
        // Entity-level changes are the entity's to clear.
        assert!(value.is_dirty());
    }

    #[test]
    fn test_manage_current_sets_foreign_key() {
        let owner = cart(7);
        let value = RelationAttributeValue::new(&owner, &OWNED);
        let a = product(1);
        value.set_current(vec![a.clone()]);
        value.manage_current().unwrap();
        assert!(matches!(a.reference("cart"), Some(Reference::Id(EntityId::Int(7)))));
        assert!(a.is_dirty());
    }

    #[test]
    fn test_manage_current_requires_owner_id() {
        let owner = CART.instantiate();
        let value = RelationAttributeValue::new(&owner, &OWNED);
        value.set_current(vec![product(1)]);
        let err = value.manage_current().unwrap_err();
        assert!(matches!(
            err,
            Error::Relation(RelationError {
                kind: RelationErrorKind::OwnerNotPersisted,
                ..
            })
        ));
    }

    #[test]
    fn test_dropped_owner_is_reported() {
        let owner = cart(7);
        let value = RelationAttributeValue::new(&owner, &OWNED);
        drop(owner);
        assert!(value.owner().is_none());
        let err = value.manage_current().unwrap_err();
        assert!(matches!(
            err,
            Error::Relation(RelationError {
                kind: RelationErrorKind::OwnerGone,
                ..
            })
        ));
    }

    #[test]
    fn test_storage_value_follows_mode() {
        let owner = cart(7);
        let direct = RelationAttributeValue::new(&owner, &STORED);
        direct.set_current(vec![product(3), PRODUCT.instantiate(), product(1)]);
        assert_eq!(direct.storage_value(), vec![EntityId::Int(3), EntityId::Int(1)]);

        let linked = RelationAttributeValue::new(&owner, &PRODUCTS);
        linked.set_current(vec![product(3)]);
        assert!(linked.storage_value().is_empty());
        let link = EntityRef::hydrate(&CART_ITEM, EntityId::Int(40), []).unwrap();
        linked.set_current_links(vec![link]);
        assert_eq!(linked.storage_value(), vec![EntityId::Int(40)]);
    }

    #[test]
    fn test_sync_initial_copies_current() {
        let owner = cart(7);
        let value = RelationAttributeValue::new(&owner, &OWNED);
        let a = product(1);
        value.set_current(vec![a.clone()]);
        value.sync_initial();
        let initial = value.initial_entities();
        assert_eq!(initial.len(), 1);
        assert!(initial[0].same(&a));
    }

    #[test]
    fn test_load_for_new_owner_does_not_fetch() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let owner = CART.instantiate();
        let value = RelationAttributeValue::new(&owner, &PRODUCTS);

        rt.block_on(async {
            let current = unwrap_outcome(value.load(&cx, &store).await);
            assert!(current.is_empty());
        });
        assert!(value.is_loaded());
        assert!(!value.has_initial());
        assert_eq!(store.stats().fetches(), 0);
    }

    #[test]
    fn test_value_loaded_before_owner_save_must_be_rebuilt() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let owner = CART.instantiate();
        let early = RelationAttributeValue::new(&owner, &PRODUCTS);

        rt.block_on(async {
            unwrap_outcome(early.load(&cx, &store).await);
            store.insert(&owner);
            unwrap_outcome(early.load(&cx, &store).await);
            assert_eq!(store.stats().find, 0);

            let rebuilt = RelationAttributeValue::new(&owner, &PRODUCTS);
            unwrap_outcome(rebuilt.load(&cx, &store).await);
            assert_eq!(store.stats().find, 1);
        });
    }

    #[test]
    fn test_load_keeps_assigned_current() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let owner = cart(7);
        store.insert(&owner);
        let stored = EntityRef::hydrate(
            &PRODUCT,
            EntityId::Int(1),
            [("cart", Reference::Id(EntityId::Int(7)).into())],
        )
        .unwrap();
        store.insert(&stored);

        let value = RelationAttributeValue::new(&owner, &OWNED);
        let fresh = product(2);
        value.set_current(vec![fresh.clone()]);

        rt.block_on(async {
            let current = unwrap_outcome(value.load(&cx, &store).await);
            assert_eq!(current.len(), 1);
            assert!(current[0].same(&fresh));
        });
        let initial = value.initial_entities();
        assert!(initial[0].same(&stored));
        assert!(value.is_dirty());
    }

    #[test]
    fn test_emptied_before_load_is_dirty_after_load() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let owner = cart(7);
        store.insert(&owner);
        let stored = product(101);
        store.insert(&stored);
        let item = EntityRef::hydrate(
            &CART_ITEM,
            EntityId::Int(1),
            [
                ("cart", Reference::Id(EntityId::Int(7)).into()),
                ("product", Reference::Id(EntityId::Int(101)).into()),
            ],
        )
        .unwrap();
        store.insert(&item);

        let value = RelationAttributeValue::new(&owner, &PRODUCTS);
        value.set_current(Vec::new());
        assert!(value.is_clean());

        rt.block_on(async {
            let current = unwrap_outcome(value.load(&cx, &store).await);
            assert!(current.is_empty());
        });
        assert_eq!(value.initial_entities().len(), 1);
        assert!(value.is_dirty());
    }

    #[test]
    fn test_assignment_matching_loaded_initial_stays_clean() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let owner = cart(7);
        store.insert(&owner);
        let stored = EntityRef::hydrate(
            &PRODUCT,
            EntityId::Int(1),
            [("cart", Reference::Id(EntityId::Int(7)).into())],
        )
        .unwrap();
        store.insert(&stored);

        let value = RelationAttributeValue::new(&owner, &OWNED);
        value.set_current_with(vec![stored.clone()], SetOptions::seed());

        rt.block_on(async {
            unwrap_outcome(value.load(&cx, &store).await);
        });
        assert!(value.is_clean());
    }

    #[test]
    fn test_load_failure_returns_to_unloaded() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let owner = cart(7);
        store.insert(&owner);
        store.fail_next(Operation::Find, Error::fetch("timeout"));
        let value = RelationAttributeValue::new(&owner, &OWNED);

        rt.block_on(async {
            match value.load(&cx, &store).await {
                Outcome::Err(e) => assert_eq!(e, Error::fetch("timeout")),
                _ => panic!("expected load failure"),
            }
            assert_eq!(value.load_state(), LoadState::Unloaded);

            unwrap_outcome(value.load(&cx, &store).await);
            assert!(value.is_loaded());
        });
        assert_eq!(store.stats().find, 2);
    }

    #[test]
    fn test_manage_current_links_requires_link_mode() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let owner = cart(7);
        let value = RelationAttributeValue::new(&owner, &OWNED);

        rt.block_on(async {
            match value.manage_current_links(&cx, &store).await {
                Outcome::Err(Error::Relation(e)) => {
                    assert_eq!(e.kind, RelationErrorKind::Misconfigured);
                }
                _ => panic!("expected misconfiguration"),
            }
        });
    }

    #[test]
    fn test_debug_state_serializes() {
        let owner = cart(7);
        let value = RelationAttributeValue::new(&owner, &PRODUCTS);
        value.set_current(vec![product(1)]);
        let json = serde_json::to_value(value.debug_state()).unwrap();
        assert_eq!(json["relation"], "products");
        assert_eq!(json["mode"], "linked");
        assert_eq!(json["load"], "unloaded");
        assert_eq!(json["current"], 1);
        assert_eq!(json["initial"], serde_json::Value::Null);
        assert_eq!(json["entities"]["dirty"], true);
    }
}
