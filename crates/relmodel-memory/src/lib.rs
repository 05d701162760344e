//! In-memory storage for relmodel.
//!
//! `MemoryStore` keeps every persisted entity in an identity map keyed by
//! `(class, id)`, so repeated fetches of the same row hand out the same
//! `EntityRef` instance. That is what relation reconciliation relies on when it
//! compares entities by identity.
//!
//! The store also counts calls per operation and can be told to fail the next
//! call of a given operation, which makes it the storage of choice for tests.
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new();
//! let product = PRODUCT.instantiate();
//! product.set("name", "Widget")?;
//! store.save(&cx, &product).await;
//!
//! let found = store.find_by_ids(&cx, &PRODUCT, &product.id().into_iter().collect::<Vec<_>>()).await;
//! assert_eq!(store.stats().find_by_ids, 1);
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::Poll;

use asupersync::{Cx, Outcome};
use serde::Serialize;

use relmodel_core::{EntityClass, EntityCollection, EntityId, EntityRef, Error, Query, Store};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for `MemoryStore` behavior.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Suspend once before every operation, so concurrent callers interleave
    /// the way they would against real I/O.
    pub yield_on_io: bool,
    /// First id handed out to new entities.
    pub first_id: i64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            yield_on_io: true,
            first_id: 1,
        }
    }
}

impl MemoryStoreConfig {
    #[must_use]
    pub fn yield_on_io(mut self, value: bool) -> Self {
        self.yield_on_io = value;
        self
    }

    #[must_use]
    pub fn first_id(mut self, value: i64) -> Self {
        self.first_id = value;
        self
    }
}

// ============================================================================
// Object Key and Stats
// ============================================================================

/// Unique key for an entity in the identity map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Entity class name.
    pub class: &'static str,
    /// Persisted id.
    pub id: EntityId,
}

impl ObjectKey {
    pub fn new(class: &'static EntityClass, id: EntityId) -> Self {
        Self {
            class: class.name,
            id,
        }
    }

    /// Key of a persisted entity, `None` if it has no id yet.
    pub fn from_entity(entity: &EntityRef) -> Option<Self> {
        entity.id().map(|id| Self::new(entity.class(), id))
    }
}

/// Store operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FindByIds,
    Find,
    Save,
    Delete,
}

/// Snapshot of the call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub find_by_ids: usize,
    pub find: usize,
    pub save: usize,
    pub delete: usize,
}

impl StoreStats {
    /// Number of read operations (`find` + `find_by_ids`).
    pub fn fetches(&self) -> usize {
        self.find + self.find_by_ids
    }
}

#[derive(Debug, Default)]
struct Counters {
    find_by_ids: AtomicUsize,
    find: AtomicUsize,
    save: AtomicUsize,
    delete: AtomicUsize,
}

impl Counters {
    fn bump(&self, op: Operation) {
        let counter = match op {
            Operation::FindByIds => &self.find_by_ids,
            Operation::Find => &self.find,
            Operation::Save => &self.save,
            Operation::Delete => &self.delete,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StoreStats {
        StoreStats {
            find_by_ids: self.find_by_ids.load(Ordering::Relaxed),
            find: self.find.load(Ordering::Relaxed),
            save: self.save.load(Ordering::Relaxed),
            delete: self.delete.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [&self.find_by_ids, &self.find, &self.save, &self.delete] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// Memory Store
// ============================================================================

#[derive(Debug)]
struct StoreInner {
    /// Identity map: ObjectKey -> the one live instance for that row.
    identity_map: BTreeMap<ObjectKey, EntityRef>,
    next_id: i64,
    /// Injected failures, consumed in order per operation.
    failures: HashMap<Operation, VecDeque<Error>>,
}

/// An in-memory `Store` with an identity map.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    counters: Counters,
    config: MemoryStoreConfig,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create an empty store with custom configuration.
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                identity_map: BTreeMap::new(),
                next_id: config.first_id,
                failures: HashMap::new(),
            }),
            counters: Counters::default(),
            config,
        }
    }

    pub fn config(&self) -> &MemoryStoreConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist an entity without going through the async contract and
    /// without touching the call counters. Used to seed fixtures.
    pub fn insert(&self, entity: &EntityRef) -> EntityId {
        let mut inner = self.lock();
        let id = match entity.id() {
            Some(id) => {
                if let EntityId::Int(i) = id {
                    inner.next_id = inner.next_id.max(i + 1);
                }
                id
            }
            None => {
                let id = EntityId::Int(inner.next_id);
                inner.next_id += 1;
                id
            }
        };
        entity.mark_saved(id.clone());
        inner
            .identity_map
            .insert(ObjectKey::new(entity.class(), id.clone()), entity.clone());
        id
    }

    /// Make the next call of `op` fail with `error`.
    ///
    /// Calling this several times queues several failures.
    pub fn fail_next(&self, op: Operation, error: Error) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// The live instance for `(class, id)`, if stored.
    pub fn get(&self, class: &'static EntityClass, id: &EntityId) -> Option<EntityRef> {
        self.lock()
            .identity_map
            .get(&ObjectKey::new(class, id.clone()))
            .cloned()
    }

    pub fn contains(&self, class: &'static EntityClass, id: &EntityId) -> bool {
        self.get(class, id).is_some()
    }

    /// Number of stored entities of `class`.
    pub fn count(&self, class: &'static EntityClass) -> usize {
        self.lock()
            .identity_map
            .keys()
            .filter(|key| key.class == class.name)
            .count()
    }

    /// Total number of stored entities.
    pub fn len(&self) -> usize {
        self.lock().identity_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Count the call, honour `yield_on_io`, and pop an injected failure.
    async fn enter(&self, op: Operation) -> Result<(), Error> {
        self.counters.bump(op);
        if self.config.yield_on_io {
            yield_now().await;
        }
        let mut inner = self.lock();
        match inner.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => {
                tracing::debug!(?op, %error, "Injected store failure");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

impl Store for MemoryStore {
    fn find_by_ids(
        &self,
        _cx: &Cx,
        class: &'static EntityClass,
        ids: &[EntityId],
    ) -> impl Future<Output = Outcome<EntityCollection, Error>> + Send {
        async move {
            if let Err(e) = self.enter(Operation::FindByIds).await {
                return Outcome::Err(e);
            }
            let inner = self.lock();
            let found: EntityCollection = ids
                .iter()
                .filter_map(|id| {
                    inner
                        .identity_map
                        .get(&ObjectKey::new(class, id.clone()))
                        .cloned()
                })
                .collect();
            tracing::debug!(
                class = class.name,
                requested = ids.len(),
                found = found.len(),
                "find_by_ids"
            );
            Outcome::Ok(found)
        }
    }

    fn find(
        &self,
        _cx: &Cx,
        class: &'static EntityClass,
        query: &Query,
    ) -> impl Future<Output = Outcome<EntityCollection, Error>> + Send {
        async move {
            if let Err(e) = self.enter(Operation::Find).await {
                return Outcome::Err(e);
            }
            let inner = self.lock();
            let found: EntityCollection = inner
                .identity_map
                .iter()
                .filter(|(key, entity)| key.class == class.name && query.matches(entity))
                .map(|(_, entity)| entity.clone())
                .collect();
            tracing::debug!(
                class = class.name,
                filters = query.filters().len(),
                found = found.len(),
                "find"
            );
            Outcome::Ok(found)
        }
    }

    fn save(&self, _cx: &Cx, entity: &EntityRef) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            if let Err(e) = self.enter(Operation::Save).await {
                return Outcome::Err(e);
            }
            let id = self.insert(entity);
            tracing::debug!(class = entity.class().name, id = %id, "save");
            Outcome::Ok(())
        }
    }

    fn delete(
        &self,
        _cx: &Cx,
        entity: &EntityRef,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            if let Err(e) = self.enter(Operation::Delete).await {
                return Outcome::Err(e);
            }
            if let Some(key) = ObjectKey::from_entity(entity) {
                let mut inner = self.lock();
                if inner
                    .identity_map
                    .get(&key)
                    .is_some_and(|stored| stored.same(entity))
                {
                    inner.identity_map.remove(&key);
                }
                tracing::debug!(class = key.class, id = %key.id, "delete");
            }
            entity.mark_deleted();
            Outcome::Ok(())
        }
    }
}

/// Suspend once, waking immediately.
async fn yield_now() {
    let mut yielded = false;
    std::future::poll_fn(|task| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            task.waker().wake_by_ref();
            Poll::Pending
        }
    })
    .await;
}

// ============================================================================
// Unit Tests
// ============================================================================
