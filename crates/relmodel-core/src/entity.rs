//! Entities, entity classes and references between entities.
//!
//! An [`EntityRef`] is a shared handle to one in-memory entity instance.
//! Two handles denote the same entity iff they point at the same instance
//! ([`EntityRef::same`]); equal ids alone are not enough. Stores are expected
//! to keep an identity map so that fetching the same row twice yields the
//! same instance.
//!
//! Relation-valued attributes hold a [`Reference`], which is either a resolved
//! entity or a raw id still awaiting resolution.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use asupersync::{Cx, Outcome};

use crate::error::{Error, Result, ValidationError};
use crate::fields_set::FieldsSet;
use crate::store::Store;
use crate::value::{EntityId, Value};

// ============================================================================
// Entity classes
// ============================================================================

/// Kind of a declared attribute.
#[derive(Debug, Clone, Copy)]
pub enum AttributeKind {
    /// Plain value.
    Scalar,
    /// Reference to a single entity of the given class.
    Reference(&'static EntityClass),
}

/// A declared attribute of an entity class.
#[derive(Debug, Clone, Copy)]
pub struct Attribute {
    pub name: &'static str,
    pub kind: AttributeKind,
}

impl Attribute {
    #[must_use]
    pub const fn scalar(name: &'static str) -> Self {
        Self {
            name,
            kind: AttributeKind::Scalar,
        }
    }

    #[must_use]
    pub const fn reference(name: &'static str, class: &'static EntityClass) -> Self {
        Self {
            name,
            kind: AttributeKind::Reference(class),
        }
    }
}

/// Static descriptor of an entity class.
///
/// ```ignore
/// static PRODUCT: EntityClass = EntityClass::new("Product", &[Attribute::scalar("name")]);
/// static CART_ITEM: EntityClass = EntityClass::new(
///     "CartItem",
///     &[Attribute::reference("cart", &CART), Attribute::reference("product", &PRODUCT)],
/// );
/// ```
pub struct EntityClass {
    pub name: &'static str,
    pub attributes: &'static [Attribute],
}

impl EntityClass {
    #[must_use]
    pub const fn new(name: &'static str, attributes: &'static [Attribute]) -> Self {
        Self { name, attributes }
    }

    /// Look up an attribute and its position.
    pub fn attribute(&self, name: &str) -> Option<(usize, &Attribute)> {
        self.attributes
            .iter()
            .enumerate()
            .find(|(_, attr)| attr.name == name)
    }

    /// Create a new, not yet persisted instance of this class.
    pub fn instantiate(&'static self) -> EntityRef {
        EntityRef::new(self)
    }
}

impl fmt::Debug for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Attribute kinds may point back at this class.
        f.debug_struct("EntityClass")
            .field("name", &self.name)
            .field(
                "attributes",
                &self.attributes.iter().map(|a| a.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl PartialEq for EntityClass {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for EntityClass {}

// ============================================================================
// References and field values
// ============================================================================

/// A relation-valued slot: either a resolved entity or a raw id.
#[derive(Clone)]
pub enum Reference {
    Entity(EntityRef),
    Id(EntityId),
}

impl Reference {
    /// The id this reference points at, if known.
    pub fn id(&self) -> Option<EntityId> {
        match self {
            Reference::Entity(e) => e.id(),
            Reference::Id(id) => Some(id.clone()),
        }
    }

    /// The resolved entity, if any.
    pub fn entity(&self) -> Option<&EntityRef> {
        match self {
            Reference::Entity(e) => Some(e),
            Reference::Id(_) => None,
        }
    }

    /// Whether both references denote the same target.
    ///
    /// Resolved entities compare by instance. Otherwise ids are compared, and
    /// an entity without an id never equals a raw id.
    pub fn same_target(&self, other: &Reference) -> bool {
        match (self, other) {
            (Reference::Entity(a), Reference::Entity(b)) => a.same(b),
            (a, b) => match (a.id(), b.id()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Entity(e) => write!(f, "Entity({e:?})"),
            Reference::Id(id) => write!(f, "Id({id})"),
        }
    }
}

impl From<EntityRef> for Reference {
    fn from(e: EntityRef) -> Self {
        Reference::Entity(e)
    }
}

impl From<&EntityRef> for Reference {
    fn from(e: &EntityRef) -> Self {
        Reference::Entity(e.clone())
    }
}

impl From<EntityId> for Reference {
    fn from(id: EntityId) -> Self {
        Reference::Id(id)
    }
}

/// Value held by an entity attribute.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Scalar(Value),
    Reference(Reference),
}

impl FieldValue {
    fn same(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Scalar(a), FieldValue::Scalar(b)) => a == b,
            (FieldValue::Reference(a), FieldValue::Reference(b)) => a.same_target(b),
            _ => false,
        }
    }

    /// Whether this value equals a query operand.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldValue::Scalar(v) => v == value,
            FieldValue::Reference(r) => r.id().is_some_and(|id| Value::from(id) == *value),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Scalar(v) => v.to_json(),
            FieldValue::Reference(r) => r
                .id()
                .map_or(serde_json::Value::Null, |id| Value::from(id).to_json()),
        }
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Scalar(v)
    }
}

impl From<Reference> for FieldValue {
    fn from(r: Reference) -> Self {
        FieldValue::Reference(r)
    }
}

impl From<EntityRef> for FieldValue {
    fn from(e: EntityRef) -> Self {
        FieldValue::Reference(Reference::Entity(e))
    }
}

impl From<&EntityRef> for FieldValue {
    fn from(e: &EntityRef) -> Self {
        FieldValue::Reference(Reference::Entity(e.clone()))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Scalar(Value::from(v))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Scalar(Value::from(v))
    }
}

// ============================================================================
// Entity handle
// ============================================================================

struct EntityState {
    id: Option<EntityId>,
    existing: bool,
    values: Vec<Option<FieldValue>>,
    dirty: FieldsSet,
}

struct EntityData {
    class: &'static EntityClass,
    state: RwLock<EntityState>,
}

/// Shared handle to an entity instance.
#[derive(Clone)]
pub struct EntityRef(Arc<EntityData>);

/// Non-owning handle, used where a strong back-pointer would form a cycle.
#[derive(Clone)]
pub struct WeakEntityRef(Weak<EntityData>);

impl WeakEntityRef {
    pub fn upgrade(&self) -> Option<EntityRef> {
        self.0.upgrade().map(EntityRef)
    }
}

impl fmt::Debug for WeakEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(e) => write!(f, "Weak({e:?})"),
            None => f.write_str("Weak(<dropped>)"),
        }
    }
}

impl EntityRef {
    /// Create a new entity that does not exist in storage yet.
    pub fn new(class: &'static EntityClass) -> Self {
        Self(Arc::new(EntityData {
            class,
            state: RwLock::new(EntityState {
                id: None,
                existing: false,
                values: vec![None; class.attributes.len()],
                dirty: FieldsSet::empty(class.attributes.len()),
            }),
        }))
    }

    /// Build an existing, clean entity from stored data.
    ///
    /// Stores call this when materializing rows.
    pub fn hydrate<'a>(
        class: &'static EntityClass,
        id: EntityId,
        values: impl IntoIterator<Item = (&'a str, FieldValue)>,
    ) -> Result<Self> {
        let entity = Self::new(class);
        for (name, value) in values {
            entity.set(name, value)?;
        }
        entity.mark_saved(id);
        Ok(entity)
    }

    fn read(&self) -> RwLockReadGuard<'_, EntityState> {
        self.0.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityState> {
        self.0.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn class(&self) -> &'static EntityClass {
        self.0.class
    }

    pub fn id(&self) -> Option<EntityId> {
        self.read().id.clone()
    }

    /// Whether the entity has been persisted (and not deleted since).
    pub fn is_existing(&self) -> bool {
        self.read().existing
    }

    /// Whether any attribute changed since the entity was last persisted.
    pub fn is_dirty(&self) -> bool {
        self.read().dirty.any()
    }

    /// Names of the attributes changed since the entity was last persisted.
    pub fn dirty_attributes(&self) -> Vec<&'static str> {
        let state = self.read();
        state
            .dirty
            .iter()
            .map(|idx| self.0.class.attributes[idx].name)
            .collect()
    }

    /// Same instance?
    pub fn same(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Opaque key identifying this instance; equal iff [`EntityRef::same`].
    pub fn instance_key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn downgrade(&self) -> WeakEntityRef {
        WeakEntityRef(Arc::downgrade(&self.0))
    }

    /// Set an attribute, flagging it dirty if the value changed.
    pub fn set(&self, attribute: &str, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        let class = self.0.class;
        let Some((idx, attr)) = class.attribute(attribute) else {
            return Err(self.invalid(attribute, "unknown attribute"));
        };

        match (&attr.kind, &value) {
            (AttributeKind::Scalar, FieldValue::Scalar(_)) => {}
            (AttributeKind::Reference(target), FieldValue::Reference(reference)) => {
                if let Some(entity) = reference.entity() {
                    if entity.class() != *target {
                        return Err(self.invalid(
                            attribute,
                            format!(
                                "expected a {} reference, got {}",
                                target.name,
                                entity.class().name
                            ),
                        ));
                    }
                }
            }
            (AttributeKind::Scalar, FieldValue::Reference(_)) => {
                return Err(self.invalid(attribute, "scalar attribute cannot hold a reference"));
            }
            (AttributeKind::Reference(_), FieldValue::Scalar(_)) => {
                return Err(self.invalid(attribute, "reference attribute needs an entity or id"));
            }
        }

        let mut state = self.write();
        let changed = state.values[idx]
            .as_ref()
            .is_none_or(|current| !current.same(&value));
        state.values[idx] = Some(value);
        if changed {
            state.dirty.set(idx);
        }
        Ok(())
    }

    /// Current value of an attribute.
    pub fn get(&self, attribute: &str) -> Option<FieldValue> {
        let (idx, _) = self.0.class.attribute(attribute)?;
        self.read().values[idx].clone()
    }

    /// Current value of a reference attribute, without resolving it.
    pub fn reference(&self, attribute: &str) -> Option<Reference> {
        match self.get(attribute)? {
            FieldValue::Reference(r) => Some(r),
            FieldValue::Scalar(_) => None,
        }
    }

    /// Resolve a reference attribute to an entity.
    ///
    /// A raw id is fetched through `store` and memoized in place, so later
    /// calls return the same instance without touching storage. Memoizing does
    /// not flag the attribute dirty.
    pub async fn resolve<S: Store>(
        &self,
        cx: &Cx,
        store: &S,
        attribute: &str,
    ) -> Outcome<Option<EntityRef>, Error> {
        let class = self.0.class;
        let Some((idx, attr)) = class.attribute(attribute) else {
            return Outcome::Err(self.invalid(attribute, "unknown attribute"));
        };
        let AttributeKind::Reference(target) = attr.kind else {
            return Outcome::Err(self.invalid(attribute, "not a reference attribute"));
        };

        let id = match self.reference(attribute) {
            None => return Outcome::Ok(None),
            Some(Reference::Entity(e)) => return Outcome::Ok(Some(e)),
            Some(Reference::Id(id)) => id,
        };

        tracing::trace!(
            class = class.name,
            attribute = attribute,
            target = target.name,
            id = %id,
            "Resolving reference"
        );

        let found = match store.find_by_ids(cx, target, std::slice::from_ref(&id)).await {
            Outcome::Ok(found) => found,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let Some(entity) = found.iter().find(|e| e.id().as_ref() == Some(&id)).cloned() else {
            return Outcome::Ok(None);
        };

        let mut state = self.write();
        // Only memoize if nobody replaced the reference while we were fetching.
        if let Some(FieldValue::Reference(Reference::Id(current))) = &state.values[idx] {
            if *current == id {
                state.values[idx] = Some(FieldValue::Reference(Reference::Entity(entity.clone())));
            }
        }
        Outcome::Ok(Some(entity))
    }

    /// Record a successful save: assign the id, mark existing and clean.
    pub fn mark_saved(&self, id: EntityId) {
        let mut state = self.write();
        state.id = Some(id);
        state.existing = true;
        state.dirty.clear_all();
    }

    /// Record a successful delete. The id is kept for diagnostics.
    pub fn mark_deleted(&self) {
        self.write().existing = false;
    }

    /// Snapshot of the entity as JSON (`id` plus every set attribute).
    ///
    /// References are rendered as the referenced id.
    pub fn to_json(&self) -> serde_json::Value {
        let state = self.read();
        let mut map = serde_json::Map::new();
        map.insert(
            "id".to_string(),
            state
                .id
                .as_ref()
                .map_or(serde_json::Value::Null, |id| Value::from(id).to_json()),
        );
        for (attr, value) in self.0.class.attributes.iter().zip(&state.values) {
            if let Some(value) = value {
                map.insert(attr.name.to_string(), value.to_json());
            }
        }
        serde_json::Value::Object(map)
    }

    fn invalid(&self, attribute: &str, message: impl Into<String>) -> Error {
        Error::Validation(ValidationError {
            class: self.0.class.name,
            attribute: attribute.to_string(),
            message: message.into(),
        })
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}#{}", self.0.class.name, id),
            None => write!(f, "{}#<new@{:x}>", self.0.class.name, self.instance_key()),
        }
    }
}
