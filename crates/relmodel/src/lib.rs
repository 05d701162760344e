//! relmodel: lazy, dirty-tracked entity relations.
//!
//! This is the facade crate. It re-exports the entity model from
//! `relmodel-core`, relation values from `relmodel-relation` and the in-memory
//! store from `relmodel-memory`, so applications depend on one crate.
//!
//! # Example
//!
//! ```ignore
//! use relmodel::prelude::*;
//!
//! static CART: EntityClass = EntityClass::new("Cart", &[]);
//! static PRODUCT: EntityClass = EntityClass::new("Product", &[Attribute::scalar("name")]);
//! static CART_ITEM: EntityClass = EntityClass::new(
//!     "CartItem",
//!     &[Attribute::reference("cart", &CART), Attribute::reference("product", &PRODUCT)],
//! );
//! static PRODUCTS: RelationConfig =
//!     RelationConfig::new("products", &PRODUCT, "cart").using(&CART_ITEM, "product");
//!
//! let products = RelationAttributeValue::new(&cart, &PRODUCTS);
//! let current = products.load(&cx, &store).await;
//! ```

pub mod relation;

pub use relmodel_core::{
    Attribute, AttributeKind, ClassAttribute, Cx, EntityClass, EntityCollection, EntityId,
    EntityRef, Error, FieldValue, Outcome, Query, Reference, RelationConfig, RelationError,
    RelationErrorKind, RelationMode, Result, StorageError, StorageErrorKind, Store,
    ValidationError, Value, WeakEntityRef,
};
pub use relmodel_memory::{MemoryStore, MemoryStoreConfig, Operation, StoreStats};
pub use relation::{
    DirtyFlags, LoadRecord, LoadState, N1QueryTracker, N1Stats, RelationAttributeValue,
    RelationDebugInfo, SaveOptions, SaveReport, SetOptions,
};

/// JSON snapshot of a relation value: its debug state plus the current
/// entities and links.
pub fn relation_snapshot(value: &RelationAttributeValue) -> serde_json::Value {
    let state = serde_json::to_value(value.debug_state()).unwrap_or(serde_json::Value::Null);
    serde_json::json!({
        "state": state,
        "current": value.current().map(EntityRef::to_json),
        "current_links": value.current_links().map(EntityRef::to_json),
    })
}

/// Prelude with the types most applications need.
pub mod prelude {
    pub use crate::{
        Attribute, Cx, EntityClass, EntityCollection, EntityId, EntityRef, Error, MemoryStore,
        Outcome, Query, Reference, RelationAttributeValue, RelationConfig, SaveOptions,
        SetOptions, Store, Value,
    };
}
