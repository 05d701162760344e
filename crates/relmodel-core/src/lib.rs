//! Core types and traits for relmodel.
//!
//! `relmodel-core` is the **foundation layer** of the workspace. It defines the
//! entity model and the storage contract that the relation resolver builds on.
//!
//! # Role In The Architecture
//!
//! - **Entity model**: `EntityRef` handles with instance identity, static
//!   `EntityClass` descriptors, and `Reference` slots that are either resolved
//!   entities or raw ids.
//! - **Containers**: `EntityCollection`, the ordered sequence every relation
//!   operation consumes and produces.
//! - **Contracts**: `Store` is implemented by persistence engines;
//!   `RelationConfig` declares how an owner reaches its related entities.
//! - **Structured concurrency**: re-exports `Cx` and `Outcome` from asupersync so
//!   every suspending operation is cancel-correct and budget-aware.
//!
//! # Who Uses This Crate
//!
//! - `relmodel-relation` resolves and reconciles relations on top of these types.
//! - `relmodel-memory` implements `Store` in memory.
//! - Applications normally go through the `relmodel` facade.

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod collection;
pub mod entity;
pub mod error;
pub mod fields_set;
pub mod relationship;
pub mod store;
pub mod value;

pub use collection::EntityCollection;
pub use entity::{
    Attribute, AttributeKind, EntityClass, EntityRef, FieldValue, Reference, WeakEntityRef,
};
pub use error::{
    Error, RelationError, RelationErrorKind, Result, StorageError, StorageErrorKind,
    ValidationError,
};
pub use fields_set::FieldsSet;
pub use relationship::{ClassAttribute, RelationConfig, RelationMode};
pub use store::{Query, Store};
pub use value::{EntityId, Value};
