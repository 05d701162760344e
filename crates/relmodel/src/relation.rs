//! Relation value re-exports.
//!
//! `relmodel::RelationAttributeValue` is the lazily loaded, dirty-tracked value
//! of one to-many relation. The implementation lives in the separate
//! `relmodel-relation` crate. This module exists so the `relmodel` facade can
//! expose it without forcing users to depend on sub-crates directly.

pub use relmodel_relation::{
    DirtyFlags, LoadRecord, LoadState, N1QueryTracker, N1Stats, RelationAttributeValue,
    RelationDebugInfo, SaveOptions, SaveReport, SetOptions,
};
