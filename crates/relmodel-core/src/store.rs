//! The storage contract relations resolve against.
//!
//! `Store` is implemented by persistence engines. Every method may suspend and
//! may fail with a storage error; implementations provide their own
//! consistency guarantees.

use std::collections::BTreeMap;
use std::future::Future;

use asupersync::{Cx, Outcome};
use serde::Serialize;

use crate::collection::EntityCollection;
use crate::entity::{EntityClass, EntityRef};
use crate::error::Error;
use crate::value::{EntityId, Value};

/// Equality filter: every listed attribute must equal its value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Query {
    filters: BTreeMap<String, Value>,
}

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an `attribute == value` condition.
    #[must_use]
    pub fn eq(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(attribute.into(), value.into());
        self
    }

    pub fn filters(&self) -> &BTreeMap<String, Value> {
        &self.filters
    }

    /// Whether `entity` satisfies every condition.
    ///
    /// Reference attributes match on the referenced id.
    pub fn matches(&self, entity: &EntityRef) -> bool {
        self.filters.iter().all(|(attribute, expected)| {
            entity
                .get(attribute)
                .is_some_and(|value| value.matches(expected))
        })
    }
}

/// Persistence collaborator used to resolve and reconcile relations.
pub trait Store: Send + Sync {
    /// Fetch entities of `class` by id. Missing ids are skipped.
    fn find_by_ids(
        &self,
        cx: &Cx,
        class: &'static EntityClass,
        ids: &[EntityId],
    ) -> impl Future<Output = Outcome<EntityCollection, Error>> + Send;

    /// Fetch entities of `class` matching `query`.
    fn find(
        &self,
        cx: &Cx,
        class: &'static EntityClass,
        query: &Query,
    ) -> impl Future<Output = Outcome<EntityCollection, Error>> + Send;

    /// Persist an entity, assigning an id if it has none.
    ///
    /// On success the entity is existing and clean.
    fn save(&self, cx: &Cx, entity: &EntityRef) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Remove an entity from storage.
    fn delete(
        &self,
        cx: &Cx,
        entity: &EntityRef,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;
}
