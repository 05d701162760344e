//! Resolution of a relation's initial (persisted) value.
//!
//! The strategy follows the relation mode and where ids live:
//!
//! | mode   | `to_storage` | fetch                                                  |
//! |--------|--------------|--------------------------------------------------------|
//! | linked | yes          | `find_by_ids(using, link ids)`, then each link target   |
//! | linked | no           | `find(using, entities.attribute = owner)`, then targets |
//! | direct | yes          | `find_by_ids(entities, ids)`                            |
//! | direct | no           | `find(entities, entities.attribute = owner)`            |
//!
//! With `to_storage` and no stored ids nothing is fetched.

use asupersync::{Cx, Outcome};

use relmodel_core::{
    EntityClass, EntityCollection, EntityId, EntityRef, Error, Query, Reference, RelationConfig,
    RelationError, RelationErrorKind, Store,
};

/// What a load produced.
#[derive(Debug, Default)]
pub(crate) struct LoadedValue {
    /// Resolved related entities, in storage order.
    pub initial: Vec<Reference>,
    /// Resolved links (link mode only).
    pub links: Option<Vec<Reference>>,
    /// Whether storage was actually queried.
    pub fetched: bool,
}

/// Inputs captured from the relation value before suspending.
pub(crate) struct LoadRequest<'a> {
    pub config: &'a RelationConfig,
    pub owner: &'a EntityRef,
    /// Initial related references (direct `to_storage` ids).
    pub initial: Vec<Reference>,
    /// Initial link references (linked `to_storage` ids).
    pub initial_links: Vec<Reference>,
}

pub(crate) async fn resolve_initial<S: Store>(
    cx: &Cx,
    store: &S,
    request: LoadRequest<'_>,
) -> Outcome<LoadedValue, Error> {
    let config = request.config;

    if let Some(using) = config.using {
        let links = if config.to_storage {
            if request.initial_links.is_empty() {
                return Outcome::Ok(LoadedValue::default());
            }
            match fetch_references(cx, store, using.class, &request.initial_links).await {
                Outcome::Ok(links) => links,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else {
            let owner_id = match owner_identity(config, request.owner) {
                Ok(id) => id,
                Err(e) => return Outcome::Err(e),
            };
            let query = Query::new().eq(config.entities.attribute, owner_id);
            match store.find(cx, using.class, &query).await {
                Outcome::Ok(found) => found,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        let mut initial = Vec::with_capacity(links.len());
        for link in &links {
            match link.resolve(cx, store, using.attribute).await {
                Outcome::Ok(Some(target)) => initial.push(Reference::Entity(target)),
                Outcome::Ok(None) => {
                    tracing::warn!(
                        relation = config.name,
                        link = ?link,
                        "Link target does not resolve; keeping the link as an orphan"
                    );
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        return Outcome::Ok(LoadedValue {
            initial,
            links: Some(links.into_iter().map(Reference::Entity).collect()),
            fetched: true,
        });
    }

    let entities = if config.to_storage {
        if request.initial.is_empty() {
            return Outcome::Ok(LoadedValue::default());
        }
        fetch_references(cx, store, config.entities.class, &request.initial).await
    } else {
        let owner_id = match owner_identity(config, request.owner) {
            Ok(id) => id,
            Err(e) => return Outcome::Err(e),
        };
        let query = Query::new().eq(config.entities.attribute, owner_id);
        store.find(cx, config.entities.class, &query).await
    };

    match entities {
        Outcome::Ok(found) => Outcome::Ok(LoadedValue {
            initial: found.into_iter().map(Reference::Entity).collect(),
            links: None,
            fetched: true,
        }),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// The owner's id, required wherever the relation is found through it.
pub(crate) fn owner_identity(config: &RelationConfig, owner: &EntityRef) -> Result<EntityId, Error> {
    owner.id().ok_or_else(|| {
        RelationError::new(
            RelationErrorKind::OwnerNotPersisted,
            config.name,
            format!("{} has no id yet", owner.class().name),
        )
        .into()
    })
}

/// Turn stored references into entities, keeping their order.
///
/// Already resolved entities are kept as they are; raw ids are fetched in one
/// `find_by_ids` call. Ids that storage does not know are dropped.
async fn fetch_references<S: Store>(
    cx: &Cx,
    store: &S,
    class: &'static EntityClass,
    references: &[Reference],
) -> Outcome<EntityCollection, Error> {
    let ids: Vec<EntityId> = references
        .iter()
        .filter_map(|r| match r {
            Reference::Id(id) => Some(id.clone()),
            Reference::Entity(_) => None,
        })
        .collect();

    let fetched = if ids.is_empty() {
        EntityCollection::new()
    } else {
        match store.find_by_ids(cx, class, &ids).await {
            Outcome::Ok(found) => found,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };

    let mut resolved = EntityCollection::new();
    for reference in references {
        match reference {
            Reference::Entity(e) => resolved.push(e.clone()),
            Reference::Id(id) => match fetched.iter().find(|e| e.id().as_ref() == Some(id)) {
                Some(e) => resolved.push(e.clone()),
                None => {
                    tracing::warn!(class = class.name, id = %id, "Stored id not found");
                }
            },
        }
    }
    Outcome::Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use relmodel_core::{Attribute, Value};
    use relmodel_memory::MemoryStore;

    static CART: EntityClass = EntityClass::new("Cart", &[]);
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

    static LINKED: RelationConfig =
        RelationConfig::new("products", &PRODUCT, "cart").using(&CART_ITEM, "product");
    static LINKED_STORED: RelationConfig = RelationConfig::new("products", &PRODUCT, "cart")
        .using(&CART_ITEM, "product")
        .to_storage(true);
    static DIRECT: RelationConfig = RelationConfig::new("products", &PRODUCT, "cart");
    static DIRECT_STORED: RelationConfig =
        RelationConfig::new("products", &PRODUCT, "cart").to_storage(true);

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn seed(store: &MemoryStore, class: &'static EntityClass, id: i64) -> EntityRef {
        let entity = EntityRef::hydrate(class, EntityId::Int(id), []).unwrap();
        store.insert(&entity);
        entity
    }

    fn seed_link(store: &MemoryStore, id: i64, cart: i64, product: i64) -> EntityRef {
        let link = EntityRef::hydrate(
            &CART_ITEM,
            EntityId::Int(id),
            [
                ("cart", Reference::Id(EntityId::Int(cart)).into()),
                ("product", Reference::Id(EntityId::Int(product)).into()),
            ],
        )
        .unwrap();
        store.insert(&link);
        link
    }

    fn entities(references: &[Reference]) -> Vec<EntityRef> {
        references.iter().filter_map(|r| r.entity().cloned()).collect()
    }

    #[test]
    fn test_linked_find_resolves_targets() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let cart = seed(&store, &CART, 7);
        let product = seed(&store, &PRODUCT, 101);
        let link = seed_link(&store, 1, 7, 101);
        seed_link(&store, 2, 8, 101);

        rt.block_on(async {
            let loaded = unwrap_outcome(
                resolve_initial(
                    &cx,
                    &store,
                    LoadRequest {
                        config: &LINKED,
                        owner: &cart,
                        initial: Vec::new(),
                        initial_links: Vec::new(),
                    },
                )
                .await,
            );
            assert!(loaded.fetched);
            let targets = entities(&loaded.initial);
            assert_eq!(targets.len(), 1);
            assert!(targets[0].same(&product));
            let links = entities(&loaded.links.unwrap());
            assert_eq!(links.len(), 1);
            assert!(links[0].same(&link));
        });

        let stats = store.stats();
        assert_eq!(stats.find, 1);
        assert_eq!(stats.find_by_ids, 1);
    }

    #[test]
    fn test_linked_keeps_orphan_link_without_target() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let cart = seed(&store, &CART, 7);
        seed_link(&store, 1, 7, 404);

        rt.block_on(async {
            let loaded = unwrap_outcome(
                resolve_initial(
                    &cx,
                    &store,
                    LoadRequest {
                        config: &LINKED,
                        owner: &cart,
                        initial: Vec::new(),
                        initial_links: Vec::new(),
                    },
                )
                .await,
            );
            assert!(loaded.initial.is_empty());
            assert_eq!(loaded.links.map(|l| l.len()), Some(1));
        });
    }

    #[test]
    fn test_linked_to_storage_fetches_links_by_id() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let cart = seed(&store, &CART, 7);
        let first = seed(&store, &PRODUCT, 101);
        let second = seed(&store, &PRODUCT, 202);
        seed_link(&store, 1, 7, 101);
        seed_link(&store, 2, 7, 202);

        rt.block_on(async {
            let loaded = unwrap_outcome(
                resolve_initial(
                    &cx,
                    &store,
                    LoadRequest {
                        config: &LINKED_STORED,
                        owner: &cart,
                        initial: Vec::new(),
                        initial_links: vec![
                            Reference::Id(EntityId::Int(2)),
                            Reference::Id(EntityId::Int(1)),
                        ],
                    },
                )
                .await,
            );
            let targets = entities(&loaded.initial);
            assert_eq!(targets.len(), 2);
            assert!(targets[0].same(&second));
            assert!(targets[1].same(&first));
        });
        assert_eq!(store.stats().find, 0);
    }

    #[test]
    fn test_to_storage_without_ids_does_not_fetch() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let cart = seed(&store, &CART, 7);

        rt.block_on(async {
            for config in [&LINKED_STORED, &DIRECT_STORED] {
                let loaded = unwrap_outcome(
                    resolve_initial(
                        &cx,
                        &store,
                        LoadRequest {
                            config,
                            owner: &cart,
                            initial: Vec::new(),
                            initial_links: Vec::new(),
                        },
                    )
                    .await,
                );
                assert!(!loaded.fetched);
                assert!(loaded.initial.is_empty());
            }
        });
        assert_eq!(store.stats().fetches(), 0);
    }

    #[test]
    fn test_direct_find_by_foreign_key() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let cart = seed(&store, &CART, 7);
        let mine = EntityRef::hydrate(
            &PRODUCT,
            EntityId::Int(1),
            [("cart", Reference::Id(EntityId::Int(7)).into())],
        )
        .unwrap();
        store.insert(&mine);
        seed(&store, &PRODUCT, 2);

        rt.block_on(async {
            let loaded = unwrap_outcome(
                resolve_initial(
                    &cx,
                    &store,
                    LoadRequest {
                        config: &DIRECT,
                        owner: &cart,
                        initial: Vec::new(),
                        initial_links: Vec::new(),
                    },
                )
                .await,
            );
            let found = entities(&loaded.initial);
            assert_eq!(found.len(), 1);
            assert!(found[0].same(&mine));
            assert!(loaded.links.is_none());
        });
    }

    #[test]
    fn test_direct_to_storage_keeps_order_and_resolved_entries() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        let cart = seed(&store, &CART, 7);
        let a = seed(&store, &PRODUCT, 1);
        let b = seed(&store, &PRODUCT, 2);
        let fresh = PRODUCT.instantiate();

        rt.block_on(async {
            let loaded = unwrap_outcome(
                resolve_initial(
                    &cx,
                    &store,
                    LoadRequest {
                        config: &DIRECT_STORED,
                        owner: &cart,
                        initial: vec![
                            Reference::Id(EntityId::Int(2)),
                            Reference::Entity(fresh.clone()),
                            Reference::Id(EntityId::Int(99)),
                            Reference::Id(EntityId::Int(1)),
                        ],
                        initial_links: Vec::new(),
                    },
                )
                .await,
            );
            let found = entities(&loaded.initial);
            assert_eq!(found.len(), 3);
            assert!(found[0].same(&b));
            assert!(found[1].same(&fresh));
            assert!(found[2].same(&a));
        });
        assert_eq!(store.stats().find_by_ids, 1);
    }

    #[test]
    fn test_owner_without_id_is_rejected() {
        let owner = CART.instantiate();
        let err = owner_identity(&DIRECT, &owner).unwrap_err();
        assert!(matches!(
            err,
            Error::Relation(RelationError {
                kind: RelationErrorKind::OwnerNotPersisted,
                ..
            })
        ));

        let saved = EntityRef::hydrate(&CART, EntityId::Int(3), []).unwrap();
        assert_eq!(
            Value::from(owner_identity(&DIRECT, &saved).unwrap()),
            Value::BigInt(3)
        );
    }
}
