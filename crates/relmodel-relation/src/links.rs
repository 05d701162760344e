//! Link reconciliation.
//!
//! Produces one link per current entity, in current order. Existing links are
//! reused when their target resolves to the same instance; each existing link
//! can be claimed once per pass, so an entity listed twice gets a second,
//! fresh link. Link entities therefore cannot carry per-membership data when
//! the relation holds duplicates.

use asupersync::{Cx, Outcome};

use relmodel_core::{
    ClassAttribute, EntityCollection, EntityId, EntityRef, Error, Reference, Store,
};

/// Inputs of one reconciliation pass.
pub(crate) struct LinkPlan<'a> {
    pub relation: &'static str,
    /// Link class and its attribute pointing at the related entity.
    pub using: ClassAttribute,
    /// Link attribute pointing at the owner.
    pub owner_attribute: &'static str,
    pub owner_id: EntityId,
    pub current: &'a EntityCollection,
    pub initial_links: &'a [Reference],
}

/// Result of a reconciliation pass.
#[derive(Debug)]
pub(crate) struct ReconciledLinks {
    /// One link per current entity, in current order.
    pub links: EntityCollection,
    /// Number of existing links reused.
    pub reused: usize,
    /// Number of links instantiated.
    pub created: usize,
}

pub(crate) async fn reconcile_links<S: Store>(
    cx: &Cx,
    store: &S,
    plan: LinkPlan<'_>,
) -> Outcome<ReconciledLinks, Error> {
    // Raw link ids never resolved into entities cannot be claimed.
    let candidates: Vec<&EntityRef> = plan.initial_links.iter().filter_map(Reference::entity).collect();
    let mut claimed = vec![false; candidates.len()];

    let mut links = EntityCollection::new();
    let mut reused = 0;
    let mut created = 0;

    for entity in plan.current {
        let mut matched = None;
        for (idx, link) in candidates.iter().enumerate() {
            if claimed[idx] {
                continue;
            }
            let target = match link.resolve(cx, store, plan.using.attribute).await {
                Outcome::Ok(target) => target,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if target.is_some_and(|t| t.same(entity)) {
                matched = Some(idx);
                break;
            }
        }

        match matched {
            Some(idx) => {
                claimed[idx] = true;
                reused += 1;
                links.push(candidates[idx].clone());
            }
            None => {
                let link = match new_link(&plan, entity) {
                    Ok(link) => link,
                    Err(e) => return Outcome::Err(e),
                };
                created += 1;
                links.push(link);
            }
        }
    }

    tracing::debug!(
        relation = plan.relation,
        links = links.len(),
        reused = reused,
        created = created,
        "Reconciled links"
    );

    Outcome::Ok(ReconciledLinks {
        links,
        reused,
        created,
    })
}

fn new_link(plan: &LinkPlan<'_>, target: &EntityRef) -> Result<EntityRef, Error> {
    let link = plan.using.class.instantiate();
    link.set(plan.using.attribute, target)?;
    link.set(plan.owner_attribute, Reference::Id(plan.owner_id.clone()))?;
    Ok(link)
}
