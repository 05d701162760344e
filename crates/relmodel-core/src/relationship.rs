//! Relation declarations.
//!
//! A relation connects an owner to many entities, either directly (the related
//! entities carry a foreign key pointing at the owner) or through a link class
//! whose instances each record one membership. Declarations are static and
//! built with `const` builders so they can live next to the entity classes.

use crate::entity::{AttributeKind, EntityClass};
use crate::error::{RelationError, RelationErrorKind, Result};

/// How related entities are reached from the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationMode {
    /// Related entities point at the owner through `entities.attribute`.
    Direct,
    /// Link entities point at the owner (`entities.attribute`) and at the
    /// related entity (`using.attribute`).
    Linked,
}

/// A class together with one of its attributes.
#[derive(Debug, Clone, Copy)]
pub struct ClassAttribute {
    pub class: &'static EntityClass,
    pub attribute: &'static str,
}

impl ClassAttribute {
    #[must_use]
    pub const fn new(class: &'static EntityClass, attribute: &'static str) -> Self {
        Self { class, attribute }
    }
}

/// Static descriptor of a to-many relation.
#[derive(Debug, Clone, Copy)]
pub struct RelationConfig {
    /// Name of the relation attribute on the owner (e.g. `"products"`).
    pub name: &'static str,

    /// The related class. In direct mode `attribute` is the foreign key on the
    /// related class; in link mode it is the link attribute pointing at the owner.
    pub entities: ClassAttribute,

    /// Link class and its attribute pointing at the related entity.
    pub using: Option<ClassAttribute>,

    /// Whether the owner stores the ids itself (related ids in direct mode,
    /// link ids in link mode) instead of being found through a foreign key.
    pub to_storage: bool,
}

impl RelationConfig {
    /// Declare a direct relation to `class`, found through `attribute`.
    #[must_use]
    pub const fn new(name: &'static str, class: &'static EntityClass, attribute: &'static str) -> Self {
        Self {
            name,
            entities: ClassAttribute::new(class, attribute),
            using: None,
            to_storage: false,
        }
    }

    /// Route the relation through a link class.
    ///
    /// `attribute` is the link's reference to the related entity.
    #[must_use]
    pub const fn using(mut self, class: &'static EntityClass, attribute: &'static str) -> Self {
        self.using = Some(ClassAttribute::new(class, attribute));
        self
    }

    /// Store ids on the owner.
    #[must_use]
    pub const fn to_storage(mut self, value: bool) -> Self {
        self.to_storage = value;
        self
    }

    /// The active mode, decided by the presence of a link class.
    #[must_use]
    pub const fn mode(&self) -> RelationMode {
        if self.using.is_some() {
            RelationMode::Linked
        } else {
            RelationMode::Direct
        }
    }

    #[must_use]
    pub const fn is_linked(&self) -> bool {
        self.using.is_some()
    }

    /// Check the declaration against the entity classes.
    ///
    /// In link mode the link class must declare both attributes as references,
    /// the target one pointing at the related class. In direct mode the related
    /// class must declare the foreign key unless ids live on the owner.
    pub fn validate(&self) -> Result<()> {
        let misconfigured =
            |message: String| RelationError::new(RelationErrorKind::Misconfigured, self.name, message);

        if let Some(using) = self.using {
            let link = using.class;
            for attribute in [self.entities.attribute, using.attribute] {
                match link.attribute(attribute) {
                    Some((_, attr)) if matches!(attr.kind, AttributeKind::Reference(_)) => {}
                    _ => {
                        return Err(misconfigured(format!(
                            "link class {} has no reference attribute `{attribute}`",
                            link.name
                        ))
                        .into());
                    }
                }
            }
            if let Some((_, attr)) = link.attribute(using.attribute) {
                if let AttributeKind::Reference(target) = attr.kind {
                    if target != self.entities.class {
                        return Err(misconfigured(format!(
                            "{}.{} points at {}, expected {}",
                            link.name, using.attribute, target.name, self.entities.class.name
                        ))
                        .into());
                    }
                }
            }
        } else if !self.to_storage && self.entities.class.attribute(self.entities.attribute).is_none() {
            return Err(misconfigured(format!(
                "{} has no attribute `{}`",
                self.entities.class.name, self.entities.attribute
            ))
            .into());
        }
        Ok(())
    }
}
