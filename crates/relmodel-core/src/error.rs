//! Error types for relmodel.
//!
//! A single [`Error`] enum is shared by every crate in the workspace. It is
//! cheap to clone so that one failed relation load can be reported to every
//! caller that was waiting on it.

use std::fmt;

/// The error type for all relmodel operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The storage collaborator failed to fetch, save or delete.
    Storage(StorageError),
    /// An attribute could not be set on an entity.
    Validation(ValidationError),
    /// A relation could not be resolved or reconciled.
    Relation(RelationError),
}

/// Convenience alias for synchronous relmodel results.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a fetch failure reported by a store.
    pub fn fetch(message: impl Into<String>) -> Self {
        Error::Storage(StorageError {
            kind: StorageErrorKind::Fetch,
            message: message.into(),
        })
    }

    /// Shorthand for a delete failure reported by a store.
    pub fn delete(message: impl Into<String>) -> Self {
        Error::Storage(StorageError {
            kind: StorageErrorKind::Delete,
            message: message.into(),
        })
    }

    /// Shorthand for a save failure reported by a store.
    pub fn save(message: impl Into<String>) -> Self {
        Error::Storage(StorageError {
            kind: StorageErrorKind::Save,
            message: message.into(),
        })
    }

    /// Whether this error originated in the storage layer.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    /// The storage error kind, if this is a storage error.
    pub fn storage_kind(&self) -> Option<StorageErrorKind> {
        match self {
            Error::Storage(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Storage(e) => write!(f, "{e}"),
            Error::Validation(e) => write!(f, "{e}"),
            Error::Relation(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::Storage(e)
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Validation(e)
    }
}

impl From<RelationError> for Error {
    fn from(e: RelationError) -> Self {
        Error::Relation(e)
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// `find` / `find_by_ids` failed.
    Fetch,
    /// `save` failed.
    Save,
    /// `delete` failed.
    Delete,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.kind {
            StorageErrorKind::Fetch => "fetch",
            StorageErrorKind::Save => "save",
            StorageErrorKind::Delete => "delete",
        };
        write!(f, "storage {op} failed: {}", self.message)
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Setting an attribute on an entity was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Entity class name.
    pub class: &'static str,
    /// Attribute that was being set.
    pub attribute: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid value for {}.{}: {}",
            self.class, self.attribute, self.message
        )
    }
}

// ============================================================================
// Relation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationError {
    pub kind: RelationErrorKind,
    /// Name of the relation the error belongs to.
    pub relation: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationErrorKind {
    /// The owning entity was dropped while the relation value was still in use.
    OwnerGone,
    /// The owner has no identity yet, but one is required.
    OwnerNotPersisted,
    /// The single-flight load gate could not be acquired.
    LoadGate,
    /// The relation declaration does not match the entity classes.
    Misconfigured,
}

impl RelationError {
    pub fn new(kind: RelationErrorKind, relation: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            relation,
            message: message.into(),
        }
    }
}

impl fmt::Display for RelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relation `{}`: {}", self.relation, self.message)
    }
}
