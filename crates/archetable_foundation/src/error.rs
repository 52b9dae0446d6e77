//! Error types for Archetable.
//!
//! Uses `thiserror` for the error definitions. Lookups that legitimately
//! find nothing return `Option` rather than an error.

use std::fmt;

use thiserror::Error;

use crate::entity::EntityId;
use crate::id::Id;
use crate::types::Type;

/// Error returned by fallible world and query operations.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Where it went wrong, when the caller attached it.
    pub context: Option<ErrorContext>,
}

impl Error {
    /// An error without context.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    /// Attaches `context`, replacing any earlier one.
    #[must_use]
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Shorthand for `self.kind.code()`.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.kind.code()
    }

    /// A value that does not fit the declared field type.
    #[must_use]
    pub fn type_mismatch(expected: Type, actual: Type) -> Self {
        Self::new(ErrorKind::TypeMismatch { expected, actual })
    }

    /// An entity that is not alive.
    #[must_use]
    pub fn entity_not_found(id: EntityId) -> Self {
        Self::new(ErrorKind::EntityNotFound(id))
    }

    /// A handle whose generation is behind the entity index.
    #[must_use]
    pub fn stale_entity(id: EntityId) -> Self {
        Self::new(ErrorKind::StaleEntity(id))
    }

    /// An id with no registered component metadata.
    #[must_use]
    pub fn unknown_component(id: Id) -> Self {
        Self::new(ErrorKind::UnknownComponent(id))
    }

    /// An entity that does not have `id`.
    #[must_use]
    pub fn component_not_found(entity: EntityId, id: Id) -> Self {
        Self::new(ErrorKind::ComponentNotFound { entity, id })
    }

    /// Term `index` of a query description is malformed.
    #[must_use]
    pub fn invalid_term(index: usize, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTerm {
            index,
            reason: reason.into(),
        })
    }

    /// The query description as a whole is malformed.
    #[must_use]
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidQuery(reason.into()))
    }

    /// Overlapping reads and writes on one column or sparse set.
    #[must_use]
    pub fn access_conflict(resource: impl Into<String>, stage: usize) -> Self {
        Self::new(ErrorKind::AccessConflict {
            resource: resource.into(),
            stage,
        })
    }

    /// An operation not allowed in the current state.
    #[must_use]
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperation(reason.into()))
    }

    /// A fixed limit was hit.
    #[must_use]
    pub fn limit_exceeded(limit: SemanticLimit) -> Self {
        Self::new(ErrorKind::LimitExceeded(limit))
    }
}

/// Error cases, matched on by callers and tests.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Value does not match a component field's declared type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Declared type.
        expected: Type,
        /// Type of the offending value.
        actual: Type,
    },

    /// Entity was never created.
    #[error("entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Entity handle refers to a retired generation.
    #[error("stale entity reference: {0:?}")]
    StaleEntity(EntityId),

    /// Id is not a registered component or relationship.
    #[error("unknown component: {0}")]
    UnknownComponent(Id),

    /// Component not present on entity.
    #[error("component {id} not found on entity {entity:?}")]
    ComponentNotFound {
        /// The entity that was queried.
        entity: EntityId,
        /// The id that was not found.
        id: Id,
    },

    /// Record field missing or not declared by the schema.
    #[error("field not found: {field} on component {component}")]
    FieldNotFound {
        /// The component name.
        component: String,
        /// The field name.
        field: String,
    },

    /// Required field absent from a value being set.
    #[error("missing required field {field} on component {component}")]
    MissingField {
        /// The component name.
        component: String,
        /// The field name.
        field: String,
    },

    /// Structural mutation attempted while the world is readonly.
    #[error("world is readonly")]
    Readonly,

    /// Overlapping read/write access detected by the conflict counters.
    #[error("access conflict on {resource} (stage {stage})")]
    AccessConflict {
        /// Description of the contended resource.
        resource: String,
        /// Stage that detected the conflict.
        stage: usize,
    },

    /// A single query term is malformed.
    #[error("invalid term {index}: {reason}")]
    InvalidTerm {
        /// Position of the term in the query description.
        index: usize,
        /// Description of the problem.
        reason: String,
    },

    /// The query as a whole is malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Requested cache policy cannot be honored by the query's terms.
    #[error("incompatible cache policy: {0}")]
    IncompatibleCachePolicy(String),

    /// A name is already bound to another entity.
    #[error("name already in use: {0}")]
    DuplicateName(String),

    /// The operation is not valid for the target's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A cleanup policy refused a delete.
    #[error("cannot delete {entity:?}: still used as target of {relationship}")]
    DeleteConstraint {
        /// The entity being deleted.
        entity: EntityId,
        /// The relationship with an `Error` cleanup policy.
        relationship: Id,
    },

    /// A fixed limit was exceeded.
    #[error("limit exceeded: {0}")]
    LimitExceeded(SemanticLimit),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorKind {
    /// Maps the kind onto its structured code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TypeMismatch { .. }
            | Self::FieldNotFound { .. }
            | Self::MissingField { .. }
            | Self::InvalidTerm { .. }
            | Self::InvalidQuery(_)
            | Self::LimitExceeded(_) => ErrorCode::InvalidParameter,
            Self::IncompatibleCachePolicy(_)
            | Self::Readonly
            | Self::DeleteConstraint { .. }
            | Self::DuplicateName(_)
            | Self::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Self::EntityNotFound(_)
            | Self::StaleEntity(_)
            | Self::UnknownComponent(_)
            | Self::ComponentNotFound { .. } => ErrorCode::NotFound,
            Self::AccessConflict { .. } => ErrorCode::Conflict,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// Coarse error codes reported alongside query definition failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A caller-supplied argument is malformed.
    InvalidParameter,
    /// The operation is not allowed in the current state or combination.
    InvalidOperation,
    /// The target does not exist.
    NotFound,
    /// Overlapping access was detected.
    Conflict,
    /// Broken internal invariant.
    Internal,
}

/// Fixed limits that can be exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemanticLimit {
    /// Too many fields in one query.
    MaxFields {
        /// The fixed limit.
        limit: usize,
        /// Fields requested.
        actual: usize,
    },
    /// Too many named variables in one query.
    MaxVariables {
        /// The fixed limit.
        limit: usize,
    },
    /// Relationship traversal exceeded the configured depth.
    MaxTraversalDepth {
        /// The configured limit.
        limit: usize,
    },
}

impl fmt::Display for SemanticLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxFields { limit, actual } => {
                write!(f, "max query fields ({limit}) exceeded: {actual}")
            }
            Self::MaxVariables { limit } => write!(f, "max query variables ({limit}) exceeded"),
            Self::MaxTraversalDepth { limit } => {
                write!(f, "max traversal depth ({limit}) exceeded")
            }
        }
    }
}

/// Optional location data for an [`Error`].
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Rendered query or operation the error came from.
    pub source: Option<String>,
    /// Term index, for query errors.
    pub term: Option<usize>,
    /// Additional notes, innermost first.
    pub notes: Vec<String>,
}

impl ErrorContext {
    /// Empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source description.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the term index.
    #[must_use]
    pub fn with_term(mut self, term: usize) -> Self {
        self.term = Some(term);
        self
    }

    /// Adds a note.
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "in {source}")?;
            if let Some(term) = self.term {
                write!(f, " (term {term})")?;
            }
        }
        for note in &self.notes {
            writeln!(f)?;
            write!(f, "  note: {note}")?;
        }
        Ok(())
    }
}
