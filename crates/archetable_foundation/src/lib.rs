//! Core types for Archetable.
//!
//! This crate provides:
//! - [`EntityId`] - Generational entity identifiers
//! - [`Id`] - Component ids and `(first, second)` relationship pairs
//! - [`Value`] - Component data
//! - [`Type`] - Type descriptors for schema validation
//! - [`Error`] - Error types with context

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod entity;
pub mod error;
pub mod id;
pub mod types;
pub mod value;

pub use entity::EntityId;
pub use error::{Error, ErrorCode, ErrorContext, ErrorKind, SemanticLimit};
pub use id::{Id, builtin};
pub use types::Type;
pub use value::{Fields, Value, ValueList};

/// Result type alias using Archetable's error type.
pub type Result<T> = std::result::Result<T, Error>;
