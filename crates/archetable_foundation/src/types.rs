//! Field types checked when component values are written.
//!
//! A [`Type`] describes one field of a component schema. Checking walks the
//! value, so a `List(Int)` rejects a list holding a string anywhere in it.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Declared type of a component field.
#[derive(Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Type {
    /// `true` or `false`.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float. Integers are accepted and widened on read.
    Float,
    /// Shared string.
    String,
    /// Reference to another entity.
    Entity,
    /// List whose every element has the inner type.
    List(Box<Type>),
    /// Nested record. Its own fields are not described.
    Record,
    /// The inner type, or nil.
    Optional(Box<Type>),
    /// Anything, nil included.
    Any,
}

impl Type {
    /// List of `element`.
    #[must_use]
    pub fn list(element: Type) -> Self {
        Self::List(Box::new(element))
    }

    /// `inner` or nil.
    #[must_use]
    pub fn optional(inner: Type) -> Self {
        Self::Optional(Box::new(inner))
    }

    /// The narrowest type describing `value`. Nil is `any?`; a list takes
    /// the type of its first element.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Nil => Self::optional(Self::Any),
            Value::Bool(_) => Self::Bool,
            Value::Int(_) => Self::Int,
            Value::Float(_) => Self::Float,
            Value::Str(_) => Self::String,
            Value::Entity(_) => Self::Entity,
            Value::List(items) => Self::list(items.front().map_or(Self::Any, Self::of)),
            Value::Record(_) => Self::Record,
        }
    }

    /// Returns true if `value` may be stored in a field of this type.
    #[must_use]
    pub fn check(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _)
            | (Self::Optional(_), Value::Nil)
            | (Self::Bool, Value::Bool(_))
            | (Self::Int | Self::Float, Value::Int(_))
            | (Self::Float, Value::Float(_))
            | (Self::String, Value::Str(_))
            | (Self::Entity, Value::Entity(_))
            | (Self::Record, Value::Record(_)) => true,
            (Self::Optional(inner), value) => inner.check(value),
            (Self::List(element), Value::List(items)) => items.iter().all(|v| element.check(v)),
            _ => false,
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::String => f.write_str("string"),
            Self::Entity => f.write_str("entity"),
            Self::List(element) => write!(f, "[{element:?}]"),
            Self::Record => f.write_str("record"),
            Self::Optional(inner) => write!(f, "{inner:?}?"),
            Self::Any => f.write_str("any"),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
