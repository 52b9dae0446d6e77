//! Component data.
//!
//! Every column slot and sparse set slot holds a [`Value`]. Components with
//! fields store a [`Value::Record`]; tags store nothing at all. Lists and
//! records are persistent, so cloning a row to a new table shares the
//! underlying structure.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;

/// Elements of a [`Value::List`].
pub type ValueList = im::Vector<Value>;

/// Fields of a [`Value::Record`], ordered by name.
pub type Fields = im::OrdMap<Arc<str>, Value>;

/// Data of one component on one entity.
#[derive(Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Value {
    /// No data. Fields without a default start here.
    #[default]
    Nil,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    Str(Arc<str>),
    /// Entity reference.
    Entity(EntityId),
    /// List.
    List(ValueList),
    /// Named fields, e.g. `Position { x, y }`.
    Record(Fields),
}

impl Value {
    /// Builds a record from `(name, value)` pairs.
    pub fn record<K, V, I>(fields: I) -> Self
    where
        K: Into<Arc<str>>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Record(fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Returns true for [`Value::Nil`].
    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Boolean content.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        if let Self::Bool(b) = self { Some(*b) } else { None }
    }

    /// Integer content.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        if let Self::Int(n) = self { Some(*n) } else { None }
    }

    /// Float content, widening integers.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// String content.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        if let Self::Str(s) = self { Some(s) } else { None }
    }

    /// Referenced entity.
    #[must_use]
    pub const fn as_entity(&self) -> Option<EntityId> {
        if let Self::Entity(e) = self { Some(*e) } else { None }
    }

    /// List elements.
    #[must_use]
    pub const fn as_list(&self) -> Option<&ValueList> {
        if let Self::List(items) = self { Some(items) } else { None }
    }

    /// Record fields.
    #[must_use]
    pub const fn as_record(&self) -> Option<&Fields> {
        if let Self::Record(fields) = self { Some(fields) } else { None }
    }

    /// Field `name` of a record.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_record()?.get(name)
    }

    /// Writes field `name` of a record in place, adding it if absent.
    /// Returns false if this is not a record.
    pub fn set_field(&mut self, name: &str, value: impl Into<Value>) -> bool {
        let Self::Record(fields) = self else {
            return false;
        };
        fields.insert(name.into(), value.into());
        true
    }

    /// Copy of this record with field `name` replaced.
    #[must_use]
    pub fn with_field(&self, name: &str, value: impl Into<Value>) -> Self {
        let mut out = self.clone();
        out.set_field(name, value);
        out
    }
}

/// Values of the same kind compare naturally. An integer and a float
/// compare numerically, and are unordered when numerically equal.
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Nil, Self::Nil) => Some(Ordering::Equal),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::Entity(a), Self::Entity(b)) => Some(a.cmp(b)),
            (Self::List(a), Self::List(b)) => a.iter().partial_cmp(b.iter()),
            (Self::Record(a), Self::Record(b)) => a.iter().partial_cmp(b.iter()),
            _ => match self.as_float()?.partial_cmp(&other.as_float()?)? {
                Ordering::Equal => None,
                ordering => Some(ordering),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Entity(e) => write!(f, "{e}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    let sep = if i == 0 { "" } else { ", " };
                    write!(f, "{sep}{item}")?;
                }
                f.write_str("]")
            }
            Self::Record(fields) => {
                f.write_str("{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    let sep = if i == 0 { "" } else { ", " };
                    write!(f, "{sep}{name}: {value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

macro_rules! value_from {
    ($($ty:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from($v: $ty) -> Self {
                $body
            }
        })*
    };
}

value_from! {
    bool => |b| Self::Bool(b),
    i32 => |n| Self::Int(i64::from(n)),
    i64 => |n| Self::Int(n),
    f64 => |n| Self::Float(n),
    &str => |s| Self::Str(s.into()),
    String => |s| Self::Str(s.into()),
    EntityId => |e| Self::Entity(e),
}
