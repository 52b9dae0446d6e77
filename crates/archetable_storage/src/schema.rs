//! Component and relationship metadata.
//!
//! A schema decides whether an id carries data, how that data is validated,
//! where it is stored, and which lifecycle hooks run when rows move.

use std::fmt;
use std::sync::Arc;

use archetable_foundation::{EntityId, Error, ErrorKind, Result, Type, Value};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Where the data of a component lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Storage {
    /// In the table type, with a column in every table that has it.
    #[default]
    Table,
    /// In the table type, but data is kept in the id record's sparse set.
    Sparse,
    /// Never part of a table type. Presence and data live only in the id
    /// record's sparse set, so adding or removing never moves the entity.
    DontFragment,
}

impl Storage {
    /// Returns true if adding the id changes the entity's table.
    #[must_use]
    pub const fn fragments(self) -> bool {
        !matches!(self, Self::DontFragment)
    }

    /// Returns true if data lives in a sparse set.
    #[must_use]
    pub const fn is_sparse(self) -> bool {
        matches!(self, Self::Sparse | Self::DontFragment)
    }
}

/// Lifecycle callbacks for component values.
#[derive(Clone, Copy, Default)]
pub struct ComponentHooks {
    /// Produces the value for a freshly added component.
    pub ctor: Option<fn() -> Value>,
    /// Applied to a value when its row moves to another table.
    pub on_move: Option<fn(EntityId, Value) -> Value>,
    /// Produces the copy used when an entity is cloned.
    pub on_copy: Option<fn(&Value) -> Value>,
    /// Observes a value right before it is dropped.
    pub on_remove: Option<fn(EntityId, &Value)>,
}

impl fmt::Debug for ComponentHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHooks")
            .field("ctor", &self.ctor.is_some())
            .field("on_move", &self.on_move.is_some())
            .field("on_copy", &self.on_copy.is_some())
            .field("on_remove", &self.on_remove.is_some())
            .finish()
    }
}

/// Metadata registered with a component entity.
#[derive(Clone, Debug)]
pub struct ComponentSchema {
    /// Component name (e.g. `Position`).
    pub name: Arc<str>,
    /// Declared fields. With none, any value is accepted.
    pub fields: Vec<FieldSchema>,
    /// Tags have no column and no sparse slot.
    pub is_tag: bool,
    /// Storage policy.
    pub storage: Storage,
    /// Lifecycle hooks.
    pub hooks: ComponentHooks,
}

impl ComponentSchema {
    /// Creates a component schema. Without fields, any value is accepted.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            is_tag: false,
            storage: Storage::Table,
            hooks: ComponentHooks::default(),
        }
    }

    /// A component with no data.
    #[must_use]
    pub fn tag(name: impl Into<Arc<str>>) -> Self {
        Self {
            is_tag: true,
            ..Self::new(name)
        }
    }

    /// Declares one more field.
    #[must_use]
    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    /// Sets the storage policy.
    #[must_use]
    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    /// Sets lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: ComponentHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Declared field `name`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| &*f.name == name)
    }

    /// Returns true if values are stored for this component.
    #[must_use]
    pub const fn has_data(&self) -> bool {
        !self.is_tag
    }

    /// Value a freshly added component starts with.
    #[must_use]
    pub fn default_value(&self) -> Value {
        if let Some(ctor) = self.hooks.ctor {
            return ctor();
        }
        if self.fields.is_empty() {
            return Value::Nil;
        }
        Value::record(
            self.fields
                .iter()
                .map(|f| (f.name.clone(), f.default.clone().unwrap_or_default())),
        )
    }

    /// Checks a value against the declared fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a record when fields are
    /// declared, names an undeclared field, lacks a required field, or holds
    /// a field of the wrong type.
    pub fn validate(&self, value: &Value) -> Result<()> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let Some(record) = value.as_record() else {
            return Err(Error::type_mismatch(Type::Record, Type::of(value)));
        };
        for (name, field_value) in record {
            let Some(field) = self.field(name) else {
                return Err(Error::new(ErrorKind::FieldNotFound {
                    component: self.name.to_string(),
                    field: name.to_string(),
                }));
            };
            if !field.ty.check(field_value) {
                return Err(Error::type_mismatch(field.ty.clone(), Type::of(field_value)));
            }
        }
        for field in self.fields.iter().filter(|f| f.required) {
            if record.get(&*field.name).is_none_or(Value::is_nil) {
                return Err(Error::new(ErrorKind::MissingField {
                    component: self.name.to_string(),
                    field: field.name.to_string(),
                }));
            }
        }
        Ok(())
    }
}

/// One declared field of a record component.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSchema {
    /// Key in the record value.
    pub name: Arc<str>,
    /// Checked on every write.
    pub ty: Type,
    /// Value used when the component is added without data.
    pub default: Option<Value>,
    /// A required field must be present and non-nil in written values.
    pub required: bool,
}

impl FieldSchema {
    /// A field every write must supply.
    #[must_use]
    pub fn required(name: impl Into<Arc<str>>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
            required: true,
        }
    }

    /// A field that falls back to `default`.
    #[must_use]
    pub fn optional(name: impl Into<Arc<str>>, ty: Type, default: Value) -> Self {
        Self {
            name: name.into(),
            ty,
            default: Some(default),
            required: false,
        }
    }
}

/// Metadata registered with a relationship entity, the first element of
/// its pairs.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipSchema {
    /// Relationship name (e.g. `ChildOf`, `Likes`).
    pub name: Arc<str>,
    /// How many targets one source may have.
    pub cardinality: Cardinality,
    /// What happens when an exclusive relationship gets a second target.
    pub on_violation: OnViolation,
    /// What happens to sources when a target entity is deleted.
    pub on_target_delete: OnDelete,
    /// Whether queries may traverse this relationship upwards.
    pub traversable: bool,
}

impl RelationshipSchema {
    /// Many-to-many, replacing on violation, removing pairs when a target
    /// dies, not traversable.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            cardinality: Cardinality::ManyToMany,
            on_violation: OnViolation::Replace,
            on_target_delete: OnDelete::Remove,
            traversable: false,
        }
    }

    /// Sets [`Self::cardinality`].
    #[must_use]
    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    /// Sets [`Self::on_violation`].
    #[must_use]
    pub fn with_on_violation(mut self, on_violation: OnViolation) -> Self {
        self.on_violation = on_violation;
        self
    }

    /// Sets the policy applied to sources when a target is destroyed.
    #[must_use]
    pub fn with_on_delete(mut self, on_delete: OnDelete) -> Self {
        self.on_target_delete = on_delete;
        self
    }

    /// Marks the relationship as traversable.
    #[must_use]
    pub fn traversable(mut self) -> Self {
        self.traversable = true;
        self
    }

    /// Returns true if a source may have at most one target.
    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        matches!(self.cardinality, Cardinality::ManyToOne)
    }
}

/// Targets per source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Cardinality {
    /// At most one target. Pairs of the relationship are exclusive.
    ManyToOne,
    /// Any number of targets.
    ManyToMany,
}

/// Cleanup policy for pairs whose target is destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OnDelete {
    /// Remove the pair from every source.
    Remove,
    /// Delete every source as well.
    Cascade,
    /// Refuse to delete the target.
    Error,
}

/// Response to a second target on an exclusive relationship.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OnViolation {
    /// Fail the add.
    Error,
    /// Swap the old pair for the new one.
    Replace,
}
