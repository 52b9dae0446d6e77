//! Component ids and relationship pairs.
//!
//! An [`Id`] is what a table type is made of: either a plain entity used as a
//! component or tag, or a `(first, second)` pair expressing a relationship.
//! Pairs pack both element indices into one word so that ids stay `Copy` and
//! sort cheaply; generations are dropped in the process.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;

/// Reserved entities created by every world.
pub mod builtin {
    use crate::entity::EntityId;

    /// The `*` wildcard. Matches every id, and in pair position every element.
    pub const WILDCARD: EntityId = EntityId::new(1, 0);

    /// The `_` wildcard. Like [`WILDCARD`] but matches at most once per table.
    pub const ANY: EntityId = EntityId::new(2, 0);

    /// Hierarchy relationship: exclusive, traversable, cascades on delete.
    pub const CHILD_OF: EntityId = EntityId::new(3, 0);

    /// First index handed out to user entities.
    pub const FIRST_USER_INDEX: u32 = 16;
}

/// A plain id or a relationship pair.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Id(u64);

impl Id {
    /// Flag bit set on every pair.
    pub const PAIR: u64 = 1 << 63;

    const FIRST_MASK: u64 = 0x7FFF_FFFF;

    /// The `*` id.
    pub const WILDCARD: Self = Self::entity(builtin::WILDCARD);

    /// The `_` id.
    pub const ANY: Self = Self::entity(builtin::ANY);

    /// The `(*, *)` pair.
    pub const ALL_PAIRS: Self = Self::pair(builtin::WILDCARD, builtin::WILDCARD);

    /// Uses an entity as a plain component or tag id.
    #[must_use]
    pub const fn entity(entity: EntityId) -> Self {
        Self(entity.to_bits())
    }

    /// Builds a `(first, second)` pair.
    ///
    /// # Panics
    ///
    /// Panics if the first element's index does not fit in 31 bits.
    #[must_use]
    pub const fn pair(first: EntityId, second: EntityId) -> Self {
        assert!(
            (first.index() as u64) <= Self::FIRST_MASK,
            "pair first element out of range"
        );
        Self(Self::PAIR | ((first.index() as u64) << 32) | second.index() as u64)
    }

    /// Builds a `(first, second)` pair, or `None` if the first element's
    /// index does not fit in 31 bits.
    #[must_use]
    pub const fn try_pair(first: EntityId, second: EntityId) -> Option<Self> {
        if first.index() as u64 > Self::FIRST_MASK {
            return None;
        }
        Some(Self::pair(first, second))
    }

    /// Reinterprets raw bits as an id.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Returns true for pairs.
    #[must_use]
    pub const fn is_pair(self) -> bool {
        self.0 & Self::PAIR != 0
    }

    /// Returns the entity behind a plain id.
    #[must_use]
    pub const fn as_entity(self) -> Option<EntityId> {
        if self.is_pair() {
            None
        } else {
            Some(EntityId::from_bits(self.0))
        }
    }

    /// Returns the first element of a pair (generation stripped).
    #[must_use]
    pub const fn first(self) -> Option<EntityId> {
        if self.is_pair() {
            #[allow(clippy::cast_possible_truncation)]
            let index = ((self.0 >> 32) & Self::FIRST_MASK) as u32;
            Some(EntityId::new(index, 0))
        } else {
            None
        }
    }

    /// Returns the second element of a pair (generation stripped).
    #[must_use]
    pub const fn second(self) -> Option<EntityId> {
        if self.is_pair() {
            #[allow(clippy::cast_possible_truncation)]
            let index = (self.0 & EntityId::INDEX_MASK) as u32;
            Some(EntityId::new(index, 0))
        } else {
            None
        }
    }

    /// Returns the entity that carries this id's component metadata: the id
    /// itself for plain ids, the first element for pairs.
    #[must_use]
    pub fn type_entity(self) -> EntityId {
        match self.first() {
            Some(first) => first,
            None => EntityId::from_bits(self.0),
        }
    }

    /// Returns true if the id is or contains `*` or `_`.
    #[must_use]
    pub fn is_wildcard(self) -> bool {
        if let (Some(first), Some(second)) = (self.first(), self.second()) {
            is_wild(first) || is_wild(second)
        } else {
            is_wild(EntityId::from_bits(self.0))
        }
    }

    /// Returns true if the id is or contains `_`.
    #[must_use]
    pub fn has_any(self) -> bool {
        if let (Some(first), Some(second)) = (self.first(), self.second()) {
            first == builtin::ANY || second == builtin::ANY
        } else {
            self == Self::ANY
        }
    }

    /// Returns true if `self`, possibly a wildcard, matches the concrete `id`.
    #[must_use]
    pub fn matches(self, id: Id) -> bool {
        if self == id {
            return true;
        }
        if self == Self::WILDCARD || self == Self::ANY {
            return true;
        }
        match (self.first(), self.second(), id.first(), id.second()) {
            (Some(pf), Some(ps), Some(f), Some(s)) => {
                (is_wild(pf) || pf == f) && (is_wild(ps) || ps == s)
            }
            _ => false,
        }
    }
}

fn is_wild(e: EntityId) -> bool {
    e.strip_generation() == builtin::WILDCARD || e.strip_generation() == builtin::ANY
}

impl From<EntityId> for Id {
    fn from(entity: EntityId) -> Self {
        Self::entity(entity)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn element(e: EntityId) -> String {
            if e == builtin::WILDCARD {
                "*".to_string()
            } else if e == builtin::ANY {
                "_".to_string()
            } else {
                e.to_string()
            }
        }
        match (self.first(), self.second()) {
            (Some(first), Some(second)) => write!(f, "({}, {})", element(first), element(second)),
            _ => write!(f, "{}", element(EntityId::from_bits(self.0))),
        }
    }
}
